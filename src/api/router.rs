use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use super::{handlers, middleware::admin_middleware};
use crate::AppState;

pub fn create_router(state: AppState) -> Router<AppState> {
    // Sticker routes (public)
    let sticker_routes = Router::new()
        .route("/", get(handlers::stickers::list_stickers))
        .route("/downloads", post(handlers::stickers::track_downloads))
        .route("/slug/:slug", get(handlers::stickers::get_sticker_by_slug))
        .route("/:id", get(handlers::stickers::get_sticker))
        .route("/:id/download", post(handlers::stickers::track_download));

    // Pack routes (public)
    let pack_routes = Router::new()
        .route("/", get(handlers::packs::list_packs))
        .route("/:id", get(handlers::packs::get_pack))
        .route("/:id/download", post(handlers::packs::download_pack));

    // Bulk download routes (public)
    let download_routes = Router::new()
        .route("/archive", post(handlers::downloads::download_archive))
        .route("/individual", post(handlers::downloads::download_individual))
        .route("/jobs", post(handlers::downloads::start_job))
        .route("/jobs/:id", get(handlers::downloads::job_summary))
        .route("/jobs/:id/events", get(handlers::downloads::job_events))
        .route("/jobs/:id/result", get(handlers::downloads::job_result));

    // Image tools (public)
    let tool_routes = Router::new()
        .route("/remove-background", post(handlers::tools::remove_background))
        .route("/transparency", post(handlers::tools::check_transparency));

    // Admin login (public)
    let admin_public = Router::new().route("/login", post(handlers::auth::login));

    // Admin routes (protected)
    let admin_protected = Router::new()
        .route("/session", get(handlers::auth::session))
        .route("/stickers", post(handlers::stickers::create_sticker))
        .route("/stickers/:id", put(handlers::stickers::update_sticker))
        .route(
            "/stickers/:id/downloads",
            get(handlers::stickers::list_download_records),
        )
        .route("/stickers/bulk-delete", post(handlers::stickers::bulk_delete))
        .route("/stickers/batch-upload", post(handlers::stickers::batch_upload))
        .route("/stickers/metadata-import", post(handlers::stickers::import_metadata))
        .route(
            "/packs",
            get(handlers::packs::list_all_packs).post(handlers::packs::create_pack),
        )
        .route("/packs/reorder", put(handlers::packs::reorder_packs))
        .route(
            "/packs/:id",
            get(handlers::packs::get_pack_admin)
                .put(handlers::packs::update_pack)
                .delete(handlers::packs::delete_pack),
        )
        .route("/packs/:id/items", put(handlers::packs::set_pack_items))
        .route("/packs/:id/thumbnail", post(handlers::packs::upload_pack_thumbnail))
        .route("/scripts", get(handlers::scripts::list_scripts))
        .route("/scripts/:name/run", post(handlers::scripts::run_script))
        .layer(middleware::from_fn_with_state(state.clone(), admin_middleware));

    // Combine all routes
    Router::new()
        .nest("/stickers", sticker_routes)
        .nest("/packs", pack_routes)
        .nest("/downloads", download_routes)
        .nest("/tools", tool_routes)
        .nest("/admin", admin_public.merge(admin_protected))
        .with_state(state)
}
