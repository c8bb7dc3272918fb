use std::{net::SocketAddr, sync::Arc};

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod error;
mod imaging;
mod models;
mod packaging;
mod services;
mod storage;

use config::Config;
use imaging::background::{BackgroundRemover, EdgeColorRemover};
use services::{
    downloads::{DownloadTracker, PgDownloadStore},
    jobs::JobHub,
};
use storage::{
    bucket::BucketClient,
    fetch::{AssetFetcher, ImageFetcher},
    redis::RedisClient,
};

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub redis: RedisClient,
    pub bucket: BucketClient,
    pub config: Arc<Config>,
    pub tracker: Arc<DownloadTracker>,
    pub jobs: Arc<JobHub>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub remover: Arc<dyn BackgroundRemover>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sticker_gallery_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load();
    tracing::info!("Starting server in {} mode", config.server.environment);

    // Initialize database pool
    let db = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database_url())
        .await?;
    tracing::info!("Connected to PostgreSQL");

    // Run migrations
    sqlx::migrate!("./migrations").run(&db).await?;
    tracing::info!("Database migrations completed");

    // Initialize Redis
    let redis = RedisClient::new(&config.redis_url()).await?;
    tracing::info!("Connected to Redis");

    // Initialize object storage
    let bucket = BucketClient::new(&config.storage).await?;
    bucket.ensure_bucket().await?;
    tracing::info!("Connected to object storage");

    if config.admin.password_hash.is_empty() || config.admin.jwt_secret.is_empty() {
        tracing::warn!("ADMIN_PASSWORD_HASH or JWT_SECRET is not set, admin routes are disabled");
    }

    let tracker = Arc::new(DownloadTracker::new(
        Arc::new(PgDownloadStore::new(db.clone())),
        &config.tracker,
    ));

    // Initialize packaging job hub
    let jobs = Arc::new(JobHub::new(config.packaging.job_retention));

    // Spawn hub runner
    let jobs_clone = jobs.clone();
    tokio::spawn(async move {
        jobs_clone.run().await;
    });

    // Create app state
    let state = AppState {
        db,
        redis,
        bucket: bucket.clone(),
        config: Arc::new(config.clone()),
        tracker,
        jobs,
        fetcher: Arc::new(AssetFetcher::new(Some(bucket))),
        remover: Arc::new(EdgeColorRemover::default()),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api::router::create_router(state.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(DefaultBodyLimit::max(config.server.max_upload_bytes)),
        )
        .with_state(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}
