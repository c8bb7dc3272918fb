use axum::{
    extract::{Multipart, Path, State},
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{Pack, PackSummary, PackWithStickers},
    packaging::{BulkItem, BulkMode, Progress},
    services::{
        bulk::BulkService,
        downloads::Requester,
        packs::{CreatePackRequest, PacksService, UpdatePackRequest},
    },
    AppState,
};

use super::downloads::output_response;

fn packs_service(state: &AppState) -> PacksService {
    PacksService::new(
        state.db.clone(),
        state.redis.clone(),
        state.config.redis.catalog_ttl,
    )
}

pub async fn list_packs(State(state): State<AppState>) -> AppResult<Json<Vec<PackSummary>>> {
    let packs = packs_service(&state).list_active().await?;
    Ok(Json(packs))
}

pub async fn get_pack(
    State(state): State<AppState>,
    Path(pack_id): Path<Uuid>,
) -> AppResult<Json<PackWithStickers>> {
    let pack = packs_service(&state).get_with_stickers(pack_id).await?;

    // Inactive packs are admin-only.
    if !pack.pack.is_active {
        return Err(AppError::PackNotFound);
    }

    Ok(Json(pack))
}

#[derive(Debug, Default, Deserialize)]
pub struct PackDownloadRequest {
    #[serde(default)]
    pub mode: BulkMode,
}

pub async fn download_pack(
    State(state): State<AppState>,
    Path(pack_id): Path<Uuid>,
    requester: Requester,
    body: Option<Json<PackDownloadRequest>>,
) -> AppResult<Response> {
    let Json(req) = body.unwrap_or_default();

    let pack = packs_service(&state).get_with_stickers(pack_id).await?;
    if !pack.pack.is_active {
        return Err(AppError::PackNotFound);
    }
    if pack.stickers.is_empty() {
        return Err(AppError::Validation("Pack has no stickers".to_string()));
    }

    let items: Vec<BulkItem> = pack.stickers.iter().map(BulkItem::from).collect();
    let bulk = BulkService::new(state.fetcher.clone(), state.tracker.clone(), &state.config.packaging);
    let output = bulk
        .package(
            req.mode,
            Some(&pack.pack.name),
            &items,
            &requester,
            &Progress::none(),
        )
        .await?;

    tracing::info!("Pack {} downloaded as {:?}", pack_id, req.mode);
    Ok(output_response(output))
}

// Admin

pub async fn list_all_packs(State(state): State<AppState>) -> AppResult<Json<Vec<PackSummary>>> {
    let packs = packs_service(&state).list_all().await?;
    Ok(Json(packs))
}

pub async fn get_pack_admin(
    State(state): State<AppState>,
    Path(pack_id): Path<Uuid>,
) -> AppResult<Json<PackWithStickers>> {
    let pack = packs_service(&state).get_with_stickers(pack_id).await?;
    Ok(Json(pack))
}

pub async fn create_pack(
    State(state): State<AppState>,
    Json(req): Json<CreatePackRequest>,
) -> AppResult<Json<Pack>> {
    let pack = packs_service(&state).create(req).await?;
    Ok(Json(pack))
}

pub async fn update_pack(
    State(state): State<AppState>,
    Path(pack_id): Path<Uuid>,
    Json(req): Json<UpdatePackRequest>,
) -> AppResult<Json<Pack>> {
    let pack = packs_service(&state).update(pack_id, req).await?;
    Ok(Json(pack))
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

pub async fn delete_pack(
    State(state): State<AppState>,
    Path(pack_id): Path<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    packs_service(&state).delete(pack_id).await?;

    Ok(Json(MessageResponse {
        message: "Pack deleted".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SetItemsRequest {
    pub sticker_ids: Vec<Uuid>,
}

pub async fn set_pack_items(
    State(state): State<AppState>,
    Path(pack_id): Path<Uuid>,
    Json(req): Json<SetItemsRequest>,
) -> AppResult<Json<PackWithStickers>> {
    let pack = packs_service(&state)
        .set_items(pack_id, &req.sticker_ids)
        .await?;
    Ok(Json(pack))
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub pack_ids: Vec<Uuid>,
}

pub async fn reorder_packs(
    State(state): State<AppState>,
    Json(req): Json<ReorderRequest>,
) -> AppResult<Json<MessageResponse>> {
    if req.pack_ids.is_empty() {
        return Err(AppError::BadRequest("No packs to reorder".to_string()));
    }

    packs_service(&state).reorder(&req.pack_ids).await?;

    Ok(Json(MessageResponse {
        message: "Packs reordered".to_string(),
    }))
}

pub async fn upload_pack_thumbnail(
    State(state): State<AppState>,
    Path(pack_id): Path<Uuid>,
    mut multipart: Multipart,
) -> AppResult<Json<Pack>> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::BadRequest(format!("Failed to read multipart field: {}", e))
    })? {
        let name = field.name().unwrap_or("").to_string();
        if name != "thumbnail" {
            continue;
        }

        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        if !content_type.starts_with("image/") {
            return Err(AppError::BadRequest("Thumbnail must be an image".to_string()));
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read file: {}", e)))?;

        let pack = packs_service(&state)
            .upload_thumbnail(&state.bucket, pack_id, data, &content_type)
            .await?;

        return Ok(Json(pack));
    }

    Err(AppError::BadRequest("Thumbnail file required".to_string()))
}
