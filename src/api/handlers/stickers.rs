use axum::{
    extract::{Multipart, Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{DownloadRecord, Sticker, StickerUpdate},
    services::{
        downloads::{BatchOutcome, PgDownloadStore, Requester, TrackOutcome},
        importer::{
            BatchUploadReport, ImportService, MetadataEntry, MetadataImportReport, UploadedFile,
        },
        stickers::{slugify, BulkDeleteReport, StickerQuery, StickersService},
    },
    AppState,
};

const MAX_TRACKED_PER_REQUEST: usize = 100;
const MAX_AUDIT_ROWS: i64 = 500;

pub async fn list_stickers(
    State(state): State<AppState>,
    Query(query): Query<StickerQuery>,
) -> AppResult<Json<Vec<Sticker>>> {
    let stickers_service = StickersService::new(state.db, state.bucket);
    let stickers = stickers_service.list(&query).await?;

    Ok(Json(stickers))
}

pub async fn get_sticker(
    State(state): State<AppState>,
    Path(sticker_id): Path<Uuid>,
) -> AppResult<Json<Sticker>> {
    let stickers_service = StickersService::new(state.db, state.bucket);
    let sticker = stickers_service.get(sticker_id).await?;

    Ok(Json(sticker))
}

pub async fn get_sticker_by_slug(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> AppResult<Json<Sticker>> {
    let stickers_service = StickersService::new(state.db, state.bucket);
    let sticker = stickers_service.get_by_slug(&slug).await?;

    Ok(Json(sticker))
}

pub async fn track_download(
    State(state): State<AppState>,
    Path(sticker_id): Path<Uuid>,
    requester: Requester,
) -> AppResult<Json<TrackOutcome>> {
    let stickers_service = StickersService::new(state.db, state.bucket);
    stickers_service.get(sticker_id).await?;

    let outcome = state
        .tracker
        .track(sticker_id, &requester.ip, requester.user_agent.as_deref())
        .await?;

    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct IdsRequest {
    pub ids: Vec<Uuid>,
}

pub async fn track_downloads(
    State(state): State<AppState>,
    requester: Requester,
    Json(req): Json<IdsRequest>,
) -> AppResult<Json<Vec<BatchOutcome>>> {
    if req.ids.is_empty() {
        return Err(AppError::Validation("No stickers selected".to_string()));
    }
    if req.ids.len() > MAX_TRACKED_PER_REQUEST {
        return Err(AppError::Validation(format!(
            "At most {} downloads can be recorded at once",
            MAX_TRACKED_PER_REQUEST
        )));
    }

    // Only existing stickers get audit rows.
    let stickers_service = StickersService::new(state.db, state.bucket);
    let known: Vec<Uuid> = stickers_service
        .get_many(&req.ids)
        .await?
        .into_iter()
        .map(|s| s.id)
        .collect();

    let outcomes = state
        .tracker
        .track_many(&known, &requester.ip, requester.user_agent.as_deref())
        .await?;

    Ok(Json(outcomes))
}

// Admin

pub async fn create_sticker(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<Sticker>> {
    let mut name = None;
    let mut slug = None;
    let mut tags: Vec<String> = Vec::new();
    let mut file: Option<UploadedFile> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::BadRequest(format!("Failed to read multipart field: {}", e))
    })? {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "name" | "slug" | "tags" => {
                let value = field.text().await.map_err(|e| {
                    AppError::BadRequest(format!("Failed to read {}: {}", field_name, e))
                })?;
                match field_name.as_str() {
                    "name" => name = Some(value),
                    "slug" => slug = Some(value),
                    _ => tags.extend(value.split(',').map(str::to_string)),
                }
            }
            "image" => {
                let file_name = field.file_name().unwrap_or("sticker").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read file: {}", e)))?;
                file = Some(UploadedFile { file_name, data });
            }
            _ => {}
        }
    }

    let file = file.ok_or_else(|| AppError::BadRequest("Image file required".to_string()))?;
    let name = name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| AppError::Validation("Sticker name is required".to_string()))?;
    let slug = slugify(slug.as_deref().unwrap_or(&name));

    let stickers_service = StickersService::new(state.db, state.bucket);
    let sticker = stickers_service
        .create(&name, &slug, &tags, file.data)
        .await?;

    Ok(Json(sticker))
}

pub async fn update_sticker(
    State(state): State<AppState>,
    Path(sticker_id): Path<Uuid>,
    Json(req): Json<StickerUpdate>,
) -> AppResult<Json<Sticker>> {
    if req.name.is_none() && req.slug.is_none() && req.tags.is_none() {
        return Err(AppError::BadRequest("No fields to update".to_string()));
    }

    let stickers_service = StickersService::new(state.db, state.bucket);
    let sticker = stickers_service.update(sticker_id, req).await?;

    Ok(Json(sticker))
}

pub async fn bulk_delete(
    State(state): State<AppState>,
    Json(req): Json<IdsRequest>,
) -> AppResult<Json<BulkDeleteReport>> {
    let stickers_service = StickersService::new(state.db, state.bucket);
    let report = stickers_service.bulk_delete(&req.ids).await?;

    // Pack sticker counts are cached.
    if let Err(e) = state.redis.invalidate_catalog().await {
        tracing::warn!("Failed to invalidate catalog cache: {}", e);
    }

    Ok(Json(report))
}

pub async fn batch_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<BatchUploadReport>> {
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::BadRequest(format!("Failed to read multipart field: {}", e))
    })? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read {}: {}", file_name, e)))?;
        files.push(UploadedFile { file_name, data });
    }

    if files.is_empty() {
        return Err(AppError::BadRequest("At least one file required".to_string()));
    }

    let import_service = ImportService::new(StickersService::new(state.db, state.bucket));
    let report = import_service.batch_upload(files).await;

    Ok(Json(report))
}

pub async fn import_metadata(
    State(state): State<AppState>,
    Json(entries): Json<Vec<MetadataEntry>>,
) -> AppResult<Json<MetadataImportReport>> {
    if entries.is_empty() {
        return Err(AppError::BadRequest("No metadata entries".to_string()));
    }

    let import_service = ImportService::new(StickersService::new(state.db, state.bucket));
    let report = import_service.import_metadata(entries).await;

    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<i64>,
}

pub async fn list_download_records(
    State(state): State<AppState>,
    Path(sticker_id): Path<Uuid>,
    Query(query): Query<AuditQuery>,
) -> AppResult<Json<Vec<DownloadRecord>>> {
    let store = PgDownloadStore::new(state.db);
    let records = store
        .recent(sticker_id, query.limit.unwrap_or(100).clamp(1, MAX_AUDIT_ROWS))
        .await?;

    Ok(Json(records))
}
