use std::collections::{HashMap, HashSet};
use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::{header, HeaderName},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::Sticker,
    packaging::{BulkItem, BulkMode, Progress},
    services::{
        bulk::BulkService,
        downloads::Requester,
        jobs::{JobEvent, JobOutput, JobSummary},
        stickers::StickersService,
    },
    AppState,
};

use super::sse_event;

const FAILURES_HEADER: HeaderName = HeaderName::from_static("x-package-failures");

/// Stickers to package, either as bare ids or as items carrying a custom
/// entry name. Image URLs always come from the catalog.
#[derive(Debug, Default, Deserialize)]
pub struct BulkDownloadRequest {
    #[serde(default)]
    pub ids: Vec<Uuid>,
    #[serde(default)]
    pub items: Vec<BulkItem>,
    #[serde(default)]
    pub mode: BulkMode,
    pub title: Option<String>,
}

async fn resolve_items(state: &AppState, req: &BulkDownloadRequest) -> AppResult<Vec<BulkItem>> {
    let mut seen = HashSet::new();
    let ids: Vec<Uuid> = req
        .ids
        .iter()
        .chain(req.items.iter().map(|item| &item.id))
        .copied()
        .filter(|id| seen.insert(*id))
        .collect();
    if ids.is_empty() {
        return Err(AppError::Validation("No stickers selected".to_string()));
    }

    let stickers_service = StickersService::new(state.db.clone(), state.bucket.clone());
    let stickers: HashMap<Uuid, Sticker> = stickers_service
        .get_many(&ids)
        .await?
        .into_iter()
        .map(|s| (s.id, s))
        .collect();

    let custom_names: HashMap<Uuid, &str> = req
        .items
        .iter()
        .map(|item| (item.id, item.name.as_str()))
        .collect();

    let mut items = Vec::with_capacity(ids.len());
    for id in ids {
        match stickers.get(&id) {
            Some(sticker) => {
                let mut item = BulkItem::from(sticker);
                if let Some(name) = custom_names.get(&id).filter(|n| !n.trim().is_empty()) {
                    item.name = name.to_string();
                }
                items.push(item);
            }
            None => tracing::warn!("Skipping unknown sticker {} in bulk download", id),
        }
    }

    if items.is_empty() {
        return Err(AppError::StickerNotFound);
    }
    Ok(items)
}

/// Zip archives as attachments, individual hand-outs as JSON.
pub(super) fn output_response(output: JobOutput) -> Response {
    match output {
        JobOutput::Archive(archive) => {
            let disposition = format!("attachment; filename=\"{}\"", archive.file_name);
            (
                [
                    (header::CONTENT_TYPE, "application/zip".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                    (FAILURES_HEADER, archive.failures.len().to_string()),
                ],
                archive.data,
            )
                .into_response()
        }
        JobOutput::Individual(downloads) => Json(downloads).into_response(),
    }
}

fn job_stream(
    events: BoxStream<'static, JobEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(events.map(|event| sse_event(event.name(), &event))).keep_alive(KeepAlive::default())
}

pub async fn download_archive(
    State(state): State<AppState>,
    requester: Requester,
    Json(req): Json<BulkDownloadRequest>,
) -> AppResult<Response> {
    let items = resolve_items(&state, &req).await?;

    let bulk = BulkService::new(state.fetcher.clone(), state.tracker.clone(), &state.config.packaging);
    let output = bulk
        .package(
            req.mode,
            req.title.as_deref(),
            &items,
            &requester,
            &Progress::none(),
        )
        .await?;

    Ok(output_response(output))
}

/// Streams one `item_done` event per sticker, paced by the configured delay.
pub async fn download_individual(
    State(state): State<AppState>,
    requester: Requester,
    Json(req): Json<BulkDownloadRequest>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let items = resolve_items(&state, &req).await?;
    let job_id = start(&state, BulkMode::Individual, None, items, requester).await;

    let events = state.jobs.events(job_id).await?;
    Ok(job_stream(events))
}

#[derive(Debug, Serialize)]
pub struct JobCreated {
    pub job_id: Uuid,
}

pub async fn start_job(
    State(state): State<AppState>,
    requester: Requester,
    Json(req): Json<BulkDownloadRequest>,
) -> AppResult<Json<JobCreated>> {
    let items = resolve_items(&state, &req).await?;
    let job_id = start(&state, req.mode, req.title, items, requester).await;

    Ok(Json(JobCreated { job_id }))
}

async fn start(
    state: &AppState,
    mode: BulkMode,
    title: Option<String>,
    items: Vec<BulkItem>,
    requester: Requester,
) -> Uuid {
    let bulk = BulkService::new(state.fetcher.clone(), state.tracker.clone(), &state.config.packaging);

    state
        .jobs
        .spawn(mode, move |progress| async move {
            bulk.package(mode, title.as_deref(), &items, &requester, &progress)
                .await
        })
        .await
}

pub async fn job_summary(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<JobSummary>> {
    let summary = state.jobs.summary(job_id).await?;
    Ok(Json(summary))
}

pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let events = state.jobs.events(job_id).await?;
    Ok(job_stream(events))
}

pub async fn job_result(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Response> {
    let output = state.jobs.result(job_id).await?;
    Ok(output_response(output))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::packaging::{ArchiveOutput, IndividualDownload};

    #[test]
    fn archives_are_served_as_attachments() {
        let response = output_response(JobOutput::Archive(ArchiveOutput {
            file_name: "muppets_sticker_pack.zip".to_string(),
            data: Bytes::from_static(b"PK"),
            entries: vec![],
            packaged_ids: vec![],
            failures: vec!["b: 404".to_string()],
        }));

        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "application/zip");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"muppets_sticker_pack.zip\""
        );
        assert_eq!(headers[FAILURES_HEADER], "1");
    }

    #[test]
    fn individual_results_are_json() {
        let response = output_response(JobOutput::Individual(vec![IndividualDownload {
            id: Uuid::new_v4(),
            file_name: "a.png".to_string(),
            url: "https://cdn.test/a.png".to_string(),
        }]));

        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }
}
