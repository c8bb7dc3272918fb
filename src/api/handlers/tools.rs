use axum::{
    extract::{Multipart, State},
    http::{header, HeaderName},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use serde::Serialize;

use crate::{
    error::{AppError, AppResult},
    imaging::{
        background::{
            remove_background as run_removal, ImageSource, ProcessedImage, RemovalOptions,
            RemovalProgress,
        },
        decode, looks_transparent, OutputFormat, TransparencyReport,
    },
    storage::bucket::BucketClient,
    AppState,
};

const MAX_OUTPUT_SIZE: u32 = 2048;

#[derive(Debug, Default)]
struct RemovalForm {
    source: Option<ImageSource>,
    options: RemovalOptions,
    as_data_url: bool,
}

/// Remote sources must live in the sticker bucket; the server never fetches
/// arbitrary hosts on a client's behalf.
fn remote_source(value: String, bucket: &BucketClient) -> AppResult<ImageSource> {
    if value.starts_with("data:") {
        return Ok(ImageSource::DataUrl(value));
    }
    if bucket.key_from_url(&value).is_none() {
        tracing::warn!("Rejected image url outside the sticker bucket: {}", value);
        return Err(AppError::Validation(
            "Only sticker gallery image urls are accepted".to_string(),
        ));
    }
    Ok(ImageSource::Url(value))
}

async fn read_removal_form(
    mut multipart: Multipart,
    bucket: &BucketClient,
) -> AppResult<RemovalForm> {
    let mut form = RemovalForm::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::BadRequest(format!("Failed to read multipart field: {}", e))
    })? {
        let name = field.name().unwrap_or("").to_string();

        if name == "image" {
            let data = field
                .bytes()
                .await
                .map_err(|e| AppError::BadRequest(format!("Failed to read file: {}", e)))?;
            form.source = Some(ImageSource::Bytes(data));
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read {}: {}", name, e)))?;
        let value = value.trim().to_string();

        match name.as_str() {
            "url" if !value.is_empty() => form.source = Some(remote_source(value, bucket)?),
            "size" => {
                let size: u32 = value
                    .parse()
                    .map_err(|_| AppError::Validation(format!("Invalid size: {}", value)))?;
                if size == 0 || size > MAX_OUTPUT_SIZE {
                    return Err(AppError::Validation(format!(
                        "Size must be between 1 and {}",
                        MAX_OUTPUT_SIZE
                    )));
                }
                form.options.size = size;
            }
            "format" => {
                form.options.format = match value.to_ascii_lowercase().as_str() {
                    "png" => OutputFormat::Png,
                    "webp" => OutputFormat::Webp,
                    other => {
                        return Err(AppError::Validation(format!("Unsupported format: {}", other)))
                    }
                };
            }
            "quality" => {
                let quality: f32 = value
                    .parse()
                    .map_err(|_| AppError::Validation(format!("Invalid quality: {}", value)))?;
                form.options.quality = quality.clamp(0.0, 100.0);
            }
            "output" => form.as_data_url = value == "data_url",
            _ => {}
        }
    }

    Ok(form)
}

#[derive(Debug, Serialize)]
pub struct DataUrlResponse {
    pub data_url: String,
    #[serde(flatten)]
    pub image: ProcessedImage,
}

/// Strips the background of an uploaded image (`image`) or a remote one
/// (`url`, plain or `data:`).
pub async fn remove_background(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Response> {
    let form = read_removal_form(multipart, &state.bucket).await?;
    let source = form
        .source
        .ok_or_else(|| AppError::BadRequest("Image file or url required".to_string()))?;

    let progress = |p: RemovalProgress| {
        tracing::debug!("Background removal {}: {}/{}", p.stage, p.current, p.total);
    };
    let processed = run_removal(
        &source,
        &*state.fetcher,
        &*state.remover,
        form.options,
        &progress,
    )
    .await?;

    tracing::info!(
        "Removed background with {} ({} -> {} bytes, {}ms)",
        processed.engine,
        processed.original_size,
        processed.processed_size,
        processed.elapsed_ms
    );

    if form.as_data_url {
        let data_url = format!(
            "data:{};base64,{}",
            processed.format.content_type(),
            BASE64.encode(&processed.data)
        );
        return Ok(Json(DataUrlResponse {
            data_url,
            image: processed,
        })
        .into_response());
    }

    Ok(image_response(processed))
}

fn image_response(processed: ProcessedImage) -> Response {
    let disposition = format!(
        "inline; filename=\"processed.{}\"",
        processed.format.extension()
    );
    (
        [
            (
                header::CONTENT_TYPE,
                processed.format.content_type().to_string(),
            ),
            (header::CONTENT_DISPOSITION, disposition),
            (
                HeaderName::from_static("x-original-size"),
                processed.original_size.to_string(),
            ),
            (
                HeaderName::from_static("x-processed-size"),
                processed.processed_size.to_string(),
            ),
            (
                HeaderName::from_static("x-processing-ms"),
                processed.elapsed_ms.to_string(),
            ),
        ],
        processed.data,
    )
        .into_response()
}

pub async fn check_transparency(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Json<TransparencyReport>> {
    let form = read_removal_form(multipart, &state.bucket).await?;
    let source = form
        .source
        .ok_or_else(|| AppError::BadRequest("Image file or url required".to_string()))?;

    let data: Bytes = source.load(&*state.fetcher).await?;
    let report = tokio::task::spawn_blocking(move || -> AppResult<TransparencyReport> {
        let image = decode(&data)?;
        Ok(looks_transparent(&image))
    })
    .await
    .map_err(|e| anyhow::anyhow!("Transparency check failed: {}", e))??;

    Ok(Json(report))
}
