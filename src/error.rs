use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    // Auth errors
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Unauthorized")]
    Unauthorized,

    // Catalog errors
    #[error("Sticker not found")]
    StickerNotFound,
    #[error("Pack not found")]
    PackNotFound,
    #[error("Slug already in use: {0}")]
    SlugTaken(String),

    // Packaging errors
    #[error("Job not found")]
    JobNotFound,
    #[error("Job not finished")]
    JobNotFinished,
    #[error("Failed to fetch image: {0}")]
    Fetch(String),

    // Admin script errors
    #[error("Script not allowed: {0}")]
    ScriptNotAllowed(String),

    // Access policy denied a read or write on the backing store
    #[error("Access denied")]
    AccessDenied,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Bad request: {0}")]
    BadRequest(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Redis errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    // JWT errors
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    // Codec errors
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    // HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            // 400 Bad Request
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Image(e) => {
                tracing::warn!("Image error: {}", e);
                (StatusCode::BAD_REQUEST, "Unsupported or corrupt image".to_string())
            }

            // 401 Unauthorized
            AppError::InvalidCredentials => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::InvalidToken => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Jwt(_) => (StatusCode::UNAUTHORIZED, "Invalid token".to_string()),

            // 403 Forbidden
            AppError::AccessDenied => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::ScriptNotAllowed(_) => (StatusCode::FORBIDDEN, self.to_string()),

            // 404 Not Found
            AppError::StickerNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::PackNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::JobNotFound => (StatusCode::NOT_FOUND, self.to_string()),

            // 409 Conflict
            AppError::SlugTaken(_) => (StatusCode::CONFLICT, self.to_string()),
            AppError::JobNotFinished => (StatusCode::CONFLICT, self.to_string()),

            // 502 Bad Gateway
            AppError::Fetch(msg) => {
                tracing::warn!("Fetch error: {}", msg);
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            AppError::Http(e) => {
                tracing::warn!("HTTP client error: {}", e);
                (StatusCode::BAD_GATEWAY, "Upstream fetch failed".to_string())
            }

            // 500 Internal Server Error
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::Redis(e) => {
                tracing::error!("Redis error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Cache error".to_string())
            }
            AppError::Zip(e) => {
                tracing::error!("Archive error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Archive error".to_string(),
                )
            }
            AppError::Io(e) => {
                tracing::error!("IO error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
