use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};

use crate::{
    error::AppResult,
    services::auth::{AdminToken, AuthService, Claims},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<Json<AdminToken>> {
    let auth_service = AuthService::new(state.config.admin.clone());
    let token = auth_service.login(&req.username, &req.password)?;

    tracing::info!("Admin {} logged in", req.username);
    Ok(Json(token))
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub username: String,
    pub expires_at: i64,
}

pub async fn session(Extension(claims): Extension<Claims>) -> Json<SessionResponse> {
    Json(SessionResponse {
        username: claims.sub,
        expires_at: claims.exp,
    })
}
