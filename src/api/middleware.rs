use std::convert::Infallible;
use std::net::SocketAddr;

use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use axum_extra::{headers::UserAgent, TypedHeader};

use crate::{
    error::AppError,
    services::{auth::AuthService, downloads::Requester},
    AppState,
};

/// Admin bearer-token middleware
pub async fn admin_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;

    let auth_service = AuthService::new(state.config.admin.clone());
    let claims = auth_service.validate_token(token)?;

    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}

#[async_trait]
impl<S> FromRequestParts<S> for Requester
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let user_agent = TypedHeader::<UserAgent>::from_request_parts(parts, state)
            .await
            .ok()
            .map(|TypedHeader(agent)| agent.to_string());

        Ok(Requester {
            ip: client_ip(&parts.headers, peer),
            user_agent,
        })
    }
}

/// First hop of `X-Forwarded-For`, then `X-Real-IP`, then the socket peer.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn forwarded_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.9");
    }

    #[test]
    fn falls_back_to_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_ip(&headers, None), "10.0.0.2");

        let peer: SocketAddr = "192.168.1.4:5000".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), "192.168.1.4");
        assert_eq!(client_ip(&HeaderMap::new(), None), "unknown");
    }
}
