use axum::{extract::State, http::Request, middleware::Next, response::Response};

use crate::AppState;
use waveproxy_core::error::ProxyError;

/// Enforce the server-level access key when one is configured. Clients may
/// present it as `x-api-key` or `Authorization: Bearer`.
pub async fn access_key_middleware(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ProxyError> {
    let access_key = state.settings.current().access_key.clone();
    if access_key.is_empty() {
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
        });

    match token {
        Some(token) if token == access_key => Ok(next.run(request).await),
        _ => Err(ProxyError::Unauthorized("unauthorized".into())),
    }
}
