use axum::Json;
use axum::response::IntoResponse;

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "waveproxy",
    }))
}
