pub mod gemini;
pub mod health;
pub mod messages;
pub mod models;
pub mod responses;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::Value;

use waveproxy_core::envelope::error_envelope;
use waveproxy_core::error::ProxyError;

pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [("content-type", "application/json")],
        error_envelope("not found").to_string(),
    )
        .into_response()
}

pub(crate) fn parse_json_body(body: &Bytes) -> Result<Value, ProxyError> {
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::BadRequest(format!("invalid JSON body: {e}")))
}

pub(crate) fn header_user_id(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Re-serialize the request body with the channel's model mapping applied;
/// an unmapped model forwards the original bytes untouched.
pub(crate) fn body_with_model(
    original: &Bytes,
    value: &Value,
    mapped: &str,
    model: &str,
) -> Bytes {
    if mapped == model {
        return original.clone();
    }
    let mut rewritten = value.clone();
    if let Some(object) = rewritten.as_object_mut() {
        object.insert("model".to_string(), Value::String(mapped.to_string()));
    }
    serde_json::to_vec(&rewritten)
        .map(Bytes::from)
        .unwrap_or_else(|_| original.clone())
}

/// Join an OpenAI-style endpoint onto a channel base URL. The `/v1` segment
/// is appended unless the base already ends in a `/v<N>` version segment; a
/// trailing `#` pins the base exactly as configured.
pub(crate) fn openai_endpoint_url(base: &str, endpoint: &str) -> String {
    if let Some(pinned) = base.strip_suffix('#') {
        return format!("{}/{endpoint}", pinned.trim_end_matches('/'));
    }
    let base = base.trim_end_matches('/');
    if has_version_suffix(base) {
        format!("{base}/{endpoint}")
    } else {
        format!("{base}/v1/{endpoint}")
    }
}

fn has_version_suffix(base: &str) -> bool {
    base.rsplit('/').next().is_some_and(|segment| {
        segment
            .strip_prefix('v')
            .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
    })
}
