use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use waveproxy_core::channel::{Channel, Dialect, ServiceType};
use waveproxy_core::error::ProxyError;
use waveproxy_core::metrics::TokenUsage;
use waveproxy_route::client::GENERATION_TIMEOUT;
use waveproxy_route::credential::{Credential, apply_auth, bearer_token, header_string};
use waveproxy_route::hygiene::copy_request_headers;

use crate::AppState;
use crate::dispatch::{DialectCall, PreparedAttempt, dispatch};

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

static SESSION_USER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"session_[0-9a-fA-F][0-9a-fA-F-]*").expect("valid regex"));

/// Claude Messages dialect (`/v1/messages`).
pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let value = super::parse_json_body(&body)?;
    let model = value
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::BadRequest("missing model field".into()))?
        .to_string();
    let stream = value.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let user_id = extract_user_id(&headers, &value);

    let passthrough = || passthrough_credential(&headers);
    let prepare = |channel: &Channel, credential: &Credential| {
        prepare_attempt(&state, channel, credential, &headers, &body, &value, &model, stream)
    };

    dispatch(
        &state,
        DialectCall {
            dialect: Dialect::Messages,
            user_id,
            model: model.clone(),
            passthrough: &passthrough,
            prepare: &prepare,
            accepts: None,
        },
    )
    .await
}

/// Local token estimate (`/v1/messages/count_tokens`): bytes / 4.
pub async fn count_tokens(body: Bytes) -> Response {
    Json(serde_json::json!({"input_tokens": body.len() / 4})).into_response()
}

#[allow(clippy::too_many_arguments)]
fn prepare_attempt(
    state: &AppState,
    channel: &Channel,
    credential: &Credential,
    inbound: &HeaderMap,
    body: &Bytes,
    value: &Value,
    model: &str,
    stream: bool,
) -> Result<PreparedAttempt, ProxyError> {
    let base = channel.trimmed_base_url();
    let url = match channel.service_type {
        ServiceType::OpenAI => format!("{base}/v1/chat/completions"),
        _ => format!("{base}/v1/messages"),
    };

    let mut headers = copy_request_headers(inbound, channel.has_configured_keys());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if !headers.contains_key("anthropic-version") {
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(DEFAULT_ANTHROPIC_VERSION),
        );
    }
    if stream && !headers.contains_key(header::ACCEPT) {
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
    }
    apply_auth(&mut headers, channel, &credential.key)?;

    let payload = super::body_with_model(body, value, channel.rewrite_model(model), model);
    Ok(PreparedAttempt {
        request: state
            .http
            .post(url)
            .timeout(GENERATION_TIMEOUT)
            .headers(headers)
            .body(payload),
        stream,
        finish: None,
        usage: parse_claude_usage,
    })
}

/// `metadata.user_id` carrying a `session_<hex>` marker wins, namespaced with
/// `claude_`; the `x-user-id` header is the fallback.
fn extract_user_id(headers: &HeaderMap, value: &Value) -> String {
    if let Some(metadata_user) = value.pointer("/metadata/user_id").and_then(Value::as_str)
        && let Some(found) = SESSION_USER_RE.find(metadata_user)
    {
        return format!("claude_{}", found.as_str());
    }
    super::header_user_id(headers)
}

fn passthrough_credential(headers: &HeaderMap) -> Option<String> {
    header_string(headers, "x-api-key").or_else(|| bearer_token(headers))
}

fn parse_claude_usage(raw: &[u8]) -> TokenUsage {
    let Ok(value) = serde_json::from_slice::<Value>(raw) else {
        return TokenUsage::default();
    };
    let usage = &value["usage"];
    TokenUsage {
        input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
        cache_read_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0),
        cache_creation_tokens: usage["cache_creation_input_tokens"].as_u64().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_user_id_is_namespaced() {
        let value = json!({
            "metadata": {"user_id": "user_abc123_account__session_6ba7b810-9dad-11d1-80b4-00c04fd430c8"}
        });
        let user = extract_user_id(&HeaderMap::new(), &value);
        assert_eq!(user, "claude_session_6ba7b810-9dad-11d1-80b4-00c04fd430c8");
    }

    #[test]
    fn header_fallback_when_metadata_missing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("terminal-7"));
        assert_eq!(extract_user_id(&headers, &json!({})), "terminal-7");
        assert_eq!(extract_user_id(&HeaderMap::new(), &json!({})), "");
    }

    #[test]
    fn usage_parses_cache_counters() {
        let raw = json!({
            "usage": {
                "input_tokens": 12,
                "output_tokens": 34,
                "cache_read_input_tokens": 5,
                "cache_creation_input_tokens": 6,
            }
        });
        let usage = parse_claude_usage(raw.to_string().as_bytes());
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 34);
        assert_eq!(usage.cache_read_tokens, 5);
        assert_eq!(usage.cache_creation_tokens, 6);
        assert_eq!(parse_claude_usage(b"not json").input_tokens, 0);
    }
}
