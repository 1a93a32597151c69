use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;

use waveproxy_core::channel::{Channel, Dialect, ServiceType};
use waveproxy_core::error::ProxyError;
use waveproxy_core::metrics::TokenUsage;
use waveproxy_core::session::{Session, SessionStore, SessionTurn};
use waveproxy_route::client::GENERATION_TIMEOUT;
use waveproxy_route::credential::{Credential, apply_auth, bearer_token, header_string};
use waveproxy_route::hygiene::copy_request_headers;

use crate::AppState;
use crate::dispatch::{DialectCall, PreparedAttempt, dispatch};

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// OpenAI Responses dialect (`/v1/responses`, `/responses`). OpenAI-service
/// channels are passthrough; Claude-service channels run bridge mode with a
/// local session carrying the turn history.
pub async fn responses(
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
    let previous_response_id = value
        .get("previous_response_id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let user_id = extract_user_id(&headers, &value, &previous_response_id);

    // The thread is looked up once; it is only published back to the store
    // after a successful bridged reply.
    let session = state.sessions.lookup_or_create(&previous_response_id);

    let passthrough = || bearer_token(&headers).or_else(|| header_string(&headers, "x-api-key"));
    let prepare = |channel: &Channel, credential: &Credential| match channel.service_type {
        ServiceType::Claude => prepare_bridge(
            &state,
            channel,
            credential,
            &headers,
            &value,
            &model,
            &previous_response_id,
            &session,
        ),
        _ => prepare_passthrough(
            &state, channel, credential, &headers, &body, &value, &model, stream,
        ),
    };

    dispatch(
        &state,
        DialectCall {
            dialect: Dialect::Responses,
            user_id,
            model: model.clone(),
            passthrough: &passthrough,
            prepare: &prepare,
            accepts: None,
        },
    )
    .await
}

fn extract_user_id(headers: &HeaderMap, value: &Value, previous_response_id: &str) -> String {
    if let Some(cache_key) = value
        .get("prompt_cache_key")
        .and_then(Value::as_str)
        .filter(|key| !key.is_empty())
    {
        return format!("codex_{cache_key}");
    }
    if !previous_response_id.is_empty() {
        return previous_response_id.to_string();
    }
    super::header_user_id(headers)
}

#[allow(clippy::too_many_arguments)]
fn prepare_passthrough(
    state: &AppState,
    channel: &Channel,
    credential: &Credential,
    inbound: &HeaderMap,
    body: &Bytes,
    value: &Value,
    model: &str,
    stream: bool,
) -> Result<PreparedAttempt, ProxyError> {
    let url = super::openai_endpoint_url(channel.trimmed_base_url(), "responses");
    let mut headers = copy_request_headers(inbound, channel.has_configured_keys());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
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
        usage: parse_responses_usage,
    })
}

/// Bridge mode: translate to a Claude Messages call and re-shape the reply as
/// a Responses envelope. Streaming is not translated here; the buffered call
/// is always used.
#[allow(clippy::too_many_arguments)]
fn prepare_bridge(
    state: &AppState,
    channel: &Channel,
    credential: &Credential,
    inbound: &HeaderMap,
    value: &Value,
    model: &str,
    previous_response_id: &str,
    session: &Session,
) -> Result<PreparedAttempt, ProxyError> {
    let new_turns =
        waveproxy_bridge::input_turns(value.get("input").unwrap_or(&Value::Null))?;
    let mapped = channel.rewrite_model(model);
    let payload =
        waveproxy_bridge::messages_request(mapped, value, &session.turns, &new_turns);
    let url = format!("{}/v1/messages", channel.trimmed_base_url());

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
    apply_auth(&mut headers, channel, &credential.key)?;

    let sessions = state.sessions.clone();
    let session = session.clone();
    let previous = previous_response_id.to_string();
    let reply_model = model.to_string();
    let finish = Box::new(move |raw: Bytes| {
        let (text, usage) = waveproxy_bridge::parse_messages_response(&raw)?;
        let mut session = session;
        session.turns.extend(new_turns);
        session.turns.push(SessionTurn::new("assistant", text.clone()));
        let response_id = SessionStore::mint_response_id();
        sessions.advance(&previous, &response_id, session);
        let envelope =
            waveproxy_bridge::responses_envelope(&response_id, &reply_model, &text, &usage);
        Ok((Bytes::from(envelope.to_string()), usage))
    });

    Ok(PreparedAttempt {
        request: state
            .http
            .post(url)
            .timeout(GENERATION_TIMEOUT)
            .headers(headers)
            .body(Bytes::from(payload.to_string())),
        stream: false,
        finish: Some(finish),
        usage: parse_responses_usage,
    })
}

fn parse_responses_usage(raw: &[u8]) -> TokenUsage {
    let Ok(value) = serde_json::from_slice::<Value>(raw) else {
        return TokenUsage::default();
    };
    let usage = &value["usage"];
    TokenUsage {
        input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
        ..TokenUsage::default()
    }
}
