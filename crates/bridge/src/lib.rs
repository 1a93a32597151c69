//! OpenAI-Responses ↔ Claude-Messages translation for bridge mode: a
//! Responses-dialect channel backed by a Claude upstream, with a local
//! session carrying the turn history between requests.

use serde_json::{Value, json};

use waveproxy_core::error::ProxyError;
use waveproxy_core::metrics::TokenUsage;
use waveproxy_core::session::SessionTurn;

const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Convert the client's `input` into conversation turns. A string becomes a
/// single user turn; an array is copied turn-by-turn with text parts joined.
pub fn input_turns(input: &Value) -> Result<Vec<SessionTurn>, ProxyError> {
    match input {
        Value::String(text) => Ok(vec![SessionTurn::new("user", text.clone())]),
        Value::Array(items) => {
            let mut turns = Vec::with_capacity(items.len());
            for item in items {
                let role = item
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("user")
                    .to_string();
                turns.push(SessionTurn {
                    role,
                    content: item_text(item),
                });
            }
            Ok(turns)
        }
        _ => Err(ProxyError::BadRequest(
            "input must be a string or an array of turns".into(),
        )),
    }
}

fn item_text(item: &Value) -> String {
    match item.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Build the Claude Messages body for a bridged request: prior session turns
/// followed by the new input, with `max_output_tokens` mapped onto
/// `max_tokens` and `instructions` onto `system`. Bridge calls are never
/// streamed.
pub fn messages_request(
    model: &str,
    request: &Value,
    history: &[SessionTurn],
    new_turns: &[SessionTurn],
) -> Value {
    let messages: Vec<Value> = history
        .iter()
        .chain(new_turns.iter())
        .map(|turn| json!({"role": turn.role, "content": turn.content}))
        .collect();

    let max_tokens = request
        .get("max_output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MAX_TOKENS);

    let mut body = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
        "stream": false,
    });

    if let Some(instructions) = request.get("instructions").and_then(Value::as_str)
        && !instructions.is_empty()
    {
        body["system"] = Value::String(instructions.to_string());
    }
    if let Some(temperature) = request.get("temperature") {
        body["temperature"] = temperature.clone();
    }
    body
}

/// Pull the assistant text and token usage out of a Claude Messages response.
pub fn parse_messages_response(raw: &[u8]) -> Result<(String, TokenUsage), ProxyError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| ProxyError::UpstreamParse(e.to_string()))?;
    let text = value
        .get("content")
        .and_then(Value::as_array)
        .and_then(|blocks| {
            blocks.iter().find_map(|block| {
                (block.get("type").and_then(Value::as_str) == Some("text"))
                    .then(|| block.get("text").and_then(Value::as_str))
                    .flatten()
            })
        })
        .ok_or_else(|| ProxyError::UpstreamParse("no text content block".into()))?
        .to_string();

    let usage = value.get("usage").cloned().unwrap_or_else(|| json!({}));
    let usage = TokenUsage {
        input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: usage
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cache_read_tokens: usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cache_creation_tokens: usage
            .get("cache_creation_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    };
    Ok((text, usage))
}

/// Shape the bridged reply like a Responses API envelope.
pub fn responses_envelope(id: &str, model: &str, text: &str, usage: &TokenUsage) -> Value {
    json!({
        "id": id,
        "object": "response",
        "model": model,
        "status": "completed",
        "output": [{
            "type": "message",
            "role": "assistant",
            "content": [{"type": "output_text", "text": text}],
        }],
        "usage": {
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
        },
    })
}
