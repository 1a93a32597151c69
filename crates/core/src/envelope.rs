use bytes::Bytes;
use serde_json::{Value, json};

/// The canonical error shape every failure leaves the proxy in.
pub fn error_envelope(message: &str) -> Value {
    json!({"error": {"type": "error", "message": message}})
}

/// Rewrite a non-canonical upstream error payload into the canonical
/// `{"error":{"type":"error","message":…}}` envelope. Payloads that already
/// carry an `error` object with a `message` pass through byte-identical.
pub fn normalize_error_body(raw: &[u8]) -> Bytes {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => {
            if let Some(Value::Object(error)) = map.get("error")
                && error.get("message").is_some()
            {
                return Bytes::copy_from_slice(raw);
            }
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| map.get("error").and_then(Value::as_str))
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(map).to_string());
            wrap(&message)
        }
        Ok(Value::String(message)) => wrap(&message),
        Ok(other) => wrap(&other.to_string()),
        Err(_) => wrap(String::from_utf8_lossy(raw).trim()),
    }
}

fn wrap(message: &str) -> Bytes {
    Bytes::from(error_envelope(message).to_string())
}
