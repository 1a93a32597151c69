use axum::http::{HeaderMap, HeaderValue};

use waveproxy_core::channel::{AuthScheme, Channel, ServiceType};
use waveproxy_core::error::ProxyError;

use crate::scheduler::order_keys_with_affinity;

/// One credential to try against an upstream. Only configured keys
/// participate in key affinity.
#[derive(Debug, Clone)]
pub struct Credential {
    pub key: String,
    pub configured: bool,
}

/// Resolve the ordered credential list for one channel attempt.
///
/// Any configured key entry disables passthrough, even when every entry is
/// disabled; the sticky key (if present in the enabled list) is tried first.
pub fn resolve_credentials(
    channel: &Channel,
    affinity: Option<&str>,
    passthrough: impl FnOnce() -> Option<String>,
) -> Result<Vec<Credential>, ProxyError> {
    if channel.has_configured_keys() {
        let keys = channel.enabled_keys();
        if keys.is_empty() {
            return Err(ProxyError::Unauthorized(
                "no enabled API keys configured for channel".into(),
            ));
        }
        Ok(order_keys_with_affinity(keys, affinity)
            .into_iter()
            .map(|key| Credential {
                key,
                configured: true,
            })
            .collect())
    } else {
        match passthrough() {
            Some(key) => Ok(vec![Credential {
                key,
                configured: false,
            }]),
            None => Err(ProxyError::Unauthorized(
                "no authentication provided".into(),
            )),
        }
    }
}

/// Apply the channel's auth scheme. `both` pairs the bearer header with the
/// service-native key header (x-goog-api-key for Gemini upstreams, x-api-key
/// otherwise).
pub fn apply_auth(
    headers: &mut HeaderMap,
    channel: &Channel,
    key: &str,
) -> Result<(), ProxyError> {
    let bearer = || {
        HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|_| ProxyError::Internal("API key is not a valid header value".into()))
    };
    let plain = || {
        HeaderValue::from_str(key)
            .map_err(|_| ProxyError::Internal("API key is not a valid header value".into()))
    };
    match channel.effective_auth() {
        AuthScheme::Bearer => {
            headers.insert("authorization", bearer()?);
        }
        AuthScheme::XApiKey => {
            headers.insert("x-api-key", plain()?);
        }
        AuthScheme::XGoogApiKey => {
            headers.insert("x-goog-api-key", plain()?);
        }
        AuthScheme::Both => {
            headers.insert("authorization", bearer()?);
            match channel.service_type {
                ServiceType::Gemini => headers.insert("x-goog-api-key", plain()?),
                _ => headers.insert("x-api-key", plain()?),
            };
        }
    }
    Ok(())
}

/// `Authorization: Bearer <token>` value, if present and well-formed.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

pub fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
