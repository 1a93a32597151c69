use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Uri, header};
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;

use waveproxy_core::channel::{Channel, Dialect};
use waveproxy_core::error::ProxyError;
use waveproxy_core::metrics::TokenUsage;
use waveproxy_core::redact::SENSITIVE_QUERY_PARAMS;
use waveproxy_route::client::GENERATION_TIMEOUT;
use waveproxy_route::credential::{Credential, apply_auth, bearer_token, header_string};
use waveproxy_route::hygiene::copy_request_headers;

use crate::AppState;
use crate::dispatch::{DialectCall, PreparedAttempt, dispatch};

/// Gemini dialect (`/v1beta/models/<model>:generateContent` and
/// `:streamGenerateContent`). The model lives in the path; the original path
/// and query are preserved on the upstream URL.
pub async fn generate(
    State(state): State<AppState>,
    Path(model_and_action): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let value = if body.is_empty() {
        Value::Null
    } else {
        super::parse_json_body(&body)?
    };
    let model = path_model(&model_and_action)
        .map(str::to_string)
        .or_else(|| {
            value
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default();
    let stream = uri
        .path()
        .to_ascii_lowercase()
        .contains("streamgeneratecontent");
    let user_id = header_string(&headers, "x-gemini-api-privileged-user-id")
        .map(|id| format!("gemini_{id}"))
        .unwrap_or_else(|| super::header_user_id(&headers));

    let path = uri.path().to_string();
    let query = uri.query().map(str::to_string);

    let passthrough = || passthrough_credential(&headers);
    let prepare = |channel: &Channel, credential: &Credential| {
        let url = upstream_url(channel, &path, query.as_deref(), &model);
        // Client credentials never reach a Gemini upstream, passthrough or not.
        let mut out = copy_request_headers(&headers, true);
        out.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        apply_auth(&mut out, channel, &credential.key)?;
        Ok(PreparedAttempt {
            request: state
                .http
                .post(url)
                .timeout(GENERATION_TIMEOUT)
                .headers(out)
                .body(body.clone()),
            stream,
            finish: None,
            usage: parse_gemini_usage,
        })
    };

    dispatch(
        &state,
        DialectCall {
            dialect: Dialect::Gemini,
            user_id,
            model: model.clone(),
            passthrough: &passthrough,
            prepare: &prepare,
            accepts: None,
        },
    )
    .await
}

/// The segment between `/v1beta/models/` and the next `/` or `:`.
fn path_model(model_and_action: &str) -> Option<&str> {
    model_and_action
        .split(['/', ':'])
        .next()
        .filter(|segment| !segment.is_empty())
}

/// Preserve the request path on the channel base URL, deduplicating a
/// `/v1beta` suffix, applying the model map to the path segment, and
/// stripping credential query parameters when the channel has its own keys.
fn upstream_url(channel: &Channel, path: &str, query: Option<&str>, model: &str) -> String {
    let base = channel.trimmed_base_url();

    let mut upstream_path = path.to_string();
    let mapped = channel.rewrite_model(model);
    if !model.is_empty() && mapped != model {
        upstream_path = upstream_path.replacen(
            &format!("/models/{model}"),
            &format!("/models/{mapped}"),
            1,
        );
    }

    let joined = if base.ends_with("/v1beta") && upstream_path.starts_with("/v1beta/") {
        format!("{base}{}", &upstream_path["/v1beta".len()..])
    } else {
        format!("{base}{upstream_path}")
    };

    match query {
        Some(query) if channel.has_configured_keys() => {
            let filtered = strip_credential_params(query);
            if filtered.is_empty() {
                joined
            } else {
                format!("{joined}?{filtered}")
            }
        }
        Some(query) => format!("{joined}?{query}"),
        None => joined,
    }
}

fn strip_credential_params(query: &str) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(
            url::form_urlencoded::parse(query.as_bytes())
                .filter(|(name, _)| {
                    !SENSITIVE_QUERY_PARAMS.contains(&name.to_ascii_lowercase().as_str())
                }),
        )
        .finish()
}

fn passthrough_credential(headers: &HeaderMap) -> Option<String> {
    header_string(headers, "x-goog-api-key")
        .or_else(|| header_string(headers, "x-api-key"))
        .or_else(|| bearer_token(headers))
}

fn parse_gemini_usage(raw: &[u8]) -> TokenUsage {
    let Ok(value) = serde_json::from_slice::<Value>(raw) else {
        return TokenUsage::default();
    };
    let usage = &value["usageMetadata"];
    TokenUsage {
        input_tokens: usage["promptTokenCount"].as_u64().unwrap_or(0),
        output_tokens: usage["candidatesTokenCount"].as_u64().unwrap_or(0),
        cache_read_tokens: usage["cachedContentTokenCount"].as_u64().unwrap_or(0),
        ..TokenUsage::default()
    }
}
