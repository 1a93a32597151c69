use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;

use waveproxy_core::channel::{Channel, Dialect, ServiceType};
use waveproxy_core::error::ProxyError;
use waveproxy_core::metrics::TokenUsage;
use waveproxy_route::client::LISTING_TIMEOUT;
use waveproxy_route::credential::{Credential, apply_auth, bearer_token, header_string};
use waveproxy_route::hygiene::copy_request_headers;

use crate::AppState;
use crate::dispatch::{DialectCall, PreparedAttempt, dispatch};

/// Proxied model listing (`/v1/models`, `/models`).
pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    proxy_models(state, headers, None).await
}

/// Proxied model detail (`/v1/models/{id}`, `/models/{id}`).
pub async fn model_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    proxy_models(state, headers, Some(id)).await
}

/// Model listing always routes through Responses-dialect channels whose
/// upstream actually speaks the OpenAI shape; other picks are excluded and
/// selection retried.
async fn proxy_models(
    state: AppState,
    headers: HeaderMap,
    id: Option<String>,
) -> Result<Response, ProxyError> {
    let endpoint = match &id {
        Some(id) => format!("models/{id}"),
        None => "models".to_string(),
    };
    let user_id = super::header_user_id(&headers);

    let passthrough = || bearer_token(&headers).or_else(|| header_string(&headers, "x-api-key"));
    let prepare = |channel: &Channel, credential: &Credential| {
        let url = super::openai_endpoint_url(channel.trimmed_base_url(), &endpoint);
        let mut out = copy_request_headers(&headers, channel.has_configured_keys());
        apply_auth(&mut out, channel, &credential.key)?;
        Ok(PreparedAttempt {
            request: state.http.get(url).timeout(LISTING_TIMEOUT).headers(out),
            stream: false,
            finish: None,
            usage: no_usage,
        })
    };
    let accepts = |channel: &Channel| channel.service_type == ServiceType::OpenAI;

    dispatch(
        &state,
        DialectCall {
            dialect: Dialect::Responses,
            user_id,
            model: String::new(),
            passthrough: &passthrough,
            prepare: &prepare,
            accepts: Some(&accepts),
        },
    )
    .await
}

fn no_usage(_: &[u8]) -> TokenUsage {
    TokenUsage::default()
}
