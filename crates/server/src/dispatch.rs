use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashSet;
use std::time::Instant;

use waveproxy_core::channel::{Channel, Dialect};
use waveproxy_core::envelope::{error_envelope, normalize_error_body};
use waveproxy_core::error::ProxyError;
use waveproxy_core::metrics::TokenUsage;
use waveproxy_core::redact::redact_secrets;
use waveproxy_route::credential::{Credential, resolve_credentials};
use waveproxy_route::hygiene::copy_response_headers;

use crate::AppState;

/// Bounded number of channels a single request may try.
pub const MAX_CHANNEL_ATTEMPTS: usize = 3;

type FinishFn = Box<dyn FnOnce(Bytes) -> Result<(Bytes, TokenUsage), ProxyError> + Send>;

/// One upstream attempt, built by a dialect's `prepare` hook.
pub struct PreparedAttempt {
    pub request: reqwest::RequestBuilder,
    /// Whether this attempt relays a stream (bridge mode forces `false`).
    pub stream: bool,
    /// Rewrite a buffered 2xx body before replying (bridge mode).
    pub finish: Option<FinishFn>,
    /// Parse token usage from an untransformed buffered 2xx body.
    pub usage: fn(&[u8]) -> TokenUsage,
}

/// The dialect-specific half of a proxied request. The failover loop is the
/// same for every dialect; these hooks supply the parts that differ.
pub struct DialectCall<'a> {
    pub dialect: Dialect,
    pub user_id: String,
    pub model: String,
    /// Extract the client-supplied credential for passthrough channels.
    pub passthrough: &'a (dyn Fn() -> Option<String> + Sync),
    /// Build one upstream attempt for a channel + credential.
    pub prepare:
        &'a (dyn Fn(&Channel, &Credential) -> Result<PreparedAttempt, ProxyError> + Sync),
    /// Channels this call cannot serve are excluded and selection retried.
    pub accepts: Option<&'a (dyn Fn(&Channel) -> bool + Sync)>,
}

struct LastFailure {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl LastFailure {
    fn synthetic(error: &ProxyError) -> Self {
        Self {
            status: error.status_code(),
            headers: HeaderMap::new(),
            body: Bytes::from(error_envelope(&error.to_string()).to_string()),
        }
    }

    /// Replay the failure verbatim: original status, headers minus hop-by-hop,
    /// body normalised into the canonical envelope.
    fn into_reply(self) -> Response {
        let mut headers = copy_response_headers(&self.headers);
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let mut response = Response::new(Body::from(normalize_error_body(&self.body)));
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }
}

/// The shared failover orchestrator: pick a channel, walk its credentials,
/// relay the first success, otherwise exclude the channel and try the next —
/// up to `MAX_CHANNEL_ATTEMPTS`. The last failure is replayed verbatim; a
/// synthetic 503 appears only when no attempt ever ran.
pub async fn dispatch(state: &AppState, call: DialectCall<'_>) -> Result<Response, ProxyError> {
    let mut excluded: HashSet<String> = HashSet::new();
    let mut last_failure: Option<LastFailure> = None;
    let mut attempts = 0usize;

    while attempts < MAX_CHANNEL_ATTEMPTS {
        let channel = match state
            .scheduler
            .select(call.dialect, &call.user_id, &excluded)
        {
            Ok(channel) => channel,
            Err(_) => break,
        };

        if let Some(accepts) = call.accepts
            && !accepts(&channel)
        {
            // Wrong upstream shape for this call; release any probe slot.
            state.scheduler.record_failure(&channel.id, false);
            excluded.insert(channel.id.clone());
            continue;
        }

        attempts += 1;

        let affinity = state.scheduler.key_affinity(&call.user_id, &channel.id);
        let credentials =
            match resolve_credentials(&channel, affinity.as_deref(), || (call.passthrough)()) {
                Ok(credentials) => credentials,
                Err(error) => {
                    state.scheduler.record_failure(&channel.id, false);
                    note_failure(state, &channel, &call, Instant::now(), &error.to_string(), None);
                    last_failure = Some(LastFailure::synthetic(&error));
                    excluded.insert(channel.id.clone());
                    continue;
                }
            };

        let credential_count = credentials.len();
        for (index, credential) in credentials.into_iter().enumerate() {
            let prepared = (call.prepare)(&channel, &credential)?;
            let started = Instant::now();

            let response = match prepared.request.send().await {
                Ok(response) => response,
                Err(error) => {
                    let error = ProxyError::from(error);
                    state.scheduler.record_failure(&channel.id, true);
                    note_failure(state, &channel, &call, started, &error.to_string(), None);
                    last_failure = Some(LastFailure::synthetic(&error));
                    break;
                }
            };

            let status = response.status();
            if status.is_success() {
                if prepared.stream {
                    return match begin_stream_relay(response).await {
                        Ok(reply) => {
                            note_success(
                                state,
                                &channel,
                                &call,
                                &credential,
                                started,
                                &TokenUsage::default(),
                            );
                            Ok(reply)
                        }
                        Err(error) => {
                            state.scheduler.record_failure(&channel.id, true);
                            note_failure(
                                state,
                                &channel,
                                &call,
                                started,
                                &error.to_string(),
                                None,
                            );
                            Err(error)
                        }
                    };
                }

                let upstream_headers = response.headers().clone();
                let raw = match response.bytes().await {
                    Ok(raw) => raw,
                    Err(error) => {
                        let error = ProxyError::from(error);
                        state.scheduler.record_failure(&channel.id, true);
                        note_failure(state, &channel, &call, started, &error.to_string(), None);
                        last_failure = Some(LastFailure::synthetic(&error));
                        break;
                    }
                };

                let rewritten = prepared.finish.is_some();
                let (body, usage) = match prepared.finish {
                    Some(finish) => match finish(raw) {
                        Ok(result) => result,
                        Err(error) => {
                            note_failure(
                                state,
                                &channel,
                                &call,
                                started,
                                &error.to_string(),
                                None,
                            );
                            return Err(error);
                        }
                    },
                    None => {
                        let usage = (prepared.usage)(&raw);
                        (raw, usage)
                    }
                };

                note_success(state, &channel, &call, &credential, started, &usage);

                let mut headers = copy_response_headers(&upstream_headers);
                if rewritten {
                    headers.insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/json"),
                    );
                }
                let mut reply = Response::new(Body::from(body));
                *reply.status_mut() = status;
                *reply.headers_mut() = headers;
                return Ok(reply);
            }

            // Upstream failure status.
            let upstream_headers = response.headers().clone();
            let raw = response.bytes().await.unwrap_or_default();
            let code = status.as_u16();
            let retryable = code >= 500 || matches!(code, 408 | 425 | 429);
            state.scheduler.record_failure(&channel.id, retryable);
            note_failure(
                state,
                &channel,
                &call,
                started,
                &format!("upstream status {code}"),
                Some(String::from_utf8_lossy(&raw).into_owned()),
            );
            last_failure = Some(LastFailure {
                status,
                headers: upstream_headers,
                body: raw,
            });

            if matches!(code, 401 | 403 | 429) && index + 1 < credential_count {
                tracing::debug!(channel = %channel.id, status = code, "rotating to next API key");
                continue;
            }
            break;
        }

        excluded.insert(channel.id.clone());
    }

    match last_failure {
        Some(failure) => Ok(failure.into_reply()),
        None => Err(ProxyError::NoAvailableChannel),
    }
}

fn note_success(
    state: &AppState,
    channel: &Channel,
    call: &DialectCall<'_>,
    credential: &Credential,
    started: Instant,
    usage: &TokenUsage,
) {
    let latency_ms = started.elapsed().as_millis() as u64;
    state.scheduler.record_success(&channel.id);
    state.metrics.record_success(&channel.id, latency_ms, usage);
    state.metrics.set_broken(&channel.id, false);
    if credential.configured {
        state.scheduler.set_key_affinity(
            &call.user_id,
            &channel.id,
            &credential.key,
            call.dialect.affinity_ttl(),
        );
    }
    state.history.record(
        &channel.id,
        call.dialect,
        &call.model,
        true,
        latency_ms,
        usage,
        None,
        None,
    );
}

/// Record a failed attempt in metrics and history. Circuit accounting is the
/// caller's job since retryability depends on the failure class.
fn note_failure(
    state: &AppState,
    channel: &Channel,
    call: &DialectCall<'_>,
    started: Instant,
    error: &str,
    details: Option<String>,
) {
    let latency_ms = started.elapsed().as_millis() as u64;
    state
        .metrics
        .record_failure(&channel.id, latency_ms);
    state
        .metrics
        .set_broken(&channel.id, state.scheduler.is_broken(&channel.id));
    state.history.record(
        &channel.id,
        call.dialect,
        &call.model,
        false,
        latency_ms,
        &TokenUsage::default(),
        Some(redact_secrets(error)),
        details,
    );
    tracing::warn!(channel = %channel.id, dialect = %call.dialect, error = %redact_secrets(error), "upstream attempt failed");
}

/// Start relaying a streamed 2xx. The first chunk is awaited up front so an
/// upstream that closes with zero bytes surfaces as a 502 instead of an empty
/// success; the remainder is forwarded chunk by chunk. Dropping the relayed
/// body (client disconnect, server shutdown) drops the upstream response and
/// cancels the request.
async fn begin_stream_relay(response: reqwest::Response) -> Result<Response, ProxyError> {
    let status = response.status();
    let mut headers = copy_response_headers(response.headers());
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
    }

    let mut upstream = Box::pin(response.bytes_stream());
    let first = loop {
        match upstream.next().await {
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            Some(Ok(chunk)) => break chunk,
            Some(Err(_)) | None => return Err(ProxyError::StreamEnded),
        }
    };

    let relay = futures::stream::once(async move { Ok::<_, std::io::Error>(first) })
        .chain(upstream.map(|chunk| chunk.map_err(std::io::Error::other)));

    let mut reply = Response::new(Body::from_stream(relay));
    *reply.status_mut() = status;
    *reply.headers_mut() = headers;
    Ok(reply)
}
