use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, Uri, header};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use waveproxy_core::channel::{ApiKeyEntry, Channel, Dialect, ServiceType};
use waveproxy_core::settings::SettingsStore;
use waveproxy_server::control::ControlPlane;
use waveproxy_server::{AppState, build_router, build_state};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    control: ControlPlane,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let settings = Arc::new(
            SettingsStore::open(dir.path().join("waveproxy.json")).expect("failed to open settings"),
        );
        let state = build_state(settings).expect("failed to build state");
        Self {
            control: ControlPlane::new(state),
            _dir: dir,
        }
    }

    fn state(&self) -> &AppState {
        self.control.state()
    }

    fn add_channel(&self, dialect: Dialect, channel: Channel) -> Channel {
        self.control
            .channel_create(dialect, channel)
            .expect("failed to create channel")
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let router = build_router(self.state().clone());
        let response = router.oneshot(request).await.expect("request failed");
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("failed to read body");
        (status, headers, body)
    }

    async fn send_json(&self, request: Request<Body>) -> (StatusCode, Value) {
        let (status, _, body) = self.send(request).await;
        (status, serde_json::from_slice(&body).unwrap_or(json!({})))
    }
}

async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind upstream");
    let addr = listener.local_addr().expect("no local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

fn channel(base_url: &str, keys: &[&str], priority: i64) -> Channel {
    Channel {
        name: format!("test-{priority}"),
        service_type: ServiceType::Claude,
        base_url: base_url.to_string(),
        api_keys: keys.iter().map(|k| ApiKeyEntry::enabled(*k)).collect(),
        priority,
        ..Channel::default()
    }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("failed to build request")
}

fn messages_body() -> Value {
    json!({
        "model": "m",
        "max_tokens": 10,
        "messages": [{"role": "user", "content": "hi"}],
        "stream": false,
    })
}

fn claude_ok_body() -> Value {
    json!({
        "id": "msg_1",
        "content": [{"type": "text", "text": "Hello!"}],
        "usage": {"input_tokens": 3, "output_tokens": 5},
    })
}

// ---------------------------------------------------------------------------
// Plain endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_service_name() {
    let harness = Harness::new();
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = harness.send_json(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "waveproxy");
}

#[tokio::test]
async fn unknown_path_gets_canonical_404() {
    let harness = Harness::new();
    let request = Request::builder()
        .uri("/v2/does-not-exist")
        .body(Body::empty())
        .unwrap();
    let (status, body) = harness.send_json(request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "error");
    assert_eq!(body["error"]["message"], "not found");
}

#[tokio::test]
async fn count_tokens_estimates_from_body_size() {
    let harness = Harness::new();
    let payload = "x".repeat(40);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages/count_tokens")
        .body(Body::from(payload))
        .unwrap();
    let (status, body) = harness.send_json(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["input_tokens"], 10);
}

#[tokio::test]
async fn access_key_gates_dialect_routes() {
    let harness = Harness::new();
    harness.control.set_access_key("letmein").unwrap();

    let (status, body) = harness
        .send_json(post_json("/v1/messages", messages_body()))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["message"], "unauthorized");

    let mut request = post_json("/v1/messages", messages_body());
    request
        .headers_mut()
        .insert("x-api-key", "letmein".parse().unwrap());
    let (status, body) = harness.send_json(request).await;
    // key accepted; with no channels configured the scheduler comes up empty
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["message"], "no available channels");

    // /health stays open
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, _) = harness.send_json(request).await;
    assert_eq!(status, StatusCode::OK);
}

// ---------------------------------------------------------------------------
// S1: Messages failover across channels
// ---------------------------------------------------------------------------

#[tokio::test]
async fn messages_fail_over_to_next_channel() {
    let failing = spawn_upstream(Router::new().route(
        "/v1/messages",
        post(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": {"type": "api_error", "message": "boom"}})),
            )
        }),
    ))
    .await;
    let healthy = spawn_upstream(Router::new().route(
        "/v1/messages",
        post(|| async { Json(claude_ok_body()) }),
    ))
    .await;

    let harness = Harness::new();
    let a = harness.add_channel(Dialect::Messages, channel(&failing, &["ka"], 1));
    let b = harness.add_channel(Dialect::Messages, channel(&healthy, &["kb"], 2));

    let (status, body) = harness
        .send_json(post_json("/v1/messages", messages_body()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "msg_1");
    assert_eq!(body["content"][0]["text"], "Hello!");

    let a_metrics = harness.state().metrics.channel(&a.id).unwrap();
    assert_eq!(a_metrics.failure, 1);
    assert_eq!(a_metrics.consecutive_failures, 1);
    let b_metrics = harness.state().metrics.channel(&b.id).unwrap();
    assert_eq!(b_metrics.success, 1);
    assert_eq!(b_metrics.input_tokens, 3);
    assert_eq!(b_metrics.output_tokens, 5);

    let (records, total) = harness.control.request_history(10, 0, None, None);
    assert_eq!(total, 2);
    // newest first: the success on B follows the failure on A
    assert!(records[0].success);
    assert_eq!(records[0].channel_id, b.id);
    assert!(!records[1].success);
    assert_eq!(records[1].channel_id, a.id);
}

#[tokio::test]
async fn exhausted_channels_replay_last_failure_verbatim() {
    let failing = spawn_upstream(Router::new().route(
        "/v1/messages",
        post(|| async {
            (
                StatusCode::FORBIDDEN,
                Json(json!({"error": "Client Not Allowed", "message": "blocked by region"})),
            )
        }),
    ))
    .await;

    let harness = Harness::new();
    harness.add_channel(Dialect::Messages, channel(&failing, &["ka"], 1));

    let (status, body) = harness
        .send_json(post_json("/v1/messages", messages_body()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    // non-canonical upstream error is rewritten into the canonical envelope
    assert_eq!(body["error"]["type"], "error");
    assert_eq!(body["error"]["message"], "blocked by region");
}

// ---------------------------------------------------------------------------
// S3: key rotation within a channel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_key_is_tried_after_401_and_becomes_sticky() {
    let upstream = spawn_upstream(Router::new().route(
        "/v1/messages",
        post(|headers: HeaderMap| async move {
            match headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
                Some("key-b") => Json(claude_ok_body()).into_response(),
                _ => (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"error": {"type": "authentication_error", "message": "bad key"}})),
                )
                    .into_response(),
            }
        }),
    ))
    .await;

    let harness = Harness::new();
    let ch = harness.add_channel(Dialect::Messages, channel(&upstream, &["key-a", "key-b"], 1));

    let mut request = post_json("/v1/messages", messages_body());
    request
        .headers_mut()
        .insert("x-user-id", "tester".parse().unwrap());
    let (status, body) = harness.send_json(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"][0]["text"], "Hello!");

    // affinity now points at the key that worked
    assert_eq!(
        harness.state().scheduler.key_affinity("tester", &ch.id),
        Some("key-b".to_string())
    );

    let (records, total) = harness.control.request_history(10, 0, None, None);
    assert_eq!(total, 2);
    assert!(records[0].success);
    assert!(!records[1].success);

    // the 401 was key-specific: the circuit stays closed
    assert!(!harness.state().scheduler.is_broken(&ch.id));
}

#[tokio::test]
async fn all_keys_disabled_refuses_client_credentials() {
    let harness = Harness::new();
    let mut ch = channel("http://127.0.0.1:1", &[], 1);
    ch.api_keys = vec![ApiKeyEntry {
        key: "sk-off".into(),
        enabled: false,
    }];
    harness.add_channel(Dialect::Messages, ch);

    let mut request = post_json("/v1/messages", messages_body());
    request
        .headers_mut()
        .insert("x-api-key", "client-key".parse().unwrap());
    let (status, body) = harness.send_json(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        body["error"]["message"],
        "no enabled API keys configured for channel"
    );
}

// ---------------------------------------------------------------------------
// Header hygiene (testable property 7)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upstream_request_is_scrubbed_of_client_headers() {
    let seen: Arc<Mutex<Option<HeaderMap>>> = Arc::new(Mutex::new(None));
    let capture = seen.clone();
    let upstream = spawn_upstream(Router::new().route(
        "/v1/messages",
        post(move |headers: HeaderMap| {
            let capture = capture.clone();
            async move {
                *capture.lock().unwrap() = Some(headers);
                Json(claude_ok_body())
            }
        }),
    ))
    .await;

    let harness = Harness::new();
    harness.add_channel(Dialect::Messages, channel(&upstream, &["up-key"], 1));

    let mut request = post_json("/v1/messages", messages_body());
    let headers = request.headers_mut();
    headers.insert("accept-encoding", "gzip".parse().unwrap());
    headers.insert("authorization", "Bearer client-token".parse().unwrap());
    headers.insert("x-api-key", "client-key".parse().unwrap());
    headers.insert("connection", "keep-alive".parse().unwrap());
    headers.insert("x-custom", "kept".parse().unwrap());

    let (status, _) = harness.send_json(request).await;
    assert_eq!(status, StatusCode::OK);

    let seen = seen.lock().unwrap().clone().expect("upstream not called");
    assert!(seen.get("accept-encoding").is_none());
    assert!(seen.get("authorization").is_none());
    assert!(seen.get("connection").is_none());
    // the channel's configured key replaced the client's
    assert_eq!(seen.get("x-api-key").unwrap(), "up-key");
    assert_eq!(seen.get("x-custom").unwrap(), "kept");
    assert_eq!(seen.get("anthropic-version").unwrap(), "2023-06-01");
}

// ---------------------------------------------------------------------------
// S2: streaming first-byte guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_stream_becomes_502() {
    let upstream = spawn_upstream(Router::new().route(
        "/v1/messages",
        post(|| async {
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::empty(),
            )
        }),
    ))
    .await;

    let harness = Harness::new();
    harness.add_channel(Dialect::Messages, channel(&upstream, &["ka"], 1));

    let mut body = messages_body();
    body["stream"] = json!(true);
    let (status, reply) = harness.send_json(post_json("/v1/messages", body)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        reply["error"]["message"],
        "upstream stream ended before first byte"
    );
}

// ---------------------------------------------------------------------------
// S5: Gemini streaming passthrough
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gemini_stream_relays_chunks_in_order() {
    let seen: Arc<Mutex<Option<(String, Option<String>)>>> = Arc::new(Mutex::new(None));
    let capture = seen.clone();
    let upstream = spawn_upstream(Router::new().route(
        "/v1beta/models/{*rest}",
        post(move |uri: Uri, headers: HeaderMap| {
            let capture = capture.clone();
            async move {
                let goog_key = headers
                    .get("x-goog-api-key")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                *capture.lock().unwrap() = Some((uri.to_string(), goog_key));
                let chunks = [
                    "data: {\"candidates\":[1]}\n\n",
                    "data: {\"candidates\":[2]}\n\n",
                    "data: {\"candidates\":[3]}\n\n",
                ]
                .map(|chunk| Ok::<_, std::io::Error>(Bytes::from(chunk)));
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    Body::from_stream(futures::stream::iter(chunks)),
                )
            }
        }),
    ))
    .await;

    let harness = Harness::new();
    let mut ch = channel(&upstream, &["gk-1"], 1);
    ch.service_type = ServiceType::Gemini;
    harness.add_channel(Dialect::Gemini, ch);

    let mut request = post_json(
        "/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse&key=client-secret",
        json!({"contents": [{"parts": [{"text": "hi"}]}]}),
    );
    request
        .headers_mut()
        .insert(header::ACCEPT, "text/event-stream".parse().unwrap());

    let (status, headers, body) = harness.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "text/event-stream");
    assert_eq!(
        String::from_utf8_lossy(&body),
        "data: {\"candidates\":[1]}\n\ndata: {\"candidates\":[2]}\n\ndata: {\"candidates\":[3]}\n\n"
    );

    let (uri, goog_key) = seen.lock().unwrap().clone().expect("upstream not called");
    // client credential query param was stripped; channel key applied instead
    assert!(uri.contains("alt=sse"));
    assert!(!uri.contains("client-secret"));
    assert_eq!(goog_key.as_deref(), Some("gk-1"));
}

// ---------------------------------------------------------------------------
// S6: bridge mode (Responses dialect on a Claude upstream)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bridge_mode_translates_and_keeps_the_session() {
    let bodies: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let capture = bodies.clone();
    let upstream = spawn_upstream(Router::new().route(
        "/v1/messages",
        post(move |Json(body): Json<Value>| {
            let capture = capture.clone();
            async move {
                capture.lock().unwrap().push(body);
                Json(claude_ok_body())
            }
        }),
    ))
    .await;

    let harness = Harness::new();
    harness.add_channel(Dialect::Responses, channel(&upstream, &["ka"], 1));

    let (status, reply) = harness
        .send_json(post_json(
            "/v1/responses",
            json!({"model": "m", "input": "hi", "previous_response_id": ""}),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["object"], "response");
    let response_id = reply["id"].as_str().unwrap().to_string();
    assert!(response_id.starts_with("resp_"));
    assert_eq!(reply["output"][0]["type"], "message");
    assert_eq!(reply["output"][0]["role"], "assistant");
    assert_eq!(reply["output"][0]["content"][0]["type"], "output_text");
    assert_eq!(reply["output"][0]["content"][0]["text"], "Hello!");
    assert_eq!(reply["usage"]["input_tokens"], 3);
    assert_eq!(reply["usage"]["output_tokens"], 5);

    {
        let bodies = bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["messages"], json!([{"role": "user", "content": "hi"}]));
        assert_eq!(bodies[0]["max_tokens"], 4096);
        assert_eq!(bodies[0]["stream"], false);
    }

    // the session now holds both turns under the new response id
    let session = harness.state().sessions.get(&response_id).expect("session");
    assert_eq!(session.turns.len(), 2);
    assert_eq!(session.turns[1].role, "assistant");
    assert_eq!(session.turns[1].content, "Hello!");

    // a follow-up request replays the stored history to the upstream
    let (status, reply) = harness
        .send_json(post_json(
            "/v1/responses",
            json!({"model": "m", "input": "and now?", "previous_response_id": response_id}),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let second_id = reply["id"].as_str().unwrap();
    assert_ne!(second_id, response_id);

    let bodies = bodies.lock().unwrap();
    assert_eq!(bodies.len(), 2);
    let replayed = bodies[1]["messages"].as_array().unwrap();
    assert_eq!(replayed.len(), 3);
    assert_eq!(replayed[0]["content"], "hi");
    assert_eq!(replayed[1]["content"], "Hello!");
    assert_eq!(replayed[2]["content"], "and now?");
}

// ---------------------------------------------------------------------------
// S4 (first half): repeated 500s open the circuit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tripped_circuit_stops_attempts() {
    let upstream = spawn_upstream(Router::new().route(
        "/v1/messages",
        post(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": {"type": "api_error", "message": "down"}})),
            )
        }),
    ))
    .await;

    let harness = Harness::new();
    let ch = harness.add_channel(Dialect::Messages, channel(&upstream, &["ka"], 1));

    for _ in 0..3 {
        let (status, _) = harness
            .send_json(post_json("/v1/messages", messages_body()))
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert!(harness.state().scheduler.is_broken(&ch.id));

    // the 4th request never reaches the upstream
    let (status, body) = harness
        .send_json(post_json("/v1/messages", messages_body()))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["message"], "no available channels");

    // manual reset restores traffic
    harness.control.scheduler_reset(&ch.id);
    let (status, _) = harness
        .send_json(post_json("/v1/messages", messages_body()))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

#[tokio::test]
async fn control_plane_crud_and_stats() {
    let harness = Harness::new();
    assert!(harness.control.channel_list(Dialect::Messages).is_empty());

    let created = harness.add_channel(
        Dialect::Messages,
        channel("http://127.0.0.1:1", &["sk-a"], 1),
    );
    assert!(created.id.starts_with("ch-"));
    assert_eq!(harness.control.channel_list(Dialect::Messages).len(), 1);

    let mut updated = created.clone();
    updated.name = "renamed".into();
    let updated = harness
        .control
        .channel_update(Dialect::Messages, 0, updated)
        .unwrap();
    assert_eq!(updated.name, "renamed");

    let stats = harness.control.global_stats();
    assert_eq!(stats.channel_count, 1);
    assert_eq!(stats.total_requests, 0);

    harness.control.channel_delete(Dialect::Messages, 0).unwrap();
    assert!(harness.control.channel_list(Dialect::Messages).is_empty());
    assert!(
        harness
            .control
            .channel_delete(Dialect::Messages, 0)
            .is_err()
    );
}

#[tokio::test]
async fn control_plane_lifecycle_serves_and_stops() {
    let harness = Harness::new();
    // port 0 lets the OS pick a free port
    harness.state().settings.set_port(0).unwrap();

    let status = harness.control.proxy_start().await.unwrap();
    assert!(status.running);
    let port = harness.control.bound_port().await.expect("bound port");
    assert_ne!(port, 0);

    let health: Value = harness
        .state()
        .http
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await
        .expect("health request")
        .json()
        .await
        .expect("health body");
    assert_eq!(health["service"], "waveproxy");

    harness.control.proxy_stop().await.unwrap();
    let status = harness.control.proxy_status().await;
    assert!(!status.running);
    assert!(
        harness
            .state()
            .http
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await
            .is_err()
    );
}

#[tokio::test]
async fn channel_ping_measures_reachability() {
    let upstream = spawn_upstream(Router::new().route(
        "/v1/messages",
        post(|| async { Json(claude_ok_body()) }),
    ))
    .await;

    let harness = Harness::new();
    harness.add_channel(Dialect::Messages, channel(&upstream, &["ka"], 1));
    // a 404 from the base URL still proves reachability
    let ping = harness.control.channel_ping(Dialect::Messages, 0).await.unwrap();
    assert!(ping.success);

    harness.add_channel(Dialect::Messages, channel("http://127.0.0.1:1", &["kb"], 2));
    let ping = harness.control.channel_ping(Dialect::Messages, 1).await.unwrap();
    assert!(!ping.success);
    assert!(ping.error.is_some());
}

// ---------------------------------------------------------------------------
// Models routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn models_listing_skips_non_openai_channels() {
    let upstream = spawn_upstream(Router::new().route(
        "/v1/models",
        axum::routing::get(|| async { Json(json!({"object": "list", "data": []})) }),
    ))
    .await;

    let harness = Harness::new();
    // a claude-service channel sits first in priority order
    harness.add_channel(Dialect::Responses, channel("http://127.0.0.1:1", &["ka"], 1));
    let mut openai = channel(&upstream, &["kb"], 2);
    openai.service_type = ServiceType::OpenAI;
    harness.add_channel(Dialect::Responses, openai);

    let request = Request::builder()
        .uri("/v1/models")
        .body(Body::empty())
        .unwrap();
    let (status, body) = harness.send_json(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], "list");
}
