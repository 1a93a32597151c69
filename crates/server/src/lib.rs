pub mod auth;
pub mod control;
pub mod dispatch;
pub mod handler;
pub mod middleware;

use axum::{Router, middleware as axum_mw, routing::get, routing::post};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use waveproxy_core::channel::ChannelDirectory;
use waveproxy_core::error::ProxyError;
use waveproxy_core::history::RequestHistory;
use waveproxy_core::metrics::MetricsRegistry;
use waveproxy_core::session::SessionStore;
use waveproxy_core::settings::SettingsStore;
use waveproxy_route::breaker::BreakerConfig;
use waveproxy_route::client::build_http_client;
use waveproxy_route::scheduler::ChannelScheduler;

const BODY_LIMIT_BYTES: usize = 10 * 1024 * 1024;

/// Everything a request handler needs, injected at construction.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<SettingsStore>,
    pub channels: Arc<ChannelDirectory>,
    pub scheduler: Arc<ChannelScheduler>,
    pub metrics: Arc<MetricsRegistry>,
    pub history: Arc<RequestHistory>,
    pub sessions: Arc<SessionStore>,
    pub http: reqwest::Client,
}

pub fn build_state(settings: Arc<SettingsStore>) -> Result<AppState, ProxyError> {
    let channels = Arc::new(ChannelDirectory::new(&settings.current()));
    let scheduler = Arc::new(ChannelScheduler::new(
        channels.clone(),
        BreakerConfig::default(),
    ));
    Ok(AppState {
        settings,
        channels,
        scheduler,
        metrics: Arc::new(MetricsRegistry::new()),
        history: Arc::new(RequestHistory::default()),
        sessions: Arc::new(SessionStore::new()),
        http: build_http_client()?,
    })
}

pub fn build_router(state: AppState) -> Router {
    // Dialect routes sit behind the access-key check and the body limit.
    let api_routes = Router::new()
        .route("/v1/messages", post(handler::messages::messages))
        .route(
            "/v1/messages/count_tokens",
            post(handler::messages::count_tokens),
        )
        .route("/v1/responses", post(handler::responses::responses))
        .route("/responses", post(handler::responses::responses))
        .route("/v1/models", get(handler::models::list_models))
        .route("/models", get(handler::models::list_models))
        .route("/v1/models/{id}", get(handler::models::model_detail))
        .route("/models/{id}", get(handler::models::model_detail))
        .route(
            "/v1beta/models/{*model_and_action}",
            post(handler::gemini::generate),
        )
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            auth::access_key_middleware,
        ));

    Router::new()
        .route("/health", get(handler::health::health))
        .merge(api_routes)
        .fallback(handler::not_found)
        .layer(axum_mw::from_fn(middleware::request_logging_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
