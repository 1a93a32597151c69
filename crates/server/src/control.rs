use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use waveproxy_core::channel::{Channel, Dialect};
use waveproxy_core::error::ProxyError;
use waveproxy_core::history::{HistoryQuery, HistoryRecord};
use waveproxy_core::metrics::{ChannelCounters, GlobalStats};
use waveproxy_route::client::PING_TIMEOUT;

use crate::{AppState, build_router};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub running: bool,
    pub port: u16,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "uptime")]
    pub uptime_secs: u64,
    pub version: String,
    pub channel_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResult {
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

struct ListenerHandle {
    port: u16,
    started_at: DateTime<Utc>,
    started: Instant,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The in-process control plane: lifecycle over the HTTP listener, CRUD over
/// channels, and read access to metrics, history and scheduler state.
pub struct ControlPlane {
    state: AppState,
    listener: Mutex<Option<ListenerHandle>>,
}

impl ControlPlane {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            listener: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Bind `127.0.0.1:<port>` and serve until stopped. Idempotent while
    /// running.
    pub async fn proxy_start(&self) -> Result<ProxyStatus, ProxyError> {
        let mut guard = self.listener.lock().await;
        if guard.is_none() {
            let port = self.state.settings.current().port;
            let listener = TcpListener::bind(("127.0.0.1", port))
                .await
                .map_err(|e| ProxyError::Config(format!("failed to bind port {port}: {e}")))?;
            let bound_port = listener
                .local_addr()
                .map(|addr| addr.port())
                .unwrap_or(port);
            let (shutdown, mut shutdown_rx) = watch::channel(false);
            let router = build_router(self.state.clone());
            let task = tokio::spawn(async move {
                let wait = async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                };
                if let Err(e) = axum::serve(listener, router)
                    .with_graceful_shutdown(wait)
                    .await
                {
                    tracing::error!("proxy listener failed: {e}");
                }
            });
            tracing::info!(port = bound_port, "proxy listening on 127.0.0.1");
            *guard = Some(ListenerHandle {
                port: bound_port,
                started_at: Utc::now(),
                started: Instant::now(),
                shutdown,
                task,
            });
        }
        Ok(status_of(&self.state, guard.as_ref()))
    }

    /// Gracefully drain and stop the listener. A no-op when not running.
    pub async fn proxy_stop(&self) -> Result<(), ProxyError> {
        let handle = self.listener.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            let _ = handle.task.await;
            tracing::info!(port = handle.port, "proxy stopped");
        }
        Ok(())
    }

    pub async fn proxy_status(&self) -> ProxyStatus {
        status_of(&self.state, self.listener.lock().await.as_ref())
    }

    /// Persist a new port; a running listener is restarted on it.
    pub async fn proxy_set_port(&self, port: u16) -> Result<ProxyStatus, ProxyError> {
        self.state.settings.set_port(port)?;
        let running = self.listener.lock().await.is_some();
        if running {
            self.proxy_stop().await?;
            return self.proxy_start().await;
        }
        Ok(self.proxy_status().await)
    }

    pub async fn bound_port(&self) -> Option<u16> {
        self.listener.lock().await.as_ref().map(|h| h.port)
    }

    // ── Channel CRUD ───────────────────────────────────────────────────────

    pub fn channel_list(&self, dialect: Dialect) -> Vec<Channel> {
        self.state.channels.list(dialect)
    }

    pub fn channel_create(
        &self,
        dialect: Dialect,
        channel: Channel,
    ) -> Result<Channel, ProxyError> {
        let created = self.state.settings.add_channel(dialect, channel)?;
        self.state.channels.sync(&self.state.settings.current());
        Ok(created)
    }

    pub fn channel_update(
        &self,
        dialect: Dialect,
        index: usize,
        channel: Channel,
    ) -> Result<Channel, ProxyError> {
        let updated = self.state.settings.update_channel(dialect, index, channel)?;
        self.state.channels.sync(&self.state.settings.current());
        Ok(updated)
    }

    pub fn channel_delete(&self, dialect: Dialect, index: usize) -> Result<(), ProxyError> {
        self.state.settings.delete_channel(dialect, index)?;
        self.state.channels.sync(&self.state.settings.current());
        Ok(())
    }

    pub fn set_access_key(&self, access_key: &str) -> Result<(), ProxyError> {
        self.state.settings.set_access_key(access_key)
    }

    /// Minimal reachability probe against the channel's base URL.
    pub async fn channel_ping(&self, dialect: Dialect, index: usize) -> Result<PingResult, ProxyError> {
        let channel = self
            .state
            .channels
            .get(dialect, index)
            .ok_or_else(|| {
                ProxyError::BadRequest(format!("no {dialect} channel at index {index}"))
            })?;
        let started = Instant::now();
        let outcome = self
            .state
            .http
            .get(channel.trimmed_base_url())
            .timeout(PING_TIMEOUT)
            .send()
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;
        Ok(match outcome {
            // Any HTTP response means the endpoint is reachable.
            Ok(_) => PingResult {
                success: true,
                latency_ms,
                error: None,
            },
            Err(e) => PingResult {
                success: false,
                latency_ms,
                error: Some(ProxyError::from(e).to_string()),
            },
        })
    }

    // ── Observability ──────────────────────────────────────────────────────

    pub fn channel_metrics(&self, channel_id: Option<&str>) -> serde_json::Value {
        match channel_id {
            Some(id) => json!(self.state.metrics.channel(id)),
            None => {
                let all: HashMap<String, ChannelCounters> = self.state.metrics.all_channels();
                json!(all)
            }
        }
    }

    pub fn global_stats(&self) -> GlobalStats {
        self.state
            .metrics
            .global_stats(self.state.channels.total_count())
    }

    pub fn scheduler_stats(&self) -> serde_json::Value {
        self.state.scheduler.stats()
    }

    /// Clear a channel's circuit breaker and its mirrored metrics flag.
    pub fn scheduler_reset(&self, channel_id: &str) {
        self.state.scheduler.reset(channel_id);
        self.state.metrics.set_broken(channel_id, false);
    }

    pub fn request_history(
        &self,
        limit: usize,
        offset: usize,
        channel_id: Option<String>,
        success: Option<bool>,
    ) -> (Vec<HistoryRecord>, usize) {
        self.state.history.query(&HistoryQuery {
            limit,
            offset,
            channel_id,
            success,
        })
    }

    pub fn history_clear(&self) {
        self.state.history.clear();
    }
}

fn status_of(state: &AppState, handle: Option<&ListenerHandle>) -> ProxyStatus {
    ProxyStatus {
        running: handle.is_some(),
        port: handle
            .map(|h| h.port)
            .unwrap_or_else(|| state.settings.current().port),
        started_at: handle.map(|h| h.started_at),
        uptime_secs: handle.map(|h| h.started.elapsed().as_secs()).unwrap_or(0),
        version: env!("CARGO_PKG_VERSION").to_string(),
        channel_count: state.channels.total_count(),
    }
}
