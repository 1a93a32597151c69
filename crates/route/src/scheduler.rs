use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use waveproxy_core::channel::{Channel, ChannelDirectory, Dialect};
use waveproxy_core::error::ProxyError;

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};

#[derive(Debug)]
struct KeyAffinity {
    key: String,
    expires_at: Instant,
}

#[derive(Default)]
struct SchedulerState {
    breakers: HashMap<String, CircuitBreaker>,
    /// user-id → channel-id
    user_channel: HashMap<String, String>,
    /// (user-id, channel-id) → sticky key
    key_affinity: HashMap<(String, String), KeyAffinity>,
}

/// Channel selection with circuit breaking and user/key affinity. One mutex
/// guards all scheduler state; it is never held across upstream I/O.
pub struct ChannelScheduler {
    directory: Arc<ChannelDirectory>,
    config: BreakerConfig,
    state: Mutex<SchedulerState>,
}

impl ChannelScheduler {
    pub fn new(directory: Arc<ChannelDirectory>, config: BreakerConfig) -> Self {
        Self {
            directory,
            config,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pick the channel for this request: sticky channel first, then promoted
    /// candidates, then priority order, finally a half-open recovery probe.
    pub fn select(
        &self,
        dialect: Dialect,
        user_id: &str,
        exclude: &HashSet<String>,
    ) -> Result<Channel, ProxyError> {
        let candidates: Vec<Channel> = self
            .directory
            .active_sorted(dialect)
            .into_iter()
            .filter(|ch| !exclude.contains(&ch.id))
            .collect();
        if candidates.is_empty() {
            return Err(ProxyError::NoAvailableChannel);
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut state = self.lock();

        if !user_id.is_empty()
            && let Some(sticky) = state.user_channel.get(user_id).cloned()
            && let Some(channel) = candidates.iter().find(|ch| ch.id == sticky)
        {
            let serving = {
                let breaker = state.breakers.entry(channel.id.clone()).or_default();
                if breaker.is_closed(&self.config) {
                    true
                } else if breaker.can_probe(&self.config) {
                    breaker.begin_probe();
                    true
                } else {
                    false
                }
            };
            if serving {
                return Ok(pick(&mut state, channel, user_id));
            }
        }

        // Promoted candidates outrank their priority peers until the deadline.
        for promoted_pass in [true, false] {
            for channel in &candidates {
                if channel.is_promoted(now_ms) != promoted_pass {
                    continue;
                }
                let breaker = state.breakers.entry(channel.id.clone()).or_default();
                if breaker.is_closed(&self.config) {
                    return Ok(pick(&mut state, channel, user_id));
                }
            }
        }

        for channel in &candidates {
            let breaker = state.breakers.entry(channel.id.clone()).or_default();
            if breaker.can_probe(&self.config) {
                breaker.begin_probe();
                tracing::debug!(channel = %channel.id, "probing half-open channel");
                return Ok(pick(&mut state, channel, user_id));
            }
        }

        Err(ProxyError::NoAvailableChannel)
    }

    pub fn record_success(&self, channel_id: &str) {
        let mut state = self.lock();
        state
            .breakers
            .entry(channel_id.to_string())
            .or_default()
            .record_success(&self.config);
    }

    pub fn record_failure(&self, channel_id: &str, retryable: bool) {
        let mut state = self.lock();
        let breaker = state.breakers.entry(channel_id.to_string()).or_default();
        breaker.record_failure(&self.config, retryable);
        if breaker.state(&self.config) == CircuitState::Open {
            tracing::warn!(channel = %channel_id, "circuit opened");
        }
    }

    pub fn is_broken(&self, channel_id: &str) -> bool {
        let mut state = self.lock();
        state
            .breakers
            .get_mut(channel_id)
            .is_some_and(|b| b.state(&self.config) == CircuitState::Open)
    }

    /// Manual reset: force closed and clear counters.
    pub fn reset(&self, channel_id: &str) {
        let mut state = self.lock();
        if let Some(breaker) = state.breakers.get_mut(channel_id) {
            breaker.reset();
        }
    }

    // ── Key affinity ───────────────────────────────────────────────────────

    pub fn key_affinity(&self, user_id: &str, channel_id: &str) -> Option<String> {
        if user_id.is_empty() {
            return None;
        }
        let mut state = self.lock();
        let slot = (user_id.to_string(), channel_id.to_string());
        match state.key_affinity.get(&slot) {
            Some(affinity) if affinity.expires_at > Instant::now() => Some(affinity.key.clone()),
            Some(_) => {
                state.key_affinity.remove(&slot);
                None
            }
            None => None,
        }
    }

    pub fn set_key_affinity(&self, user_id: &str, channel_id: &str, key: &str, ttl: Duration) {
        if user_id.is_empty() {
            return;
        }
        let mut state = self.lock();
        state.key_affinity.insert(
            (user_id.to_string(), channel_id.to_string()),
            KeyAffinity {
                key: key.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn sticky_channel(&self, user_id: &str) -> Option<String> {
        self.lock().user_channel.get(user_id).cloned()
    }

    pub fn stats(&self) -> serde_json::Value {
        let mut state = self.lock();
        let config = self.config.clone();
        let mut channels = serde_json::Map::new();
        for (id, breaker) in state.breakers.iter_mut() {
            channels.insert(
                id.clone(),
                json!({
                    "state": breaker.state(&config),
                    "consecutiveFailures": breaker.consecutive_failures(),
                    "lastSuccessAgoSecs": breaker.last_success.map(|t| t.elapsed().as_secs()),
                    "lastFailureAgoSecs": breaker.last_failure.map(|t| t.elapsed().as_secs()),
                    "openedAgoSecs": breaker.opened_at().map(|t| t.elapsed().as_secs()),
                }),
            );
        }
        json!({
            "breakers": channels,
            "userAffinityCount": state.user_channel.len(),
            "keyAffinityCount": state.key_affinity.len(),
        })
    }
}

fn pick(state: &mut SchedulerState, channel: &Channel, user_id: &str) -> Channel {
    if !user_id.is_empty() {
        state
            .user_channel
            .insert(user_id.to_string(), channel.id.clone());
    }
    channel.clone()
}

/// Rotate the sticky key to the front of the attempt order; an unknown key
/// leaves the order unchanged.
pub fn order_keys_with_affinity(mut keys: Vec<String>, affinity: Option<&str>) -> Vec<String> {
    if let Some(affinity) = affinity
        && let Some(position) = keys.iter().position(|k| k == affinity)
    {
        let sticky = keys.remove(position);
        keys.insert(0, sticky);
    }
    keys
}
