use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Token usage parsed from an upstream response.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

/// Per-channel counter set.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCounters {
    pub requests: u64,
    pub success: u64,
    pub failure: u64,
    pub consecutive_failures: u64,
    pub broken: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub channel_count: usize,
}

/// In-memory metrics: a per-channel counter map plus a global roll-up.
/// Nothing here survives a restart.
pub struct MetricsRegistry {
    channels: Mutex<HashMap<String, ChannelCounters>>,
    total_requests: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            total_requests: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self, channel_id: &str, latency_ms: u64, usage: &TokenUsage) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let counters = channels.entry(channel_id.to_string()).or_default();
        counters.requests += 1;
        counters.success += 1;
        counters.consecutive_failures = 0;
        counters.input_tokens += usage.input_tokens;
        counters.output_tokens += usage.output_tokens;
        counters.cache_read_tokens += usage.cache_read_tokens;
        counters.cache_creation_tokens += usage.cache_creation_tokens;
        update_running_mean(counters, latency_ms);
    }

    pub fn record_failure(&self, channel_id: &str, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let counters = channels.entry(channel_id.to_string()).or_default();
        counters.requests += 1;
        counters.failure += 1;
        counters.consecutive_failures += 1;
        update_running_mean(counters, latency_ms);
    }

    /// Mirror of the scheduler's circuit state for the control plane.
    pub fn set_broken(&self, channel_id: &str, broken: bool) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.entry(channel_id.to_string()).or_default().broken = broken;
    }

    pub fn channel(&self, channel_id: &str) -> Option<ChannelCounters> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel_id)
            .cloned()
    }

    pub fn all_channels(&self) -> HashMap<String, ChannelCounters> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn global_stats(&self, channel_count: usize) -> GlobalStats {
        let total = self.total_requests.load(Ordering::Relaxed);
        let success = self.success_count.load(Ordering::Relaxed);
        GlobalStats {
            total_requests: total,
            success_count: success,
            failure_count: self.failure_count.load(Ordering::Relaxed),
            success_rate: if total > 0 {
                success as f64 / total as f64
            } else {
                0.0
            },
            channel_count,
        }
    }

    pub fn reset(&self, channel_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.remove(channel_id);
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn update_running_mean(counters: &mut ChannelCounters, latency_ms: u64) {
    let n = counters.requests as f64;
    counters.avg_latency_ms += (latency_ms as f64 - counters.avg_latency_ms) / n;
}
