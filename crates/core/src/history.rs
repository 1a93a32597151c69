use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::channel::Dialect;
use crate::metrics::TokenUsage;
use crate::redact::redact_secrets;

pub const HISTORY_CAPACITY: usize = 1000;
const HISTORY_WINDOW_SECS: i64 = 48 * 60 * 60;
const MAX_ERROR_DETAILS: usize = 8 * 1024;

/// One proxied request attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub channel_id: String,
    pub dialect: Dialect,
    pub model: String,
    pub success: bool,
    pub latency_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub error: Option<String>,
    pub error_details: Option<String>,
}

#[derive(Debug, Default)]
pub struct HistoryQuery {
    pub limit: usize,
    pub offset: usize,
    pub channel_id: Option<String>,
    pub success: Option<bool>,
}

/// Bounded in-memory FIFO of recent requests; oldest entries drop when either
/// the capacity or the retention window is exceeded.
pub struct RequestHistory {
    entries: RwLock<VecDeque<HistoryRecord>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl RequestHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            // Seeded from wall-clock microseconds so ids stay time-ordered
            // across restarts while remaining strictly monotonic in-process.
            next_id: AtomicU64::new(Utc::now().timestamp_micros() as u64),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        channel_id: &str,
        dialect: Dialect,
        model: &str,
        success: bool,
        latency_ms: u64,
        usage: &TokenUsage,
        error: Option<String>,
        error_details: Option<String>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = HistoryRecord {
            id,
            timestamp: Utc::now(),
            channel_id: channel_id.to_string(),
            dialect,
            model: model.to_string(),
            success,
            latency_ms,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            error: error.map(|e| redact_secrets(&e)),
            error_details: error_details.map(|d| truncate_details(&redact_secrets(&d))),
        };
        if let Ok(mut entries) = self.entries.write() {
            prune_window(&mut entries);
            if entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(record);
        }
        id
    }

    /// Newest-first page of matching records plus the total match count.
    pub fn query(&self, query: &HistoryQuery) -> (Vec<HistoryRecord>, usize) {
        let limit = if query.limit == 0 { 50 } else { query.limit };
        let entries = match self.entries.read() {
            Ok(entries) => entries,
            Err(_) => return (Vec::new(), 0),
        };
        let cutoff = Utc::now().timestamp() - HISTORY_WINDOW_SECS;
        let matching: Vec<&HistoryRecord> = entries
            .iter()
            .rev()
            .filter(|record| {
                record.timestamp.timestamp() >= cutoff
                    && query
                        .channel_id
                        .as_deref()
                        .is_none_or(|id| record.channel_id == id)
                    && query.success.is_none_or(|s| record.success == s)
            })
            .collect();
        let total = matching.len();
        let records = matching
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect();
        (records, total)
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RequestHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

fn prune_window(entries: &mut VecDeque<HistoryRecord>) {
    let cutoff = Utc::now().timestamp() - HISTORY_WINDOW_SECS;
    while entries
        .front()
        .is_some_and(|record| record.timestamp.timestamp() < cutoff)
    {
        entries.pop_front();
    }
}

fn truncate_details(details: &str) -> String {
    if details.len() <= MAX_ERROR_DETAILS {
        return details.to_string();
    }
    let mut end = MAX_ERROR_DETAILS;
    while !details.is_char_boundary(end) {
        end -= 1;
    }
    details[..end].to_string()
}
