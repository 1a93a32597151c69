use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::settings::ProxySettings;

// ─── Tags ──────────────────────────────────────────────────────────────────

/// Client-facing API shape a channel serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Messages,
    Responses,
    Gemini,
}

impl Dialect {
    pub const ALL: [Dialect; 3] = [Dialect::Messages, Dialect::Responses, Dialect::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Responses => "responses",
            Self::Gemini => "gemini",
        }
    }

    /// Sticky-key lifetime for this dialect.
    pub fn affinity_ttl(&self) -> Duration {
        match self {
            Self::Messages => Duration::from_secs(5 * 60),
            Self::Responses | Self::Gemini => Duration::from_secs(15 * 60),
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "messages" => Ok(Self::Messages),
            "responses" => Ok(Self::Responses),
            "gemini" => Ok(Self::Gemini),
            _ => Err(format!("unknown dialect: {s}")),
        }
    }
}

/// The upstream's actual API shape. Independent of dialect so that a
/// Responses-dialect channel can be bridged to a Claude upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Claude,
    OpenAI,
    Gemini,
}

impl ServiceType {
    /// Default authentication scheme when the channel does not set one.
    pub fn default_auth(&self) -> AuthScheme {
        match self {
            Self::Claude => AuthScheme::XApiKey,
            Self::OpenAI => AuthScheme::Bearer,
            Self::Gemini => AuthScheme::XGoogApiKey,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthScheme {
    #[serde(rename = "x-api-key")]
    XApiKey,
    #[serde(rename = "bearer")]
    Bearer,
    #[serde(rename = "both")]
    Both,
    #[serde(rename = "x-goog-api-key")]
    XGoogApiKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Suspended,
    Disabled,
}

// ─── API key entries ───────────────────────────────────────────────────────

/// One upstream credential. Accepts both the legacy bare-string shape and the
/// current `{key, enabled}` object; always serializes as the object form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub enabled: bool,
}

impl ApiKeyEntry {
    pub fn enabled(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            enabled: true,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ApiKeyCompat {
    Plain(String),
    Entry {
        key: String,
        #[serde(default = "default_true")]
        enabled: bool,
    },
}

fn default_true() -> bool {
    true
}

impl<'de> Deserialize<'de> for ApiKeyEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match ApiKeyCompat::deserialize(deserializer)? {
            ApiKeyCompat::Plain(key) => ApiKeyEntry { key, enabled: true },
            ApiKeyCompat::Entry { key, enabled } => ApiKeyEntry { key, enabled },
        })
    }
}

// ─── Channel ───────────────────────────────────────────────────────────────

/// A unit of upstream capacity: endpoint, credentials, priority and status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub dialect: Dialect,
    pub service_type: ServiceType,
    pub base_url: String,
    pub backup_urls: Vec<String>,
    pub api_keys: Vec<ApiKeyEntry>,
    #[serde(rename = "authType")]
    pub auth_scheme: Option<AuthScheme>,
    /// Lower value = higher preference. Zero resolves to the list index so
    /// that unset priorities preserve insertion order.
    pub priority: i64,
    pub status: ChannelStatus,
    pub model_map: HashMap<String, String>,
    /// While in the future (epoch ms), the channel outranks its priority peers.
    pub promoted_until: Option<i64>,
    pub quality: Option<String>,
    pub description: String,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            dialect: Dialect::Messages,
            service_type: ServiceType::Claude,
            base_url: String::new(),
            backup_urls: Vec::new(),
            api_keys: Vec::new(),
            auth_scheme: None,
            priority: 0,
            status: ChannelStatus::Active,
            model_map: HashMap::new(),
            promoted_until: None,
            quality: None,
            description: String::new(),
        }
    }
}

impl Channel {
    pub fn effective_auth(&self) -> AuthScheme {
        self.auth_scheme
            .unwrap_or_else(|| self.service_type.default_auth())
    }

    /// Any key entry at all means channel-configured mode, even if every
    /// entry is disabled.
    pub fn has_configured_keys(&self) -> bool {
        !self.api_keys.is_empty()
    }

    pub fn enabled_keys(&self) -> Vec<String> {
        self.api_keys
            .iter()
            .filter(|k| k.enabled && !k.key.trim().is_empty())
            .map(|k| k.key.clone())
            .collect()
    }

    pub fn rewrite_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_map.get(model).map(String::as_str).unwrap_or(model)
    }

    pub fn is_promoted(&self, now_ms: i64) -> bool {
        self.promoted_until.is_some_and(|deadline| deadline > now_ms)
    }

    pub fn trimmed_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

fn effective_priority(channel: &Channel, index: usize) -> i64 {
    if channel.priority == 0 {
        index as i64
    } else {
        channel.priority
    }
}

// ─── Directory ─────────────────────────────────────────────────────────────

/// The three ordered per-dialect channel lists, synced from the settings
/// store after every mutation.
pub struct ChannelDirectory {
    lists: RwLock<HashMap<Dialect, Vec<Channel>>>,
}

impl ChannelDirectory {
    pub fn new(settings: &ProxySettings) -> Self {
        let directory = Self {
            lists: RwLock::new(HashMap::new()),
        };
        directory.sync(settings);
        directory
    }

    pub fn sync(&self, settings: &ProxySettings) {
        let mut map = HashMap::new();
        for dialect in Dialect::ALL {
            map.insert(dialect, settings.channels.list(dialect).to_vec());
        }
        if let Ok(mut lists) = self.lists.write() {
            *lists = map;
        }
    }

    pub fn list(&self, dialect: Dialect) -> Vec<Channel> {
        self.lists
            .read()
            .map(|lists| lists.get(&dialect).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn get(&self, dialect: Dialect, index: usize) -> Option<Channel> {
        self.lists
            .read()
            .ok()
            .and_then(|lists| lists.get(&dialect).and_then(|l| l.get(index)).cloned())
    }

    pub fn total_count(&self) -> usize {
        self.lists
            .read()
            .map(|lists| lists.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Active channels in scheduling order: effective priority ascending
    /// (stored 0 resolves to the list index), then dialect, then original
    /// index for deterministic ties.
    pub fn active_sorted(&self, dialect: Dialect) -> Vec<Channel> {
        let mut active: Vec<(usize, Channel)> = self
            .list(dialect)
            .into_iter()
            .enumerate()
            .filter(|(_, ch)| ch.status == ChannelStatus::Active)
            .collect();
        active.sort_by_key(|(index, ch)| {
            (effective_priority(ch, *index), ch.dialect.as_str(), *index)
        });
        active.into_iter().map(|(_, ch)| ch).collect()
    }
}
