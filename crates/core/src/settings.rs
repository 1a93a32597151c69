use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::channel::{Channel, Dialect};
use crate::error::ProxyError;

pub const SETTINGS_FILE: &str = "waveproxy.json";
pub const DEFAULT_PORT: u16 = 3000;

// ─── Document ──────────────────────────────────────────────────────────────

/// The persisted proxy document: listen port, optional shared access key and
/// the three per-dialect channel lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    pub port: u16,
    pub access_key: String,
    pub channels: ChannelLists,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            access_key: String::new(),
            channels: ChannelLists::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelLists {
    pub messages: Vec<Channel>,
    pub responses: Vec<Channel>,
    pub gemini: Vec<Channel>,
}

impl ChannelLists {
    pub fn list(&self, dialect: Dialect) -> &[Channel] {
        match dialect {
            Dialect::Messages => &self.messages,
            Dialect::Responses => &self.responses,
            Dialect::Gemini => &self.gemini,
        }
    }

    pub fn list_mut(&mut self, dialect: Dialect) -> &mut Vec<Channel> {
        match dialect {
            Dialect::Messages => &mut self.messages,
            Dialect::Responses => &mut self.responses,
            Dialect::Gemini => &mut self.gemini,
        }
    }

    pub fn total(&self) -> usize {
        self.messages.len() + self.responses.len() + self.gemini.len()
    }
}

/// Fill derived fields and drop unusable key entries.
fn normalize(settings: &mut ProxySettings) {
    for dialect in Dialect::ALL {
        for channel in settings.channels.list_mut(dialect).iter_mut() {
            channel.dialect = dialect;
            channel.api_keys.retain(|k| !k.key.trim().is_empty());
            if channel.id.is_empty() {
                channel.id = format!("ch-{}", uuid::Uuid::new_v4());
            }
            while channel.base_url.ends_with('/') {
                channel.base_url.pop();
            }
            for url in channel.backup_urls.iter_mut() {
                while url.ends_with('/') {
                    url.pop();
                }
            }
        }
    }
}

// ─── Store ─────────────────────────────────────────────────────────────────

/// Settings store with lock-free reads and mutex-serialized, atomically
/// persisted mutations.
pub struct SettingsStore {
    path: PathBuf,
    current: ArcSwap<ProxySettings>,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    /// `<user config dir>/waveproxy/waveproxy.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("waveproxy")
            .join(SETTINGS_FILE)
    }

    /// Load the document at `path`; a missing file yields defaults.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ProxyError> {
        let path = path.into();
        let mut settings = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ProxyError::Config(format!("invalid settings file: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no settings file yet, starting with defaults");
                ProxySettings::default()
            }
            Err(e) => {
                return Err(ProxyError::Config(format!(
                    "failed to read settings file: {e}"
                )));
            }
        };
        normalize(&mut settings);
        Ok(Self {
            path,
            current: ArcSwap::from_pointee(settings),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deep snapshot of the current document.
    pub fn current(&self) -> Arc<ProxySettings> {
        self.current.load_full()
    }

    /// Apply a change under the store lock, persist atomically, then publish.
    pub fn mutate<F>(&self, apply: F) -> Result<Arc<ProxySettings>, ProxyError>
    where
        F: FnOnce(&mut ProxySettings) -> Result<(), ProxyError>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (*self.current.load_full()).clone();
        apply(&mut next)?;
        normalize(&mut next);
        self.persist(&next)?;
        let next = Arc::new(next);
        self.current.store(next.clone());
        Ok(next)
    }

    /// Replace the in-memory port without persisting (CLI override).
    pub fn override_port(&self, port: u16) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (*self.current.load_full()).clone();
        next.port = port;
        self.current.store(Arc::new(next));
    }

    /// Temp file in the same directory, fsync, rename over the target.
    fn persist(&self, settings: &ProxySettings) -> Result<(), ProxyError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProxyError::Config(format!("failed to create config dir: {e}")))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(settings)
            .map_err(|e| ProxyError::Internal(format!("failed to serialize settings: {e}")))?;
        let mut file = std::fs::File::create(&tmp)
            .map_err(|e| ProxyError::Config(format!("failed to write settings: {e}")))?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| ProxyError::Config(format!("failed to write settings: {e}")))?;
        drop(file);
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| ProxyError::Config(format!("failed to replace settings: {e}")))
    }

    // ── Mutating operations ────────────────────────────────────────────────

    pub fn add_channel(&self, dialect: Dialect, channel: Channel) -> Result<Channel, ProxyError> {
        let next = self.mutate(|settings| {
            settings.channels.list_mut(dialect).push(channel);
            Ok(())
        })?;
        next.channels
            .list(dialect)
            .last()
            .cloned()
            .ok_or_else(|| ProxyError::Internal("channel list empty after insert".into()))
    }

    pub fn update_channel(
        &self,
        dialect: Dialect,
        index: usize,
        channel: Channel,
    ) -> Result<Channel, ProxyError> {
        let next = self.mutate(|settings| {
            let list = settings.channels.list_mut(dialect);
            let slot = list.get_mut(index).ok_or_else(|| {
                ProxyError::BadRequest(format!("no {dialect} channel at index {index}"))
            })?;
            *slot = channel;
            Ok(())
        })?;
        next.channels
            .list(dialect)
            .get(index)
            .cloned()
            .ok_or_else(|| ProxyError::Internal("channel missing after update".into()))
    }

    pub fn delete_channel(&self, dialect: Dialect, index: usize) -> Result<(), ProxyError> {
        self.mutate(|settings| {
            let list = settings.channels.list_mut(dialect);
            if index >= list.len() {
                return Err(ProxyError::BadRequest(format!(
                    "no {dialect} channel at index {index}"
                )));
            }
            list.remove(index);
            Ok(())
        })?;
        Ok(())
    }

    pub fn set_port(&self, port: u16) -> Result<(), ProxyError> {
        self.mutate(|settings| {
            settings.port = port;
            Ok(())
        })?;
        Ok(())
    }

    pub fn set_access_key(&self, access_key: impl Into<String>) -> Result<(), ProxyError> {
        let access_key = access_key.into();
        self.mutate(|settings| {
            settings.access_key = access_key;
            Ok(())
        })?;
        Ok(())
    }
}
