use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::event::DaemonEvent;

pub const MIN_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_HISTORY: usize = 20;
pub const DEFAULT_MAX_CACHE_MB: u64 = 200;
pub const DEFAULT_CACHE_EXPIRY_DAYS: u64 = 30;
pub const DEFAULT_BASE_URL: &str = "https://api.linkwall.app";

/// The two surfaces an assigned image can be applied to.
/// Used to key per-surface subscription state independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKind {
    Desktop,
    Lockscreen,
}

impl SubscriptionKind {
    /// Both kinds, desktop first. Iteration order matters wherever
    /// "desktop preferred" tie-breaking applies.
    pub const ALL: [SubscriptionKind; 2] = [SubscriptionKind::Desktop, SubscriptionKind::Lockscreen];
}

/// Whether one subscription id feeds both surfaces or each has its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    Shared,
    Separate,
}

/// How an image is mapped onto the target surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    Fill,
    Fit,
    Center,
    Tile,
    Stretch,
}

/// Root configuration structure. Deserialized from config.toml under the
/// app data directory.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Which remote links feed which surface.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionsConfig {
    /// Subscription id for the desktop surface ("" = unset).
    #[serde(default)]
    pub desktop_id: String,
    /// Subscription id for the lock-screen surface ("" = unset).
    /// Ignored in shared mode.
    #[serde(default)]
    pub lockscreen_id: String,
    /// Shared: one id feeds both surfaces. Separate: each surface checks its own id.
    #[serde(default = "default_link_mode")]
    pub link_mode: LinkMode,
    #[serde(default = "default_true")]
    pub desktop_enabled: bool,
    #[serde(default = "default_true")]
    pub lockscreen_enabled: bool,
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            desktop_id: String::new(),
            lockscreen_id: String::new(),
            link_mode: LinkMode::Shared,
            desktop_enabled: true,
            lockscreen_enabled: true,
        }
    }
}

impl SubscriptionsConfig {
    /// Returns the configured id for `kind`, or `None` when blank.
    pub fn id_for(&self, kind: SubscriptionKind) -> Option<&str> {
        let id = match kind {
            SubscriptionKind::Desktop => self.desktop_id.trim(),
            SubscriptionKind::Lockscreen => self.lockscreen_id.trim(),
        };
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }

    /// The single id used in shared mode: desktop preferred, lock-screen
    /// as fallback.
    pub fn shared_id(&self) -> Option<&str> {
        self.id_for(SubscriptionKind::Desktop)
            .or_else(|| self.id_for(SubscriptionKind::Lockscreen))
    }

    pub fn enabled_for(&self, kind: SubscriptionKind) -> bool {
        match kind {
            SubscriptionKind::Desktop => self.desktop_enabled,
            SubscriptionKind::Lockscreen => self.lockscreen_enabled,
        }
    }

    /// True when no cycle work is possible because no surface has a usable id.
    pub fn has_usable_id(&self) -> bool {
        match self.link_mode {
            LinkMode::Shared => self.shared_id().is_some(),
            LinkMode::Separate => {
                self.id_for(SubscriptionKind::Desktop).is_some()
                    || self.id_for(SubscriptionKind::Lockscreen).is_some()
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between checks. Floored at [`MIN_POLL_INTERVAL_SECS`].
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// When set, checks run only while some active interface is on a
    /// private (home/office) network.
    #[serde(default)]
    pub restrict_to_local_network: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            restrict_to_local_network: false,
        }
    }
}

impl PollingConfig {
    /// Returns the effective inter-cycle sleep, floored at the minimum.
    pub fn effective_interval_secs(&self) -> u64 {
        self.interval_secs.max(MIN_POLL_INTERVAL_SECS)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Maximum retained history entries. 0 = never persist (listeners are
    /// still notified of applied images).
    #[serde(default = "default_max_history")]
    pub max_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_HISTORY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Total on-disk budget for cached images, in megabytes.
    #[serde(default = "default_max_cache_mb")]
    pub max_size_mb: u64,
    /// Entries older than this are purged (lazily on lookup, eagerly once
    /// at startup).
    #[serde(default = "default_cache_expiry_days")]
    pub expiry_days: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: DEFAULT_MAX_CACHE_MB,
            expiry_days: DEFAULT_CACHE_EXPIRY_DAYS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_fit_mode")]
    pub fit_mode: FitMode,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            fit_mode: FitMode::Fill,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Credential sent with feedback responses ("" = responses disabled).
    #[serde(default)]
    pub api_key: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaemonConfig {
    /// Register the daemon to launch at login (Windows Run key).
    #[serde(default)]
    pub autostart: bool,
}

/// Loads the config file at `path`, returning `Config::default()` if the file
/// does not exist. Returns an error if the file exists but cannot be read or
/// parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the
/// config file is created or modified, reloads it and sends a
/// `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::UnboundedSender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("[config] Failed to create file watcher: {e}");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            eprintln!("[config] Config path has no parent directory");
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        eprintln!("[config] Failed to watch config directory: {e}");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    if tx.send(DaemonEvent::ConfigReloaded(config)).is_err() {
                        break;
                    }
                }
                Err(e) => eprintln!("[config] Failed to reload config: {e}"),
            }
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_link_mode() -> LinkMode {
    LinkMode::Shared
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY
}

fn default_max_cache_mb() -> u64 {
    DEFAULT_MAX_CACHE_MB
}

fn default_cache_expiry_days() -> u64 {
    DEFAULT_CACHE_EXPIRY_DAYS
}

fn default_fit_mode() -> FitMode {
    FitMode::Fill
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
