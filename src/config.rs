// Tunables for the sync core
// Defaults, then the JSON config file, then CHATSYNC_* environment variables

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::DEFAULT_AVATAR_URL;

/// Upper bound for the debounce window
pub const MAX_THROTTLE_WINDOW_MS: u64 = 10_000;

pub const ENV_THROTTLE_MS: &str = "CHATSYNC_THROTTLE_MS";
pub const ENV_MAX_CACHED_MESSAGES: &str = "CHATSYNC_MAX_CACHED_MESSAGES";
pub const ENV_PAGE_SIZE: &str = "CHATSYNC_PAGE_SIZE";
pub const ENV_PREFETCH_CONCURRENCY: &str = "CHATSYNC_PREFETCH_CONCURRENCY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Trailing debounce window applied to accepted snapshots
    pub throttle_window_ms: u64,
    /// Newest messages kept per chat in the structured cache
    pub max_cached_messages: usize,
    /// Page size for the live message window and for older-page loads
    pub messages_per_page: usize,
    /// Parallel media fetches during prefetch
    pub prefetch_concurrency: usize,
    /// Parallel message-page queries while materializing a snapshot
    pub materialize_concurrency: usize,
    /// Prefix of the media cache names, bumped to invalidate old caches
    pub cache_version: String,
    pub max_upload_bytes: u64,
    /// Buffered dispatches per observer before it starts lagging
    pub broadcast_capacity: usize,
    /// First message of a newly created chat
    pub welcome_message: String,
    pub default_avatar_url: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            throttle_window_ms: 1000,
            max_cached_messages: 1000,
            messages_per_page: 50,
            prefetch_concurrency: 4,
            materialize_concurrency: 4,
            cache_version: "v1".to_string(),
            max_upload_bytes: 100 * 1024 * 1024,
            broadcast_capacity: 16,
            welcome_message: "¡Hola! ¿Cómo podemos ayudarte?".to_string(),
            default_avatar_url: DEFAULT_AVATAR_URL.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_window_ms)
    }

    /// Load the configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - Explicit config file. When `None` the default location is used if it exists.
    ///
    /// # Returns
    ///
    /// The merged configuration with environment overrides applied
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => SyncConfig::default(),
            },
        };
        config.apply_env();
        config.normalize();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let config: SyncConfig = serde_json::from_str(&contents)
            .map_err(|e| anyhow!("Invalid config file {}: {}", path.display(), e))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        info!("Saved configuration to {}", path.display());
        Ok(())
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides looked up by variable name. Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_override(&lookup, ENV_THROTTLE_MS) {
            self.throttle_window_ms = ms;
        }
        if let Some(n) = parse_override(&lookup, ENV_MAX_CACHED_MESSAGES) {
            self.max_cached_messages = n;
        }
        if let Some(n) = parse_override(&lookup, ENV_PAGE_SIZE) {
            self.messages_per_page = n;
        }
        if let Some(n) = parse_override(&lookup, ENV_PREFETCH_CONCURRENCY) {
            self.prefetch_concurrency = n;
        }
    }

    /// Clamp values into their usable ranges
    pub fn normalize(&mut self) {
        if self.throttle_window_ms > MAX_THROTTLE_WINDOW_MS {
            warn!(
                "Throttle window {}ms exceeds {}ms, clamping",
                self.throttle_window_ms, MAX_THROTTLE_WINDOW_MS
            );
            self.throttle_window_ms = MAX_THROTTLE_WINDOW_MS;
        }
        self.max_cached_messages = self.max_cached_messages.max(1);
        self.messages_per_page = self.messages_per_page.max(1);
        self.prefetch_concurrency = self.prefetch_concurrency.max(1);
        self.materialize_concurrency = self.materialize_concurrency.max(1);
        self.broadcast_capacity = self.broadcast_capacity.max(1);
        if self.cache_version.trim().is_empty() {
            self.cache_version = "v1".to_string();
        }
    }
}

fn parse_override<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value {:?} for {}", raw, name);
            None
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chatsync").join("config.json"))
}

/// Where the demo keeps its key-value cache
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("chatsync"))
        .ok_or_else(|| anyhow!("Could not determine data directory"))
}
