//! Configuration file parser for ~/.config/feedwatch/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde, though we log a warning when the file
//! contains potential typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{DEFAULT_MAX_FEED_SIZE, DEFAULT_MAX_ICON_SIZE, DEFAULT_MAX_REDIRECTS};
use crate::schedule::scheduler::{DEFAULT_MAX_CONCURRENT_FETCHES, DEFAULT_USER_AGENT};
use crate::schedule::{RefreshInterval, RefreshPolicy, SchedulerOptions, DEFAULT_BACKOFF_CAP};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level daemon configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Simultaneous feed fetches. Clamped to at least 1.
    pub max_concurrent_fetches: usize,

    /// Cap on the error backoff multiplier. Clamped to at least 1.
    pub backoff_cap: u32,

    /// Interval applied to newly registered feeds.
    pub default_refresh: RefreshInterval,

    /// Timeout for background fetches, in seconds.
    pub request_timeout_secs: u64,

    /// Timeout for user-initiated fetches, in seconds.
    pub urgent_request_timeout_secs: u64,

    pub max_redirects: usize,
    pub max_feed_size_bytes: usize,
    pub max_icon_size_bytes: usize,

    /// Where icon files are written. Defaults to `icons/` next to the database.
    pub icon_dir: Option<PathBuf>,

    pub user_agent: String,

    /// Allow feeds on localhost and private networks.
    pub allow_private_hosts: bool,

    /// `host:port` polled to detect network reachability. Unset disables the monitor.
    pub reachability_target: Option<String>,
    pub reachability_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            default_refresh: RefreshInterval::default(),
            request_timeout_secs: 90,
            urgent_request_timeout_secs: 30,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_feed_size_bytes: DEFAULT_MAX_FEED_SIZE,
            max_icon_size_bytes: DEFAULT_MAX_ICON_SIZE,
            icon_dir: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            allow_private_hosts: false,
            reachability_target: None,
            reachability_interval_secs: 30,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 13] = [
        "max_concurrent_fetches",
        "backoff_cap",
        "default_refresh",
        "request_timeout_secs",
        "urgent_request_timeout_secs",
        "max_redirects",
        "max_feed_size_bytes",
        "max_icon_size_bytes",
        "icon_dir",
        "user_agent",
        "allow_private_hosts",
        "reachability_target",
        "reachability_interval_secs",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!("Config file is empty, using defaults");
            return Ok(Self::default());
        }

        // Parse as a raw table first to detect unknown keys
        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            max_concurrent_fetches = config.max_concurrent_fetches,
            backoff_cap = config.backoff_cap,
            default_refresh = %config.default_refresh,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Runtime options for the scheduler. `data_dir` anchors the default icon directory.
    pub fn scheduler_options(&self, data_dir: &Path) -> SchedulerOptions {
        SchedulerOptions {
            max_concurrent_fetches: self.max_concurrent_fetches.max(1),
            policy: RefreshPolicy::new(self.backoff_cap),
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            urgent_request_timeout: Duration::from_secs(self.urgent_request_timeout_secs.max(1)),
            max_redirects: self.max_redirects,
            max_feed_size_bytes: self.max_feed_size_bytes,
            max_icon_size_bytes: self.max_icon_size_bytes,
            icon_dir: self
                .icon_dir
                .clone()
                .unwrap_or_else(|| data_dir.join("icons")),
            user_agent: self.user_agent.clone(),
            allow_private_hosts: self.allow_private_hosts,
        }
    }

    pub fn reachability_interval(&self) -> Duration {
        Duration::from_secs(self.reachability_interval_secs.max(1))
    }
}

// ============================================================================
// Tests
// ============================================================================
