//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/beacon/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/beacon/` (~/.config/beacon/)
//! - Data: `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/)
//! - State/Logs: `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)

use crate::db::repo::DEFAULT_MAX_ENTRIES;
use crate::environment::SendPolicy;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Event queue and collector configuration
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Event queue configuration
///
/// Controls where batches are uploaded, how eagerly the queue flushes and how
/// large it may grow.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Collector upload URL. Flushes are skipped while unset.
    pub server_url: Option<String>,

    /// Remote configuration URL
    pub config_url: Option<String>,

    /// Backlog size above which an enqueue flushes immediately
    #[serde(default = "default_flush_bulk_size")]
    pub flush_bulk_size: usize,

    /// Debounce delay for non-urgent flushes, in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Verification mode: flush every event immediately, one per batch, and
    /// escalate store failures
    #[serde(default)]
    pub verification_mode: bool,

    /// In verification mode, let the collector persist what it receives
    #[serde(default)]
    pub verification_write_through: bool,

    /// Network types uploads may use
    #[serde(default)]
    pub send_policy: SendPolicy,

    /// Event kinds that always flush immediately
    #[serde(default = "default_immediate_kinds")]
    pub immediate_kinds: Vec<String>,

    /// Entries per upload
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Entries per upload in verification mode
    #[serde(default = "default_verification_batch_size")]
    pub verification_batch_size: usize,

    /// Ceiling on batches per flush
    #[serde(default = "default_max_flush_iterations")]
    pub max_flush_iterations: usize,

    /// Queue capacity before the oldest entries are evicted
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// User-Agent header override
    pub user_agent: Option<String>,

    /// Keep batches rejected with 5xx/408/429 instead of discarding them
    #[serde(default = "default_true")]
    pub retry_server_errors: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            config_url: None,
            flush_bulk_size: default_flush_bulk_size(),
            flush_interval_ms: default_flush_interval_ms(),
            verification_mode: false,
            verification_write_through: false,
            send_policy: SendPolicy::default(),
            immediate_kinds: default_immediate_kinds(),
            batch_size: default_batch_size(),
            verification_batch_size: default_verification_batch_size(),
            max_flush_iterations: default_max_flush_iterations(),
            max_entries: default_max_entries(),
            timeout_secs: default_timeout(),
            user_agent: None,
            retry_server_errors: true,
        }
    }
}

impl QueueConfig {
    /// Check if an upload endpoint is configured
    pub fn is_ready(&self) -> bool {
        self.server_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }

    /// Entries per upload for the current mode
    pub fn effective_batch_size(&self) -> usize {
        if self.verification_mode {
            self.verification_batch_size
        } else {
            self.batch_size
        }
    }

    /// Debounce delay for non-urgent flushes
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Whether uploads should carry the `Dry-Run` header
    pub fn dry_run(&self) -> bool {
        self.verification_mode && !self.verification_write_through
    }

    /// User-Agent sent with every request
    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .filter(|ua| !ua.trim().is_empty())
            .unwrap_or_else(|| format!("beacon/{}", env!("CARGO_PKG_VERSION")))
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config(
                "queue.batch_size must be at least 1".to_string(),
            ));
        }
        if self.verification_batch_size == 0 || self.verification_batch_size > self.batch_size {
            return Err(Error::Config(
                "queue.verification_batch_size must be between 1 and queue.batch_size".to_string(),
            ));
        }
        if self.flush_bulk_size == 0 {
            return Err(Error::Config(
                "queue.flush_bulk_size must be at least 1".to_string(),
            ));
        }
        if self.max_flush_iterations == 0 {
            return Err(Error::Config(
                "queue.max_flush_iterations must be at least 1".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "queue.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.max_entries < self.batch_size {
            return Err(Error::Config(
                "queue.max_entries must be at least queue.batch_size".to_string(),
            ));
        }
        for (key, url) in [
            ("server_url", &self.server_url),
            ("config_url", &self.config_url),
        ] {
            if let Some(url) = url.as_deref().filter(|u| !u.trim().is_empty()) {
                reqwest::Url::parse(url).map_err(|e| {
                    Error::Config(format!("queue.{key} is not a valid URL: {e}"))
                })?;
            }
        }
        Ok(())
    }
}

fn default_flush_bulk_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    15_000
}

fn default_immediate_kinds() -> Vec<String> {
    vec!["track_signup".to_string()]
}

fn default_batch_size() -> usize {
    50
}

fn default_verification_batch_size() -> usize {
    1
}

fn default_max_flush_iterations() -> usize {
    100
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

fn default_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.queue.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/beacon/config.toml` (~/.config/beacon/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("beacon").join("config.toml")
    }

    /// Returns the data directory path (for the queue database)
    ///
    /// `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("beacon")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("beacon")
    }

    /// Returns the queue database path
    ///
    /// `$XDG_DATA_HOME/beacon/queue.db` (~/.local/share/beacon/queue.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("queue.db")
    }

    /// Returns the log file path prefix
    ///
    /// `$XDG_STATE_HOME/beacon/beacon.log` (~/.local/state/beacon/beacon.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("beacon.log")
    }
}
