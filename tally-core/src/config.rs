//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/tally/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/tally/` (~/.config/tally/)
//! - Data: `$XDG_DATA_HOME/tally/` (~/.local/share/tally/), holds queue snapshots
//! - State/Logs: `$XDG_STATE_HOME/tally/` (~/.local/state/tally/)

use crate::error::{Error, Result};
use chrono::NaiveDate;
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
    /// Tracking client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
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

/// Tracking client configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Project token; snapshots are keyed to it
    pub token: Option<String>,

    /// Ingestion server base URL
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Seconds between periodic flushes (0 disables the timer)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Flush when the host application enters the background
    #[serde(default = "default_true")]
    pub flush_on_background: bool,

    /// Signal network activity while a batch is being submitted
    #[serde(default = "default_true")]
    pub show_network_activity_indicator: bool,

    /// Events per submission
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum number of buffered events before the oldest is dropped
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Seconds between scheduled snapshots (0 disables the schedule)
    #[serde(default = "default_archive_interval")]
    pub archive_interval_secs: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Reported as `$app_name`
    pub app_name: Option<String>,

    /// Reported as `$app_version`
    pub app_version: Option<String>,

    /// Retry backoff after failed submissions
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token: None,
            server_url: default_server_url(),
            flush_interval_secs: default_flush_interval(),
            flush_on_background: true,
            show_network_activity_indicator: true,
            batch_size: default_batch_size(),
            max_queue_size: default_max_queue_size(),
            archive_interval_secs: default_archive_interval(),
            timeout_secs: default_timeout(),
            app_name: None,
            app_version: None,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff applied between failed delivery attempts
#[derive(Debug, Deserialize, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure, in milliseconds
    #[serde(default = "default_backoff_initial")]
    pub initial_ms: u64,

    /// Upper bound for the delay, in milliseconds
    #[serde(default = "default_backoff_max")]
    pub max_ms: u64,

    /// Growth factor per consecutive failure
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial(),
            max_ms: default_backoff_max(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

impl ClientConfig {
    /// Check if the client has what it needs to start
    pub fn is_ready(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.trim().is_empty())
            && !self.server_url.trim().is_empty()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        match self.token.as_deref() {
            Some(token) if !token.trim().is_empty() => {}
            _ => {
                return Err(Error::Config("client.token is required".to_string()));
            }
        }
        if self.server_url.trim().is_empty() {
            return Err(Error::Config(
                "client.server_url must not be empty".to_string(),
            ));
        }
        if self.batch_size == 0 || self.batch_size > 500 {
            return Err(Error::Config(
                "client.batch_size must be between 1 and 500".to_string(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(Error::Config(
                "client.max_queue_size must be at least 1".to_string(),
            ));
        }
        if self.backoff.multiplier == 0 {
            return Err(Error::Config(
                "client.backoff.multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Periodic flush interval; zero means disabled
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Scheduled archive interval; zero means disabled
    pub fn archive_interval(&self) -> Duration {
        Duration::from_secs(self.archive_interval_secs)
    }

    /// HTTP request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_server_url() -> String {
    "https://inputs.alooma.com".to_string()
}

fn default_flush_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    50
}

fn default_max_queue_size() -> usize {
    500
}

fn default_archive_interval() -> u64 {
    10
}

fn default_timeout() -> u64 {
    30
}

fn default_backoff_initial() -> u64 {
    5_000
}

fn default_backoff_max() -> u64 {
    600_000
}

fn default_backoff_multiplier() -> u32 {
    2
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

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/tally/config.toml` (~/.config/tally/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("tally").join("config.toml")
    }

    /// Returns the data directory path (for queue snapshots)
    ///
    /// `$XDG_DATA_HOME/tally/` (~/.local/share/tally/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("tally")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/tally/` (~/.local/state/tally/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("tally")
    }

    /// Returns the log file path for `date`
    ///
    /// Logs rotate daily: `$XDG_STATE_HOME/tally/tally.YYYY-MM-DD.log`
    /// (~/.local/state/tally/tally.2024-03-01.log)
    pub fn log_path(date: NaiveDate) -> PathBuf {
        Self::state_dir().join(format!("tally.{}.log", date.format("%Y-%m-%d")))
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.client.token.is_none());
        assert_eq!(config.client.server_url, "https://inputs.alooma.com");
        assert_eq!(config.client.flush_interval_secs, 60);
        assert!(config.client.flush_on_background);
        assert!(config.client.show_network_activity_indicator);
        assert_eq!(config.client.batch_size, 50);
        assert_eq!(config.client.max_queue_size, 500);
        assert_eq!(config.logging.level, "info");
        assert!(!config.client.is_ready());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[client]
token = "tok_123"
server_url = "https://ingest.example.com"
flush_interval_secs = 0
flush_on_background = false
batch_size = 20

[client.backoff]
initial_ms = 250

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.client.token.as_deref(), Some("tok_123"));
        assert_eq!(config.client.server_url, "https://ingest.example.com");
        assert_eq!(config.client.flush_interval(), Duration::ZERO);
        assert!(!config.client.flush_on_background);
        assert_eq!(config.client.batch_size, 20);
        assert_eq!(config.client.backoff.initial_ms, 250);
        assert_eq!(config.client.backoff.max_ms, 600_000);
        assert_eq!(config.logging.level, "debug");
        assert!(config.client.is_ready());
    }

    #[test]
    fn test_client_config_validation() {
        // Missing token
        let config = ClientConfig::default();
        assert!(config.validate().is_err());

        let config = ClientConfig {
            token: Some("tok".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = ClientConfig {
            token: Some("tok".to_string()),
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            token: Some("tok".to_string()),
            server_url: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[client]\ntoken = \"abc\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.client.token.as_deref(), Some("abc"));

        std::fs::write(&path, "[client\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }
}
