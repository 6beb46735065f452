//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/robotline/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/robotline/` (~/.config/robotline/)
//! - State/Logs: `$XDG_STATE_HOME/robotline/` (~/.local/state/robotline/)

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

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Hosted backend connection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Session coordinator tuning
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Hosted backend configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Base URL of the REST surface (e.g., `https://project.example.co/rest/v1`)
    pub url: Option<String>,

    /// Project API key, sent as `apikey` and bearer token
    pub api_key: Option<String>,

    /// Base URL of the action endpoints. Defaults to `{url}/actions`.
    pub actions_url: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,

    /// How often the REST change feed re-reads an instance
    #[serde(default = "default_feed_poll_interval")]
    pub feed_poll_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            actions_url: None,
            timeout_secs: default_backend_timeout(),
            feed_poll_interval_ms: default_feed_poll_interval(),
        }
    }
}

impl BackendConfig {
    /// Check if the backend is configured well enough to connect
    pub fn is_ready(&self) -> bool {
        self.url.is_some() && self.api_key.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.url.is_none() {
            return Err(Error::Config("backend.url is required".to_string()));
        }
        if self.api_key.is_none() {
            return Err(Error::Config("backend.api_key is required".to_string()));
        }
        if self.feed_poll_interval_ms == 0 {
            return Err(Error::Config(
                "backend.feed_poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Action endpoint base, falling back to `{url}/actions`
    pub fn actions_base(&self) -> Option<String> {
        match (&self.actions_url, &self.url) {
            (Some(actions), _) => Some(actions.trim_end_matches('/').to_string()),
            (None, Some(url)) => Some(format!("{}/actions", url.trim_end_matches('/'))),
            (None, None) => None,
        }
    }

    /// Feed re-read interval as a [`Duration`]
    pub fn feed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.feed_poll_interval_ms)
    }
}

fn default_backend_timeout() -> u64 {
    30
}

fn default_feed_poll_interval() -> u64 {
    2000
}

/// Tuning for the instance session coordinator.
///
/// Defaults match the behavior users expect from the web console: a 30s
/// thinking indicator, 1.5s instance polling for up to 40 attempts.
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Safety timeout for the thinking indicator
    #[serde(default = "default_thinking_timeout")]
    pub thinking_timeout_secs: u64,

    /// How far from "now" a response may be and still clear thinking
    #[serde(default = "default_response_window")]
    pub response_window_secs: u64,

    /// Responses must have more than this many characters
    #[serde(default = "default_min_response_chars")]
    pub min_response_chars: usize,

    /// System messages longer than this start collapsed
    #[serde(default = "default_collapse_threshold")]
    pub collapse_threshold_chars: usize,

    /// Delay between instance status checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Hard ceiling on instance status checks
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    /// Number of log rows loaded when an instance is opened
    #[serde(default = "default_timeline_page_size")]
    pub timeline_page_size: usize,

    /// Name used to find a freshly created instance
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Activity kind sent with outbound actions
    #[serde(default = "default_activity")]
    pub activity: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            thinking_timeout_secs: default_thinking_timeout(),
            response_window_secs: default_response_window(),
            min_response_chars: default_min_response_chars(),
            collapse_threshold_chars: default_collapse_threshold(),
            poll_interval_ms: default_poll_interval(),
            max_poll_attempts: default_max_poll_attempts(),
            timeline_page_size: default_timeline_page_size(),
            instance_name: default_instance_name(),
            activity: default_activity(),
        }
    }
}

impl SessionConfig {
    pub fn thinking_timeout(&self) -> Duration {
        Duration::from_secs(self.thinking_timeout_secs)
    }

    pub fn response_window(&self) -> Duration {
        Duration::from_secs(self.response_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.max_poll_attempts == 0 {
            return Err(Error::Config(
                "session.max_poll_attempts must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config(
                "session.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.instance_name.trim().is_empty() {
            return Err(Error::Config(
                "session.instance_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_thinking_timeout() -> u64 {
    30
}

fn default_response_window() -> u64 {
    60
}

fn default_min_response_chars() -> usize {
    5
}

fn default_collapse_threshold() -> usize {
    200
}

fn default_poll_interval() -> u64 {
    1500
}

fn default_max_poll_attempts() -> u32 {
    40
}

fn default_timeline_page_size() -> usize {
    100
}

fn default_instance_name() -> String {
    "robot".to_string()
}

fn default_activity() -> String {
    "robot".to_string()
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,

    /// Write log files here instead of the state directory
    pub directory: Option<PathBuf>,

    /// Also echo events at this level and above to stderr
    pub stderr_level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
            directory: None,
            stderr_level: None,
        }
    }
}

impl LoggingConfig {
    /// Directory the rolling log files live in
    pub fn log_dir(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(Config::state_dir)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
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

        config.session.validate()?;
        crate::logging::validate(&config.logging)?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/robotline/config.toml` (~/.config/robotline/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("robotline").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/robotline/` (~/.local/state/robotline/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("robotline")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.backend.url.is_none());
        assert!(!config.backend.is_ready());
        assert_eq!(config.session.thinking_timeout(), Duration::from_secs(30));
        assert_eq!(config.session.response_window(), Duration::from_secs(60));
        assert_eq!(config.session.poll_interval(), Duration::from_millis(1500));
        assert_eq!(config.session.max_poll_attempts, 40);
        assert_eq!(config.session.collapse_threshold_chars, 200);
        assert_eq!(config.session.min_response_chars, 5);
        assert_eq!(config.session.instance_name, "robot");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[backend]
url = "https://project.example.co/rest/v1"
api_key = "anon-key"
feed_poll_interval_ms = 500

[session]
thinking_timeout_secs = 45
max_poll_attempts = 10

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert!(config.backend.is_ready());
        assert!(config.backend.validate().is_ok());
        assert_eq!(config.backend.feed_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.backend.timeout_secs, 30);
        assert_eq!(config.session.thinking_timeout_secs, 45);
        assert_eq!(config.session.max_poll_attempts, 10);
        assert_eq!(config.session.poll_interval_ms, 1500);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_backend_config_validation() {
        let config = BackendConfig::default();
        assert!(config.validate().is_err());

        let config = BackendConfig {
            url: Some("https://project.example.co".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BackendConfig {
            url: Some("https://project.example.co".to_string()),
            api_key: Some("key".to_string()),
            feed_poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_actions_base_defaults_to_url() {
        let mut config = BackendConfig {
            url: Some("https://project.example.co/rest/v1/".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.actions_base().as_deref(),
            Some("https://project.example.co/rest/v1/actions")
        );

        config.actions_url = Some("https://fn.example.co/v1/".to_string());
        assert_eq!(config.actions_base().as_deref(), Some("https://fn.example.co/v1"));
    }

    #[test]
    fn test_load_from_rejects_zero_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nmax_poll_attempts = 0\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("max_poll_attempts"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\ninstance_name = \"scout\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.session.instance_name, "scout");
        assert_eq!(config.session.activity, "robot");
    }

    #[test]
    fn test_logging_section_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[logging]\ndirectory = \"/tmp/robotline-logs\"\nstderr_level = \"warn\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.logging.log_dir(), PathBuf::from("/tmp/robotline-logs"));
        assert_eq!(config.logging.stderr_level.as_deref(), Some("warn"));
        assert_eq!(LoggingConfig::default().log_dir(), Config::state_dir());

        std::fs::write(&path, "[logging]\nstderr_level = \"chatty\"\n").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("stderr_level"));
    }
}
