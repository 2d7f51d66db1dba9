//! Configuration file parser for `feedvault.toml`.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde (with `deny_unknown_fields` off),
//! though we log a warning when the file contains potential typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

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

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file.
    pub database_path: PathBuf,

    /// Minimum minutes between two checks of the same feed.
    pub staleness_window_minutes: u64,

    /// Maximum number of feeds updated at the same time (at least 1).
    pub max_concurrent_updates: usize,

    /// Upper bound on each fetch attempt, in seconds.
    pub fetch_timeout_secs: u64,

    /// Minutes between scheduling cycles in `watch` mode.
    pub update_interval_minutes: u64,

    /// Largest accepted response body.
    pub max_feed_size_bytes: usize,

    /// HTTP User-Agent sent with every request.
    pub user_agent: String,

    /// Append-only list of feeds disabled after a fatal assertion.
    pub broken_feeds_path: PathBuf,

    /// Optional host blocklist consulted when feeds are added.
    pub blocklist_path: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("feedvault.db"),
            staleness_window_minutes: 30,
            max_concurrent_updates: 50,
            fetch_timeout_secs: 10,
            update_interval_minutes: 15,
            max_feed_size_bytes: 10 * 1024 * 1024,
            user_agent: concat!("feedvault/", env!("CARGO_PKG_VERSION")).to_string(),
            broken_feeds_path: PathBuf::from("broken_feeds.csv"),
            blocklist_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 10] = [
        "database_path",
        "staleness_window_minutes",
        "max_concurrent_updates",
        "fetch_timeout_secs",
        "update_interval_minutes",
        "max_feed_size_bytes",
        "user_agent",
        "broken_feeds_path",
        "blocklist_path",
        "log_level",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to avoid loading a huge or corrupted file
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

        let mut config: Config = toml::from_str(content)?;
        if config.max_concurrent_updates == 0 {
            tracing::warn!("max_concurrent_updates must be at least 1, using 1");
            config.max_concurrent_updates = 1;
        }
        Ok(config)
    }

    pub fn staleness_window(&self) -> chrono::Duration {
        i64::try_from(self.staleness_window_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn update_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.update_interval_minutes.saturating_mul(60))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database_path, PathBuf::from("feedvault.db"));
        assert_eq!(config.staleness_window_minutes, 30);
        assert_eq!(config.max_concurrent_updates, 50);
        assert_eq!(config.fetch_timeout_secs, 10);
        assert_eq!(config.update_interval_minutes, 15);
        assert_eq!(config.max_feed_size_bytes, 10 * 1024 * 1024);
        assert!(config.user_agent.starts_with("feedvault/"));
        assert!(config.blocklist_path.is_none());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(config.staleness_window_minutes, 30);
    }

    #[test]
    fn test_empty_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedvault.toml");
        std::fs::write(&path, "   \n  \n  ").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_concurrent_updates, 50);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let config = Config::parse("staleness_window_minutes = 5\n").unwrap();
        assert_eq!(config.staleness_window_minutes, 5);
        assert_eq!(config.staleness_window(), chrono::Duration::minutes(5));
        assert_eq!(config.max_concurrent_updates, 50); // default
    }

    #[test]
    fn test_full_config() {
        let content = r#"
database_path = "/var/lib/feedvault/feeds.db"
staleness_window_minutes = 60
max_concurrent_updates = 8
fetch_timeout_secs = 20
update_interval_minutes = 5
max_feed_size_bytes = 1048576
user_agent = "custom-agent/1.0"
broken_feeds_path = "/var/log/feedvault/broken.csv"
blocklist_path = "/etc/feedvault/blocklist.txt"
log_level = "debug"
"#;
        let config = Config::parse(content).unwrap();
        assert_eq!(
            config.database_path,
            PathBuf::from("/var/lib/feedvault/feeds.db")
        );
        assert_eq!(config.max_concurrent_updates, 8);
        assert_eq!(config.fetch_timeout(), std::time::Duration::from_secs(20));
        assert_eq!(config.update_interval(), std::time::Duration::from_secs(300));
        assert_eq!(config.max_feed_size_bytes, 1_048_576);
        assert_eq!(config.user_agent, "custom-agent/1.0");
        assert_eq!(
            config.blocklist_path,
            Some(PathBuf::from("/etc/feedvault/blocklist.txt"))
        );
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_zero_concurrency_clamped() {
        let config = Config::parse("max_concurrent_updates = 0\n").unwrap();
        assert_eq!(config.max_concurrent_updates, 1);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let result = Config::parse("this is not [valid toml");
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let config = Config::parse("log_level = \"warn\"\ntotally_fake_key = 42\n").unwrap();
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_wrong_type_returns_error() {
        assert!(Config::parse("staleness_window_minutes = \"soon\"\n").is_err());
    }

    #[test]
    fn test_too_large_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedvault.toml");
        std::fs::write(&path, "a".repeat(1_048_577)).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
    }
}
