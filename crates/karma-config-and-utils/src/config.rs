//! Configuration management for the engine.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Main engine configuration.
///
/// Every field has a default, so a partial `config.json` only needs to name
/// the values it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Accrual tick period in seconds.
    pub tick_interval_secs: u64,
    /// Archival sweep period in seconds.
    pub cleanup_interval_secs: u64,

    /// Emission grams accrued per active minute before multipliers.
    pub base_rate_per_minute: f64,
    /// Maximum number of concurrently tracked resources.
    pub max_tracked_resources: usize,
    /// Cap on a single resource's cumulative accrual, in grams.
    pub max_accrual_per_resource: f64,

    /// Cache capacity in entries.
    pub cache_capacity: usize,
    /// Default cache TTL in seconds.
    pub cache_ttl_secs: u64,
    /// TTL overrides keyed by cache-key prefix, in seconds.
    pub cache_ttl_overrides: BTreeMap<String, u64>,

    /// Entries per underlying write in a batched store write.
    pub batch_size: usize,
    /// Days kept in the daily archive and history lists.
    pub history_days: usize,

    /// Send attempts beyond the first before an analytics event is dropped.
    pub max_event_retries: u32,
    /// Initial retry delay for analytics delivery in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Retry delay cap for analytics delivery in milliseconds.
    pub retry_max_delay_ms: u64,

    /// Timeout for every store and network call on the sync and outbox paths.
    pub io_timeout_secs: u64,

    /// Analytics collector endpoint. Delivery is disabled when unset.
    pub analytics_endpoint: Option<String>,
    /// Bearer token for the analytics collector.
    pub analytics_token: Option<String>,
}

fn default_cache_ttl_overrides() -> BTreeMap<String, u64> {
    BTreeMap::from([
        ("electricity_map:intensity".to_string(), 15 * 60),
        ("electricity_map:forecast".to_string(), 60 * 60),
        ("electricity_map:history".to_string(), 24 * 60 * 60),
    ])
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            tick_interval_secs: 60,
            cleanup_interval_secs: 24 * 60 * 60,
            base_rate_per_minute: 6.0,
            max_tracked_resources: 100,
            max_accrual_per_resource: 1000.0,
            cache_capacity: 1000,
            cache_ttl_secs: 5 * 60,
            cache_ttl_overrides: default_cache_ttl_overrides(),
            batch_size: 100,
            history_days: 30,
            max_event_retries: 3,
            retry_base_delay_ms: 5_000,
            retry_max_delay_ms: 60_000,
            io_timeout_secs: 10,
            analytics_endpoint: None,
            analytics_token: None,
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from a file, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("KARMA_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(endpoint) = std::env::var("KARMA_ANALYTICS_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.analytics_endpoint = Some(endpoint.trim().to_string());
            }
        }
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> CoreResult<()> {
        if self.tick_interval_secs == 0 || self.cleanup_interval_secs == 0 {
            return Err(CoreError::Config("intervals must be positive".into()));
        }
        if self.io_timeout_secs == 0 {
            return Err(CoreError::Config("io_timeout_secs must be positive".into()));
        }
        if !self.base_rate_per_minute.is_finite() || self.base_rate_per_minute < 0.0 {
            return Err(CoreError::Config(format!(
                "base_rate_per_minute must be a non-negative number, got {}",
                self.base_rate_per_minute
            )));
        }
        if self.max_tracked_resources == 0 || self.cache_capacity == 0 || self.batch_size == 0 {
            return Err(CoreError::Config(
                "capacities and batch_size must be at least 1".into(),
            ));
        }
        if self.history_days == 0 {
            return Err(CoreError::Config("history_days must be at least 1".into()));
        }
        self.analytics_endpoint()?;
        Ok(())
    }

    /// Analytics endpoint as a parsed URL, if configured.
    pub fn analytics_endpoint(&self) -> CoreResult<Option<Url>> {
        self.analytics_endpoint
            .as_deref()
            .map(|raw| Url::parse(raw).map_err(CoreError::from))
            .transpose()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.tick_interval(), Duration::from_secs(60));
        assert_eq!(config.max_tracked_resources, 100);
        assert_eq!(config.max_accrual_per_resource, 1000.0);
        assert_eq!(config.cache_capacity, 1000);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_event_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_load_partial_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "max_tracked_resources": 5
        }"#;
        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_tracked_resources, 5);
        // Untouched fields keep their defaults
        assert_eq!(config.batch_size, 100);
        assert_eq!(
            config.cache_ttl_overrides.get("electricity_map:forecast"),
            Some(&3600)
        );
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.log_level = "trace".to_string();
        config.history_days = 14;
        config.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert_eq!(loaded.history_days, 14);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.cache_ttl_secs, 300);
    }

    #[test]
    fn test_config_rejects_zero_capacity() {
        let config = Config {
            cache_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_config_rejects_zero_io_timeout() {
        let config = Config {
            io_timeout_secs: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_config_invalid_analytics_url() {
        let config = Config {
            analytics_endpoint: Some("not a valid url".to_string()),
            ..Config::default()
        };
        assert!(config.analytics_endpoint().is_err());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_analytics_url_parse() {
        let config = Config {
            analytics_endpoint: Some("https://collect.example.com/v1/events".to_string()),
            ..Config::default()
        };
        let url = config.analytics_endpoint().unwrap().unwrap();
        assert_eq!(url.scheme(), "https");
    }
}
