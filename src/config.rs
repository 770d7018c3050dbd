//! Analytics configuration
//!
//! Loaded from a TOML file, then overridden by environment variables:
//!
//! | Variable                  | Applies to                  |
//! |---------------------------|-----------------------------|
//! | `TALLY_MAX_SIZE`          | `likes.max_size`, `views.max_size` |
//! | `TALLY_FLUSH_INTERVAL_MS` | `likes.flush_interval`, `views.flush_interval` |
//! | `TALLY_RETRY_ATTEMPTS`    | `likes.retry.max_attempts`, `views.retry.max_attempts` |
//! | `TALLY_STORE`             | `store.backend` (`memory` or `sqlite`) |
//! | `TALLY_SQLITE_PATH`       | `store.sqlite_path`         |
//! | `TALLY_COMMIT_TIMEOUT_MS` | `store.commit_timeout`      |
//!
//! Example file:
//!
//! ```toml
//! [likes]
//! max_size = 1000
//! flush_interval = 60000
//!
//! [views.retry]
//! max_attempts = 5
//! initial_backoff = 50
//! max_backoff = 1000
//!
//! [store]
//! backend = "sqlite"
//! sqlite_path = "analytics.db"
//! commit_timeout = 5000
//! ```

use crate::batch::config::duration_millis;
use crate::batch::BatchConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which durable store backs the analytics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    InMemory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database file; required for the SQLite backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,
    /// Upper bound for one commit transaction (default: 5s)
    #[serde(with = "duration_millis")]
    pub commit_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: StoreBackend::InMemory,
            sqlite_path: None,
            commit_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration of an [`ImageAnalytics`](crate::analytics::ImageAnalytics)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub likes: BatchConfig,
    pub views: BatchConfig,
    pub store: StoreConfig,
}

impl AnalyticsConfig {
    /// Configuration for testing (tiny thresholds, fast ticks)
    pub fn test() -> Self {
        AnalyticsConfig {
            likes: BatchConfig::test(),
            views: BatchConfig::test(),
            store: StoreConfig::default(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Apply `TALLY_*` environment variables on top of this configuration
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(max_size) = parse_var::<usize>(&lookup, "TALLY_MAX_SIZE")? {
            self.likes.max_size = max_size;
            self.views.max_size = max_size;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TALLY_FLUSH_INTERVAL_MS")? {
            self.likes.flush_interval = Duration::from_millis(ms);
            self.views.flush_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, "TALLY_RETRY_ATTEMPTS")? {
            self.likes.retry.max_attempts = attempts;
            self.views.retry.max_attempts = attempts;
        }
        if let Some(value) = lookup("TALLY_STORE") {
            self.store.backend = match value.to_ascii_lowercase().as_str() {
                "memory" | "in_memory" | "in-memory" => StoreBackend::InMemory,
                "sqlite" => StoreBackend::Sqlite,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "TALLY_STORE",
                        value,
                    })
                }
            };
        }
        if let Some(path) = lookup("TALLY_SQLITE_PATH") {
            self.store.sqlite_path = Some(PathBuf::from(path));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TALLY_COMMIT_TIMEOUT_MS")? {
            self.store.commit_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, batch) in [("likes", &self.likes), ("views", &self.views)] {
            if batch.max_size == 0 {
                return Err(ConfigError::Invalid(format!("{}.max_size must be > 0", name)));
            }
            if batch.flush_interval.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{}.flush_interval must be > 0",
                    name
                )));
            }
            if batch.retry.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{}.retry.max_attempts must be > 0",
                    name
                )));
            }
        }
        if self.store.commit_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "store.commit_timeout must be > 0".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.sqlite_path.is_none() {
            return Err(ConfigError::Invalid(
                "store.sqlite_path is required for the sqlite backend".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(ConfigError::InvalidEnv { var, value }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RetryPolicy;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AnalyticsConfig::default();
        assert_eq!(config.likes.max_size, 1000);
        assert_eq!(config.views.flush_interval, Duration::from_secs(60));
        assert_eq!(config.likes.retry.max_attempts, 3);
        assert_eq!(config.store.backend, StoreBackend::InMemory);
        assert_eq!(config.store.commit_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_str() {
        let config = AnalyticsConfig::from_toml_str(
            r#"
            [likes]
            max_size = 10

            [views.retry]
            max_attempts = 5
            initial_backoff = 50
            max_backoff = 1000

            [store]
            backend = "sqlite"
            sqlite_path = "analytics.db"
            commit_timeout = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.likes.max_size, 10);
        assert_eq!(config.views.max_size, 1000);
        assert_eq!(
            config.views.retry,
            RetryPolicy::exponential(5, Duration::from_millis(50), Duration::from_secs(1))
        );
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.sqlite_path, Some(PathBuf::from("analytics.db")));
        assert_eq!(config.store.commit_timeout, Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = AnalyticsConfig::test();
        config.store.backend = StoreBackend::Sqlite;
        config.store.sqlite_path = Some(PathBuf::from("/tmp/tally.db"));

        let text = config.to_toml_string().unwrap();
        let parsed = AnalyticsConfig::from_toml_str(&text).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.toml");
        std::fs::write(&path, "[views]\nmax_size = 7\n").unwrap();

        let config = AnalyticsConfig::from_file(&path).unwrap();
        assert_eq!(config.views.max_size, 7);

        let missing = AnalyticsConfig::from_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AnalyticsConfig::default();
        config
            .apply_overrides(lookup(&[
                ("TALLY_MAX_SIZE", "64"),
                ("TALLY_FLUSH_INTERVAL_MS", "250"),
                ("TALLY_RETRY_ATTEMPTS", "7"),
                ("TALLY_STORE", "sqlite"),
                ("TALLY_SQLITE_PATH", "/var/lib/tally.db"),
                ("TALLY_COMMIT_TIMEOUT_MS", "1500"),
            ]))
            .unwrap();

        assert_eq!(config.likes.max_size, 64);
        assert_eq!(config.views.max_size, 64);
        assert_eq!(config.views.flush_interval, Duration::from_millis(250));
        assert_eq!(config.likes.retry.max_attempts, 7);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.sqlite_path, Some(PathBuf::from("/var/lib/tally.db")));
        assert_eq!(config.store.commit_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = AnalyticsConfig::default();
        let err = config
            .apply_overrides(lookup(&[("TALLY_MAX_SIZE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "TALLY_MAX_SIZE", .. }));

        let err = config
            .apply_overrides(lookup(&[("TALLY_STORE", "postgres")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "TALLY_STORE", .. }));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AnalyticsConfig::default();
        config.views.max_size = 0;
        assert!(config.validate().is_err());

        let mut config = AnalyticsConfig::default();
        config.store.backend = StoreBackend::Sqlite;
        assert!(config.validate().is_err());

        let mut config = AnalyticsConfig::default();
        config.likes.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
