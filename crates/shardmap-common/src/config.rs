//! Configuration for shard map management
//!
//! Defaults are usable as-is for tests; deployments override them with a
//! config file and `SHARDMAP__SECTION__KEY` environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardMapConfig {
    /// Store configuration
    pub store: StoreConfig,
    /// Transient fault retry configuration
    pub retry: RetryConfig,
    /// Mapping cache configuration
    pub cache: CacheConfig,
    /// Recovery configuration
    pub recovery: RecoveryConfig,
}

impl ShardMapConfig {
    /// Load configuration from an optional file plus environment overrides
    ///
    /// Missing keys fall back to their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder
            .add_source(
                config::Environment::with_prefix("SHARDMAP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| Error::invalid_argument(format!("invalid configuration: {e}")))
    }
}

/// Store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the global and local store files
    pub data_dir: PathBuf,
    /// Per-transaction timeout (milliseconds)
    pub command_timeout_ms: u64,
}

impl StoreConfig {
    /// Per-transaction timeout
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/shardmap"),
            command_timeout_ms: 30_000,
        }
    }
}

/// Retry configuration for transient store faults
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts including the first one
    pub max_attempts: u32,
    /// Initial backoff delay (milliseconds)
    pub base_delay_ms: u64,
    /// Backoff delay cap (milliseconds)
    pub max_delay_ms: u64,
    /// Total time budget across attempts (milliseconds)
    pub max_elapsed_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            max_elapsed_ms: 30_000,
        }
    }
}

/// Mapping cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache shard maps and mappings in process
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Recovery configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Resolve pending operations when a manager is opened
    pub on_startup: bool,
    /// Operations logged more recently than this are left alone (milliseconds)
    pub min_operation_age_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            on_startup: true,
            min_operation_age_ms: 60_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ShardMapConfig::default();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.store.command_timeout(), Duration::from_secs(30));
        assert!(config.cache.enabled);
        assert!(config.recovery.on_startup);
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shardmap.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[retry]\nmax_attempts = 9\n\n[cache]\nenabled = false").unwrap();

        let config = ShardMapConfig::load(Some(&path)).unwrap();
        assert_eq!(config.retry.max_attempts, 9);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert!(!config.cache.enabled);
        assert_eq!(config.recovery.min_operation_age_ms, 60_000);
    }

    #[test]
    fn test_load_without_file() {
        let config = ShardMapConfig::load(None).unwrap();
        assert_eq!(config.store.command_timeout_ms, 30_000);
    }
}
