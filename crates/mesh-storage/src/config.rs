//! Unified configuration for VectorMesh.
//!
//! Centralized configuration with support for:
//! - Default values (embedded in binary)
//! - Configuration files (TOML format)
//! - Environment variable overrides (prefix: `VMESH__`)
//!
//! # Environment Variables
//!
//! - `VMESH__CACHE__MAX_BYTES=134217728`
//! - `VMESH__CACHE__DEFAULT_TTL_SECS=300`
//! - `VMESH__COMPRESSION__MIN_ACCURACY=0.95`
//! - `VMESH__GOVERNOR__TICK_INTERVAL_SECS=30`
//! - `VMESH__GOVERNOR__HEAP_LIMIT_MB=2048`
//! - `VMESH__SHARDING__MIGRATION_BATCH_SIZE=250`
//!
//! # Example
//!
//! ```ignore
//! use mesh_storage::config::MeshConfig;
//!
//! let config = MeshConfig::load(Some("vectormesh.toml")).unwrap();
//! println!("gc threshold: {}", config.governor.gc_threshold);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Cache namespace defaults.
    pub cache: CacheSettings,
    /// Codec engine settings.
    pub compression: CompressionSettings,
    /// Resource governor settings.
    pub governor: GovernorSettings,
    /// Sharding and migration settings.
    pub sharding: ShardingSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl MeshConfig {
    /// Loads configuration from an optional file path with environment
    /// variable overrides.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (`VMESH__*`)
    /// 2. Configuration file (if provided)
    /// 3. Built-in defaults
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(file_path) = path {
            if Path::new(file_path).exists() {
                let contents = std::fs::read_to_string(file_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        fn parse_into<T: std::str::FromStr>(var: &str, slot: &mut T) {
            if let Ok(val) = std::env::var(var) {
                if let Ok(parsed) = val.parse() {
                    *slot = parsed;
                }
            }
        }

        parse_into("VMESH__CACHE__MAX_ENTRIES", &mut self.cache.max_entries);
        parse_into("VMESH__CACHE__MAX_BYTES", &mut self.cache.max_bytes);
        if let Ok(val) = std::env::var("VMESH__CACHE__DEFAULT_TTL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.cache.default_ttl_secs = Some(secs);
            }
        }
        if let Ok(val) = std::env::var("VMESH__CACHE__UPDATE_AGE_ON_GET") {
            self.cache.update_age_on_get = val.eq_ignore_ascii_case("true") || val == "1";
        }
        if let Ok(val) = std::env::var("VMESH__CACHE__COMPRESSION_ENABLED") {
            self.cache.compression_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }
        parse_into(
            "VMESH__CACHE__COMPRESSION_DIM_THRESHOLD",
            &mut self.cache.compression_dim_threshold,
        );

        parse_into(
            "VMESH__COMPRESSION__MIN_ACCURACY",
            &mut self.compression.min_accuracy,
        );
        parse_into(
            "VMESH__COMPRESSION__NSUBVECTORS",
            &mut self.compression.nsubvectors,
        );
        parse_into("VMESH__COMPRESSION__NBITS", &mut self.compression.nbits);
        parse_into("VMESH__COMPRESSION__NLIST", &mut self.compression.nlist);

        parse_into(
            "VMESH__GOVERNOR__TICK_INTERVAL_SECS",
            &mut self.governor.tick_interval_secs,
        );
        parse_into(
            "VMESH__GOVERNOR__HEAP_LIMIT_MB",
            &mut self.governor.heap_limit_mb,
        );
        parse_into(
            "VMESH__GOVERNOR__GC_THRESHOLD",
            &mut self.governor.gc_threshold,
        );
        parse_into(
            "VMESH__GOVERNOR__MAX_CACHE_MB",
            &mut self.governor.max_cache_mb,
        );

        parse_into(
            "VMESH__SHARDING__DEFAULT_SHARD_COUNT",
            &mut self.sharding.default_shard_count,
        );
        parse_into(
            "VMESH__SHARDING__REPLICATION_FACTOR",
            &mut self.sharding.replication_factor,
        );
        parse_into(
            "VMESH__SHARDING__MIGRATION_BATCH_SIZE",
            &mut self.sharding.migration_batch_size,
        );

        if let Ok(val) = std::env::var("VMESH__LOGGING__LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("VMESH__LOGGING__JSON") {
            self.logging.json = val.eq_ignore_ascii_case("true") || val == "1";
        }
    }

    /// Serializes the configuration to TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Cache namespace defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Default per-namespace entry budget (0 = unbounded).
    pub max_entries: usize,
    /// Default per-namespace byte budget (0 = unbounded).
    pub max_bytes: usize,
    /// Default entry TTL in seconds (absent = no expiry).
    pub default_ttl_secs: Option<u64>,
    /// Whether reads refresh an entry's TTL.
    pub update_age_on_get: bool,
    /// Whether oversize vectors are compressed on write.
    pub compression_enabled: bool,
    /// Dimension above which vectors are compression candidates.
    pub compression_dim_threshold: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            default_ttl_secs: None,
            update_age_on_get: false,
            compression_enabled: true,
            compression_dim_threshold: 512,
        }
    }
}

/// Codec engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    /// Accuracy floor; lower reconstruction quality is reported as degraded.
    pub min_accuracy: f32,
    /// PQ sub-vector count.
    pub nsubvectors: usize,
    /// Bits per quantized value.
    pub nbits: u8,
    /// IVF coarse cluster count.
    pub nlist: usize,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            min_accuracy: 0.9,
            nsubvectors: 8,
            nbits: 8,
            nlist: 16,
        }
    }
}

/// Resource governor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSettings {
    /// Seconds between governor ticks.
    pub tick_interval_secs: u64,
    /// Heap budget in megabytes.
    pub heap_limit_mb: usize,
    /// Fraction of the heap budget that triggers reclamation.
    pub gc_threshold: f64,
    /// Aggregate cache budget in megabytes.
    pub max_cache_mb: usize,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            heap_limit_mb: 1024,
            gc_threshold: 0.75,
            max_cache_mb: 512,
        }
    }
}

/// Sharding and migration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingSettings {
    /// Shard count used when an entity kind gives none.
    pub default_shard_count: u32,
    /// Replicas per shard.
    pub replication_factor: u32,
    /// Records per migration copy batch (clamped to 100..=1000).
    pub migration_batch_size: usize,
}

impl Default for ShardingSettings {
    fn default() -> Self {
        Self {
            default_shard_count: 4,
            replication_factor: 1,
            migration_batch_size: 500,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Use JSON output for log aggregators.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.governor.tick_interval_secs, 60);
        assert_eq!(config.governor.gc_threshold, 0.75);
        assert_eq!(config.cache.compression_dim_threshold, 512);
        assert_eq!(config.compression.min_accuracy, 0.9);
        assert!(config.cache.default_ttl_secs.is_none());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = MeshConfig::default();
        let toml_str = config.to_toml().unwrap();

        assert!(toml_str.contains("[cache]"));
        assert!(toml_str.contains("[compression]"));
        assert!(toml_str.contains("[governor]"));
        assert!(toml_str.contains("[sharding]"));

        let parsed: MeshConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.governor.tick_interval_secs, config.governor.tick_interval_secs);
        assert_eq!(parsed.compression.nbits, config.compression.nbits);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
            [governor]
            tick_interval_secs = 30
            heap_limit_mb = 2048

            [cache]
            max_bytes = 1048576
            default_ttl_secs = 300
        "#;

        let config: MeshConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.governor.tick_interval_secs, 30);
        assert_eq!(config.governor.heap_limit_mb, 2048);
        assert_eq!(config.cache.max_bytes, 1_048_576);
        assert_eq!(config.cache.default_ttl_secs, Some(300));
        // Untouched sections keep their defaults.
        assert_eq!(config.sharding.migration_batch_size, 500);
    }

    #[test]
    fn test_override_mechanism() {
        // Exercised without touching process env to avoid parallel test
        // interference; the env path is a thin wrapper over these fields.
        let mut config = MeshConfig::default();
        config.governor.tick_interval_secs = 15;
        config.cache.compression_enabled = false;

        assert_eq!(config.governor.tick_interval_secs, 15);
        assert!(!config.cache.compression_enabled);
    }
}
