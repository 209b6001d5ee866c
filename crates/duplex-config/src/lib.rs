//! Duplex Configuration Management.
//!
//! Configuration loading and validation for the Duplex accelerator memory
//! runtime. Supports YAML, TOML, and JSON files plus `DUPLEX_*` environment
//! variable overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use duplex_config::{Config, ConfigLoader};
//!
//! let config = ConfigLoader::new()
//!     .with_file("duplex.yaml")
//!     .with_env_prefix("DUPLEX")
//!     .load()?;
//!
//! println!("Backend: {}", config.kernels.backend);
//! println!("Refresh gap: {:?}", config.ledger.max_refresh_gap());
//! ```

pub mod compute;
pub mod error;
pub mod loader;
pub mod memory;
pub mod validation;

pub use compute::{AcceleratorConfig, AcceleratorKind, BackendKind, KernelConfig};
pub use error::ConfigError;
pub use loader::{ConfigBuilder, ConfigLoader};
pub use memory::{LedgerConfig, TrackerConfig};

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    /// Memory ledger policy.
    #[validate(nested)]
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Placement tracker options.
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Accelerator bridge selection.
    #[validate(nested)]
    #[serde(default)]
    pub accelerator: AcceleratorConfig,

    /// Compute backend selection.
    #[validate(nested)]
    #[serde(default)]
    pub kernels: KernelConfig,

    /// Logging configuration.
    #[validate(nested)]
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        ConfigLoader::new().with_file(path).load()
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        ConfigLoader::new().with_env_prefix("DUPLEX").load()
    }

    /// Validate the configuration, field rules first, then cross-field rules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        <Self as Validate>::validate(self).map_err(ConfigError::from)?;
        validation::validate_config(self)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    #[validate(length(min = 1))]
    pub level: String,

    /// Log format (json, pretty, compact).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Emit span open/close events.
    #[serde(default)]
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            span_events: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics collection.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prometheus namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Histogram buckets for kernel latency, in seconds.
    #[serde(default = "default_buckets")]
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: default_namespace(),
            latency_buckets: default_buckets(),
        }
    }
}

fn default_namespace() -> String {
    "duplex".to_string()
}

fn default_buckets() -> Vec<f64> {
    vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.kernels.backend, BackendKind::Cpu);
        assert_eq!(config.accelerator.kind, AcceleratorKind::Simulated);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "kernels:\n  backend: verify\nledger:\n  max_refresh_gap_ms: 250\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.kernels.backend, BackendKind::Verify);
        assert_eq!(config.ledger.max_refresh_gap_ms, 250);
        assert_eq!(config.ledger.min_refresh_interval, 8);
        assert_eq!(config.logging.level, "info");
    }
}
