//! Configuration loader.

use std::path::Path;
use std::str::FromStr;

use tracing::{debug, info};

use crate::error::ConfigError;
use crate::{AcceleratorConfig, BackendKind, Config, KernelConfig, LedgerConfig};

/// Configuration file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML (`.yaml`, `.yml`)
    Yaml,
    /// TOML (`.toml`)
    Toml,
    /// JSON (`.json`)
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension.
    pub fn from_extension(path: &str) -> Option<Self> {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        match ext.as_deref() {
            Some("yaml") | Some("yml") => Some(Self::Yaml),
            Some("toml") => Some(Self::Toml),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }

    /// Parse content in this format.
    pub fn parse<T: serde::de::DeserializeOwned>(&self, content: &str) -> Result<T, ConfigError> {
        match self {
            Self::Yaml => serde_yaml::from_str(content).map_err(ConfigError::from),
            Self::Toml => toml::from_str(content).map_err(ConfigError::from),
            Self::Json => serde_json::from_str(content).map_err(ConfigError::from),
        }
    }
}

/// Configuration loader.
pub struct ConfigLoader {
    file_path: Option<String>,
    env_prefix: Option<String>,
    defaults: Config,
}

impl ConfigLoader {
    /// Create a new config loader.
    pub fn new() -> Self {
        Self {
            file_path: None,
            env_prefix: None,
            defaults: Config::default(),
        }
    }

    /// Set the config file path.
    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Set the environment variable prefix.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Set default values used when no file is given.
    pub fn with_defaults(mut self, defaults: Config) -> Self {
        self.defaults = defaults;
        self
    }

    /// Load, override and validate the configuration.
    pub fn load(self) -> Result<Config, ConfigError> {
        let mut config = match self.file_path {
            Some(ref path) => load_from_file(path)?,
            None => self.defaults.clone(),
        };

        if let Some(ref prefix) = self.env_prefix {
            apply_env_overrides(&mut config, prefix, |name| std::env::var(name).ok())?;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn load_from_file(path: &str) -> Result<Config, ConfigError> {
    debug!("Loading configuration from {}", path);

    if !Path::new(path).exists() {
        return Err(ConfigError::FileNotFound(path.to_string()));
    }

    let format = ConfigFormat::from_extension(path)
        .ok_or_else(|| ConfigError::UnsupportedFormat(path.to_string()))?;
    let content = std::fs::read_to_string(path)?;
    let config: Config = format.parse(&content)?;

    info!("Loaded configuration from {}", path);
    Ok(config)
}

fn parse_env<T: FromStr>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::env(name, format!("cannot parse '{raw}': {e}")))
}

/// Apply `{prefix}_*` overrides read through `lookup`.
pub(crate) fn apply_env_overrides<F>(
    config: &mut Config,
    prefix: &str,
    lookup: F,
) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |suffix: &str| {
        let name = format!("{prefix}_{suffix}");
        lookup(&name).map(|value| (name, value))
    };

    // Compute
    if let Some((name, val)) = var("BACKEND") {
        config.kernels.backend = parse_env::<BackendKind>(&name, &val)?;
    }
    if let Some((name, val)) = var("TOLERANCE") {
        config.kernels.tolerance = parse_env(&name, &val)?;
    }
    if let Some((name, val)) = var("THREADS") {
        config.kernels.num_threads = parse_env(&name, &val)?;
    }

    // Accelerator
    if let Some((name, val)) = var("ACCELERATOR") {
        config.accelerator.kind = parse_env(&name, &val)?;
    }
    if let Some((_, val)) = var("LIBRARY_PATH") {
        config.accelerator.library_path = Some(val);
    }
    if let Some((name, val)) = var("SIMULATED_CAPACITY") {
        config.accelerator.simulated_capacity_bytes = parse_env(&name, &val)?;
    }

    // Ledger
    if let Some((name, val)) = var("REFRESH_GAP_MS") {
        config.ledger.max_refresh_gap_ms = parse_env(&name, &val)?;
    }

    // Logging
    if let Some((_, val)) = var("LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Some((_, val)) = var("LOG_FORMAT") {
        config.logging.format = val;
    }
    if let Some((name, val)) = var("METRICS") {
        config.metrics.enabled = parse_env(&name, &val)?;
    }

    Ok(())
}

/// Load configuration from default locations.
pub fn load_default_config() -> Result<Config, ConfigError> {
    let paths = [
        "duplex.yaml",
        "duplex.yml",
        "duplex.toml",
        "duplex.json",
        "/etc/duplex/config.yaml",
    ];

    for path in &paths {
        if Path::new(path).exists() {
            return ConfigLoader::new()
                .with_file(*path)
                .with_env_prefix("DUPLEX")
                .load();
        }
    }

    ConfigLoader::new().with_env_prefix("DUPLEX").load()
}

/// Builder for programmatic configuration.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new config builder.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set ledger configuration.
    pub fn ledger(mut self, config: LedgerConfig) -> Self {
        self.config.ledger = config;
        self
    }

    /// Set accelerator configuration.
    pub fn accelerator(mut self, config: AcceleratorConfig) -> Self {
        self.config.accelerator = config;
        self
    }

    /// Set kernel configuration.
    pub fn kernels(mut self, config: KernelConfig) -> Self {
        self.config.kernels = config;
        self
    }

    /// Set the backend strategy.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.config.kernels.backend = backend;
        self
    }

    /// Use a simulated accelerator with the given capacity.
    pub fn simulated_capacity(mut self, bytes: u64) -> Self {
        self.config.accelerator = AcceleratorConfig::simulated(bytes);
        self
    }

    /// Enable or disable metrics.
    pub fn metrics(mut self, enabled: bool) -> Self {
        self.config.metrics.enabled = enabled;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<Config, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
