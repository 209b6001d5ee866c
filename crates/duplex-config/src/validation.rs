//! Cross-field configuration validation.
//!
//! Single-field ranges live on the structs as `validator` attributes; the
//! rules here relate several fields to each other.

use crate::error::ConfigError;
use crate::{AcceleratorKind, Config};

const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validate a configuration.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    validate_ledger_config(config)?;
    validate_accelerator_config(config)?;
    validate_logging_config(config)?;
    Ok(())
}

fn validate_ledger_config(config: &Config) -> Result<(), ConfigError> {
    let ledger = &config.ledger;

    if ledger.min_refresh_interval > ledger.max_refresh_interval {
        return Err(ConfigError::invalid_value(
            "ledger.min_refresh_interval",
            format!(
                "must not exceed ledger.max_refresh_interval ({})",
                ledger.max_refresh_interval
            ),
        ));
    }

    if ledger.min_margin_bytes > ledger.max_margin_bytes {
        return Err(ConfigError::invalid_value(
            "ledger.min_margin_bytes",
            format!(
                "must not exceed ledger.max_margin_bytes ({})",
                ledger.max_margin_bytes
            ),
        ));
    }

    Ok(())
}

fn validate_accelerator_config(config: &Config) -> Result<(), ConfigError> {
    if config.accelerator.kind == AcceleratorKind::Native {
        match config.accelerator.library_path.as_deref() {
            None | Some("") => {
                return Err(ConfigError::missing_field("accelerator.library_path"));
            }
            Some(_) => {}
        }
    }

    if !config.kernels.tolerance.is_finite() {
        return Err(ConfigError::invalid_value(
            "kernels.tolerance",
            "must be a finite number",
        ));
    }

    Ok(())
}

fn validate_logging_config(config: &Config) -> Result<(), ConfigError> {
    let format = config.logging.format.to_lowercase();
    if !LOG_FORMATS.contains(&format.as_str()) {
        return Err(ConfigError::invalid_value(
            "logging.format",
            format!("must be one of: {}", LOG_FORMATS.join(", ")),
        ));
    }

    // Full filter directives such as "duplex_tensor=debug" are passed through.
    let level = config.logging.level.to_lowercase();
    if !level.contains('=') && !LOG_LEVELS.contains(&level.as_str()) {
        return Err(ConfigError::invalid_value(
            "logging.level",
            format!("must be one of: {} or a filter directive", LOG_LEVELS.join(", ")),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_order() {
        let mut config = Config::default();
        config.ledger.min_refresh_interval = 2048;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_margin_order() {
        let mut config = Config::default();
        config.ledger.min_margin_bytes = config.ledger.max_margin_bytes + 1;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_native_requires_library() {
        let mut config = Config::default();
        config.accelerator.kind = AcceleratorKind::Native;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingField(_))
        ));
        config.accelerator.library_path = Some("/opt/libbridge.so".into());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_logging_values() {
        let mut config = Config::default();
        config.logging.format = "xml".into();
        assert!(validate_config(&config).is_err());

        config.logging.format = "json".into();
        config.logging.level = "duplex_tensor=trace,info".into();
        assert!(validate_config(&config).is_ok());

        config.logging.level = "loud".into();
        assert!(validate_config(&config).is_err());
    }
}
