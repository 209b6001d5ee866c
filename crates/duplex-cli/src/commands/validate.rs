//! Validate command - validate configuration files.

use std::path::Path;

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use duplex_config::loader::ConfigFormat;
use duplex_config::{AcceleratorKind, BackendKind, Config, ConfigError};

use crate::output::{format_bytes, format_kv_list};

/// Smallest simulated device that leaves room after the minimum margin.
const SMALL_DEVICE_BYTES: u64 = 16 * 1024 * 1024;

/// Validate command arguments.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Configuration file to validate.
    pub config_file: String,

    /// Also check that the native bridge library exists.
    #[arg(long)]
    pub check_library: bool,

    /// Verbose output.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Findings for one configuration file.
#[derive(Debug, Default)]
struct Findings {
    config: Option<Config>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

fn check_file(path: &str, check_library: bool) -> Findings {
    let mut findings = Findings::default();

    let parsed = match ConfigFormat::from_extension(path) {
        None => Err(ConfigError::UnsupportedFormat(path.to_string())),
        Some(format) => std::fs::read_to_string(path)
            .map_err(ConfigError::from)
            .and_then(|content| format.parse::<Config>(&content)),
    };
    let config = match parsed {
        Ok(config) => config,
        Err(e) => {
            findings.errors.push(e.to_string());
            return findings;
        }
    };

    if let Err(e) = config.validate() {
        findings.errors.push(e.to_string());
    }

    if config.accelerator.kind == AcceleratorKind::Native {
        if let Some(lib) = config.accelerator.library_path.as_deref() {
            if check_library && !Path::new(lib).exists() {
                findings
                    .errors
                    .push(format!("bridge library does not exist: {lib}"));
            }
        }
    } else if config.accelerator.simulated_capacity_bytes < SMALL_DEVICE_BYTES {
        findings.warnings.push(format!(
            "simulated capacity {} leaves little room after the {} safety margin",
            format_bytes(config.accelerator.simulated_capacity_bytes),
            format_bytes(config.ledger.min_margin_bytes)
        ));
    }

    if config.kernels.backend == BackendKind::Verify && config.kernels.tolerance > 1e-2 {
        findings.warnings.push(format!(
            "verify tolerance {:e} is loose enough to hide kernel bugs",
            config.kernels.tolerance
        ));
    }
    if config.kernels.backend != BackendKind::Verify && config.tracker.log_transfers {
        findings
            .warnings
            .push("tracker.log_transfers logs every upload and download at debug level".to_string());
    }
    if !config.metrics.enabled {
        findings
            .warnings
            .push("metrics are disabled; kernel latency will not be recorded".to_string());
    }

    findings.config = Some(config);
    findings
}

/// Execute the validate command.
pub fn execute(args: ValidateArgs, json: bool) -> Result<()> {
    if !json {
        println!(
            "\n{} {}\n",
            "Validating".bright_green().bold(),
            args.config_file.bright_cyan()
        );
    }

    let findings = check_file(&args.config_file, args.check_library);

    if let (true, false, Some(config)) = (args.verbose, json, &findings.config) {
        println!("  {}", "Configuration:".bright_cyan());
        println!(
            "{}",
            format_kv_list(&[
                ("Backend", config.kernels.backend.to_string()),
                ("Accelerator", config.accelerator.kind.to_string()),
                (
                    "Capacity",
                    format_bytes(config.accelerator.simulated_capacity_bytes)
                ),
                (
                    "Refresh interval",
                    format!(
                        "{}..={}",
                        config.ledger.min_refresh_interval, config.ledger.max_refresh_interval
                    )
                ),
                (
                    "Refresh gap",
                    format!("{:?}", config.ledger.max_refresh_gap())
                ),
                ("Tolerance", format!("{:e}", config.kernels.tolerance)),
            ])
        );
        println!();
    }

    if json {
        let result = serde_json::json!({
            "file": args.config_file,
            "valid": findings.errors.is_empty(),
            "errors": findings.errors,
            "warnings": findings.warnings,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        if !findings.errors.is_empty() {
            println!("  {}", "Errors:".bright_red().bold());
            for error in &findings.errors {
                println!("    {} {}", "✗".bright_red(), error);
            }
            println!();
        }

        if !findings.warnings.is_empty() {
            println!("  {}", "Warnings:".bright_yellow().bold());
            for warning in &findings.warnings {
                println!("    {} {}", "⚠".bright_yellow(), warning);
            }
            println!();
        }

        if findings.errors.is_empty() {
            println!(
                "  {} Configuration is {}",
                "✓".bright_green(),
                "valid".bright_green().bold()
            );
        } else {
            println!(
                "  {} Configuration is {}",
                "✗".bright_red(),
                "invalid".bright_red().bold()
            );
        }
    }

    if !findings.errors.is_empty() {
        anyhow::bail!("Configuration validation failed");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_valid_yaml() {
        let file = write_config(
            ".yaml",
            "kernels:\n  backend: verify\naccelerator:\n  simulated_capacity_bytes: 67108864\n",
        );
        let findings = check_file(file.path().to_str().unwrap(), false);
        assert!(findings.errors.is_empty(), "{:?}", findings.errors);
        assert!(findings.warnings.is_empty(), "{:?}", findings.warnings);
        assert_eq!(findings.config.unwrap().kernels.backend, BackendKind::Verify);
    }

    #[test]
    fn test_cross_field_error() {
        let file = write_config(
            ".toml",
            "[ledger]\nmin_refresh_interval = 64\nmax_refresh_interval = 8\n",
        );
        let findings = check_file(file.path().to_str().unwrap(), false);
        assert_eq!(findings.errors.len(), 1);
        assert!(findings.errors[0].contains("min_refresh_interval"));
    }

    #[test]
    fn test_missing_library_only_when_checked() {
        let file = write_config(
            ".json",
            r#"{"accelerator": {"kind": "native", "library_path": "/nonexistent/libbridge.so"}}"#,
        );
        let path = file.path().to_str().unwrap().to_string();
        assert!(check_file(&path, false).errors.is_empty());
        assert_eq!(check_file(&path, true).errors.len(), 1);
    }

    #[test]
    fn test_unknown_extension_and_small_device() {
        assert_eq!(check_file("duplex.ini", false).errors.len(), 1);

        let file = write_config(
            ".yaml",
            "accelerator:\n  simulated_capacity_bytes: 1048576\nmetrics:\n  enabled: false\n",
        );
        let findings = check_file(file.path().to_str().unwrap(), false);
        assert!(findings.errors.is_empty());
        assert_eq!(findings.warnings.len(), 2);
    }
}
