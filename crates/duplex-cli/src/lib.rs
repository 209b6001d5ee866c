//! Duplex CLI.

pub mod commands;
pub mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use duplex_config::{Config, ConfigLoader};

/// Duplex - accelerator memory runtime diagnostics.
#[derive(Parser, Debug)]
#[command(
    name = "duplex",
    author = "Duplex Contributors",
    version,
    about = "Diagnostics for the Duplex accelerator memory runtime",
    long_about = "Duplex keeps host tensors and their accelerator copies coherent.\n\n\
                  This tool inspects a configured runtime:\n\
                  • Ledger and placement state of the selected accelerator\n\
                  • Accelerator kernels cross-checked against the host loops\n\
                  • Configuration file validation\n\
                  • Kernel latency per backend"
)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path.
    #[arg(short, long, global = true, env = "DUPLEX_CONFIG_FILE")]
    pub config: Option<String>,

    /// Log level or filter directive; overrides the configuration.
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Enable JSON output.
    #[arg(long, global = true)]
    pub json: bool,
}

/// CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the runtime built from the configuration.
    Info(commands::info::InfoArgs),

    /// Cross-check accelerator kernels against the host kernels.
    Verify(commands::verify::VerifyArgs),

    /// Validate a configuration file.
    Validate(commands::validate::ValidateArgs),

    /// Time kernels on each backend.
    Bench(commands::bench::BenchArgs),

    /// Show version information.
    Version,
}

/// Load the configuration from `path` (or defaults) with `DUPLEX_*` overrides.
pub fn load_config(path: Option<&str>) -> Result<Config> {
    let mut loader = ConfigLoader::new().with_env_prefix("DUPLEX");
    if let Some(path) = path {
        loader = loader.with_file(path);
    }
    loader
        .load()
        .with_context(|| match path {
            Some(path) => format!("failed to load configuration from {path}"),
            None => "failed to load configuration".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_verify_overrides() {
        let cli = Cli::parse_from([
            "duplex",
            "--json",
            "verify",
            "--capacity",
            "1048576",
            "--rounds",
            "2",
        ]);
        assert!(cli.json);
        match cli.command {
            Commands::Verify(args) => {
                assert_eq!(args.capacity, Some(1 << 20));
                assert_eq!(args.rounds, 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = load_config(Some("/nonexistent/duplex.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/duplex.yaml"));
    }
}
