//! Duplex CLI entry point.

use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use duplex_cli::{commands, load_config, Cli, Commands};
use duplex_config::Config;
use duplex_engine::Runtime;

fn main() -> Result<()> {
    let Cli {
        command,
        config,
        log_level,
        json,
    } = Cli::parse();

    match command {
        // Reports on a file that may not load, so no runtime is prepared.
        Commands::Validate(args) => commands::validate::execute(args, json),
        Commands::Version => print_version(json),
        Commands::Info(args) => {
            let config = prepare(config.as_deref(), log_level, json)?;
            commands::info::execute(args, config, json)
        }
        Commands::Verify(args) => {
            let config = prepare(config.as_deref(), log_level, json)?;
            commands::verify::execute(args, config, json)
        }
        Commands::Bench(args) => {
            let config = prepare(config.as_deref(), log_level, json)?;
            commands::bench::execute(args, config, json)
        }
    }
}

/// Load the configuration, apply flag overrides and install tracing.
fn prepare(path: Option<&str>, log_level: Option<String>, json: bool) -> Result<Config> {
    let mut config = load_config(path)?;
    if let Some(level) = log_level {
        config.logging.level = level;
    }
    if json {
        config.logging.format = "json".to_string();
    }
    Runtime::init_tracing(&config)?;

    if !json {
        print_banner();
    }
    Ok(config)
}

/// Print the banner.
fn print_banner() {
    println!(
        "\n  {} {} - {}\n",
        "Duplex".bright_green().bold(),
        env!("CARGO_PKG_VERSION").bright_yellow(),
        "accelerator memory runtime".white()
    );
}

/// Print version information.
fn print_version(json: bool) -> Result<()> {
    if json {
        let version = serde_json::json!({
            "name": "duplex",
            "version": env!("CARGO_PKG_VERSION"),
            "rust_version": env!("CARGO_PKG_RUST_VERSION"),
            "authors": env!("CARGO_PKG_AUTHORS"),
            "description": env!("CARGO_PKG_DESCRIPTION"),
        });
        println!("{}", serde_json::to_string_pretty(&version)?);
    } else {
        println!("{} {}", "Duplex".bright_green().bold(), env!("CARGO_PKG_VERSION"));
        println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
        println!("Authors: {}", env!("CARGO_PKG_AUTHORS"));
        println!();
        println!("{}", env!("CARGO_PKG_DESCRIPTION"));
    }
    Ok(())
}
