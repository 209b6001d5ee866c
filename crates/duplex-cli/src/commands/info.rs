//! Info command - show the runtime built from the configuration.

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use duplex_config::Config;
use duplex_engine::Runtime;
use duplex_tensor::{parallel, FloatTensor};

use crate::output::{self, format_bytes, format_kv_list, format_table};

/// Info command arguments.
#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Offer a probe tensor of this many elements before reporting.
    #[arg(long)]
    pub probe: Option<usize>,

    /// Print the Prometheus exposition after the report.
    #[arg(long)]
    pub metrics: bool,
}

/// Execute the info command.
pub fn execute(args: InfoArgs, config: Config, json: bool) -> Result<()> {
    let runtime = Runtime::from_config(config)?;

    // Kept alive until the report is printed so its allocation shows up.
    let probe = match (args.probe, runtime.context()) {
        (Some(len), Some(ctx)) => {
            let tensor = FloatTensor::zeros(len);
            ctx.offer(&tensor, "probe", false)?;
            Some(tensor)
        }
        _ => None,
    };

    let config = runtime.config();
    let accelerator = runtime
        .context()
        .map(|ctx| ctx.accelerator().name().to_string());
    let snapshot = runtime.ledger_snapshot();
    let report = runtime.placement_report();

    if json {
        let info = serde_json::json!({
            "backend": runtime.backend().name(),
            "accelerator": accelerator,
            "accelerator_kind": config.accelerator.kind.to_string(),
            "threads": parallel::current_num_threads(),
            "tolerance": config.kernels.tolerance,
            "ledger": snapshot.map(|s| serde_json::json!({
                "total": s.total,
                "baseline_free": s.baseline_free,
                "allocated": s.allocated,
                "available": s.available(),
                "refresh_interval": s.refresh_interval,
                "release_count": s.release_count,
                "refreshes": s.refreshes,
            })),
            "placement": report.as_ref().map(|r| serde_json::json!({
                "tracked": r.entries.len(),
                "uploads": r.total_uploads,
                "downloads": r.total_downloads,
                "upload_bytes": r.total_upload_bytes,
                "download_bytes": r.total_download_bytes,
            })),
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        output::print_section("Runtime");
        println!(
            "{}",
            format_kv_list(&[
                ("Backend", runtime.backend().name().to_string()),
                (
                    "Accelerator",
                    accelerator.unwrap_or_else(|| "none".to_string())
                ),
                ("Bridge", config.accelerator.kind.to_string()),
                ("Threads", parallel::current_num_threads().to_string()),
                ("Tolerance", format!("{:e}", config.kernels.tolerance)),
            ])
        );

        output::print_section("Ledger");
        match snapshot {
            Some(ref s) => println!("{}", format_kv_list(&output::ledger_items(s))),
            None => println!("  {}", "no accelerator in use".dimmed()),
        }
        println!(
            "  {} margin for 1 MiB: {}",
            "·".dimmed(),
            format_bytes(config.ledger.safety_margin(1 << 20))
        );

        if let Some(ref report) = report {
            output::print_section("Placement");
            if report.entries.is_empty() {
                println!("  {}", "nothing tracked".dimmed());
            } else {
                print!(
                    "{}",
                    format_table(&output::PLACEMENT_HEADERS, &output::placement_rows(report))
                );
            }
        }
    }

    if args.metrics {
        match duplex_metrics::export_prometheus() {
            Ok(text) => println!("\n{text}"),
            Err(e) => output::print_warning(&format!("metrics unavailable: {e}")),
        }
    }

    drop(probe);
    Ok(())
}
