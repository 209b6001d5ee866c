//! Bench command - time kernels on each backend.

use std::time::Instant;

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use duplex_config::{BackendKind, Config};
use duplex_engine::{attend, AttentionShape, ComputeBackend, Runtime};
use duplex_tensor::FloatTensor;

use crate::output::{self, format_bytes, format_duration, format_table};

/// Bench command arguments.
#[derive(Args, Debug)]
pub struct BenchArgs {
    /// Backends to time, comma separated.
    #[arg(short, long, value_delimiter = ',', default_value = "cpu,accelerator,verify")]
    pub backends: Vec<BackendKind>,

    /// Vector length; matmul uses a square matrix of this size.
    #[arg(short, long, default_value = "1024")]
    pub size: usize,

    /// Timed iterations per kernel.
    #[arg(short, long, default_value = "50")]
    pub iterations: usize,

    /// Untimed iterations per kernel.
    #[arg(long, default_value = "5")]
    pub warmup: usize,

    /// Output file for the results as JSON.
    #[arg(short, long)]
    pub output: Option<String>,
}

/// Latency summary of one kernel on one backend.
#[derive(Debug, Clone, serde::Serialize)]
struct KernelTiming {
    backend: String,
    kernel: &'static str,
    iterations: usize,
    mean_seconds: f64,
    p50_seconds: f64,
    p99_seconds: f64,
}

/// Execute the bench command.
pub fn execute(args: BenchArgs, config: Config, json: bool) -> Result<()> {
    if !json {
        println!(
            "{} size {} × {} iterations ({} warm-up)\n",
            "Benchmarking".bright_green().bold(),
            args.size,
            args.iterations,
            args.warmup
        );
    }

    let mut timings = Vec::new();
    for &kind in &args.backends {
        let mut backend_config = config.clone();
        backend_config.kernels.backend = kind;
        let runtime = Runtime::from_config(backend_config)?;

        if !json {
            println!("  {} {}", "▸".bright_blue(), kind);
        }
        timings.extend(bench_backend(runtime.backend(), &args)?);

        if let (false, Some(report)) = (json, runtime.placement_report()) {
            println!(
                "    moved {} up, {} down",
                format_bytes(report.total_upload_bytes),
                format_bytes(report.total_download_bytes)
            );
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&timings)?);
    } else {
        output::print_section("Latency");
        let rows: Vec<Vec<String>> = timings
            .iter()
            .map(|t| {
                vec![
                    t.backend.clone(),
                    t.kernel.to_string(),
                    format_duration(t.mean_seconds),
                    format_duration(t.p50_seconds),
                    format_duration(t.p99_seconds),
                ]
            })
            .collect();
        print!("{}", format_table(&["Backend", "Kernel", "Mean", "P50", "P99"], &rows));
    }

    if let Some(path) = args.output {
        std::fs::write(&path, serde_json::to_string_pretty(&timings)?)?;
        if !json {
            output::print_success(&format!("results written to {path}"));
        }
    }

    Ok(())
}

fn bench_backend(backend: &dyn ComputeBackend, args: &BenchArgs) -> Result<Vec<KernelTiming>> {
    let n = args.size;
    let x = FloatTensor::from_vec((0..n).map(|i| (i % 13) as f32 * 0.05).collect());
    let y = FloatTensor::from_vec((0..n).map(|i| 1.0 - (i % 7) as f32 * 0.1).collect());
    let weights = FloatTensor::from_vec((0..n * n).map(|i| (i % 17) as f32 * 0.01).collect());
    let mut out = FloatTensor::zeros(n);
    let mut logits = x.clone();

    let shape = AttentionShape {
        num_heads: 8,
        num_kv_heads: 2,
        head_size: 64,
        context_length: 256,
    };
    let query = FloatTensor::from_vec(vec![0.1; shape.dim()]);
    let keys = FloatTensor::from_vec((0..shape.cache_len()).map(|i| (i % 11) as f32 * 0.02).collect());
    let values = FloatTensor::from_vec((0..shape.cache_len()).map(|i| (i % 5) as f32 * 0.1).collect());
    let mut att = FloatTensor::zeros(shape.scores_len());
    let mut attended = FloatTensor::zeros(shape.dim());

    let name = backend.name().to_string();
    let mut timings = Vec::new();
    timings.push(time(&name, "dot", args, || {
        backend.dot(&x, 0, &y, 0, n).map(drop)
    })?);
    timings.push(time(&name, "softmax", args, || backend.softmax(&mut logits, 0, n))?);
    timings.push(time(&name, "matmul", args, || {
        backend.matmul(&weights, &x, &mut out, n, n)
    })?);
    timings.push(time(&name, "attention", args, || {
        attend(
            backend,
            &shape,
            shape.context_length - 1,
            &query,
            &keys,
            &values,
            &mut att,
            &mut attended,
        )
    })?);
    Ok(timings)
}

fn time<F>(backend: &str, kernel: &'static str, args: &BenchArgs, mut run: F) -> Result<KernelTiming>
where
    F: FnMut() -> duplex_core::Result<()>,
{
    for _ in 0..args.warmup {
        run()?;
    }

    let mut samples = Vec::with_capacity(args.iterations);
    for _ in 0..args.iterations {
        let start = Instant::now();
        run()?;
        samples.push(start.elapsed().as_secs_f64());
    }
    samples.sort_by(f64::total_cmp);

    let mean = if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    };
    Ok(KernelTiming {
        backend: backend.to_string(),
        kernel,
        iterations: samples.len(),
        mean_seconds: mean,
        p50_seconds: percentile(&samples, 0.50),
        p99_seconds: percentile(&samples, 0.99),
    })
}

/// Nearest-rank percentile of sorted samples.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_engine::CpuBackend;

    #[test]
    fn test_percentile() {
        let samples: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&samples, 0.50), 50.0);
        assert_eq!(percentile(&samples, 0.99), 99.0);
        assert_eq!(percentile(&samples, 0.0), 1.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn test_bench_backend_times_every_kernel() {
        let args = BenchArgs {
            backends: vec![BackendKind::Cpu],
            size: 16,
            iterations: 3,
            warmup: 1,
            output: None,
        };
        let timings = bench_backend(&CpuBackend, &args).unwrap();
        let kernels: Vec<&str> = timings.iter().map(|t| t.kernel).collect();
        assert_eq!(kernels, ["dot", "softmax", "matmul", "attention"]);
        assert!(timings.iter().all(|t| t.iterations == 3 && t.backend == "cpu"));
    }
}
