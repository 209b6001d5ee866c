//! Verify command - cross-check accelerator kernels against the host.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use duplex_config::{BackendKind, Config};
use duplex_engine::{attend, AttentionShape, ComputeBackend, RotaryEmbedding, Runtime, VerifyingBackend};
use duplex_tensor::FloatTensor;

use crate::output::{self, format_kv_list};

/// Verify command arguments.
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Simulated device capacity in bytes.
    #[arg(long)]
    pub capacity: Option<u64>,

    /// Rounds of randomized kernel calls.
    #[arg(short, long, default_value = "3")]
    pub rounds: usize,

    /// Seed for the random operands.
    #[arg(long, default_value = "7")]
    pub seed: u64,

    /// Comparison tolerance; defaults to `kernels.tolerance`.
    #[arg(long)]
    pub tolerance: Option<f32>,
}

/// Outcome of a verification run.
#[derive(Debug, serde::Serialize)]
struct VerifyResults {
    accelerator: String,
    rounds: usize,
    tolerance: f32,
    checks: u64,
    mismatches: u64,
    uploads: u64,
    downloads: u64,
}

/// Execute the verify command.
pub fn execute(args: VerifyArgs, mut config: Config, json: bool) -> Result<()> {
    config.kernels.backend = BackendKind::Verify;
    if let Some(capacity) = args.capacity {
        config.accelerator.simulated_capacity_bytes = capacity;
    }
    let tolerance = args.tolerance.unwrap_or(config.kernels.tolerance);

    let runtime = Runtime::from_config(config)?;
    let ctx = runtime
        .context()
        .context("verify backend started without an accelerator")?;
    let backend = VerifyingBackend::new(Arc::clone(ctx), tolerance);

    if !json {
        println!(
            "{} {} ({} rounds, tolerance {:e})\n",
            "Verifying".bright_green().bold(),
            ctx.accelerator().name().bright_cyan(),
            args.rounds,
            tolerance
        );
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    for round in 0..args.rounds {
        debug!(round, seed = args.seed, "Starting verification round");
        run_round(&backend, &mut rng, round)
            .with_context(|| format!("verification round {round} failed"))?;
    }

    let report = ctx.report();
    let results = VerifyResults {
        accelerator: ctx.accelerator().name().to_string(),
        rounds: args.rounds,
        tolerance,
        checks: backend.checks(),
        mismatches: backend.mismatches(),
        uploads: report.total_uploads,
        downloads: report.total_downloads,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        output::print_section("Results");
        println!(
            "{}",
            format_kv_list(&[
                ("Checks", results.checks.to_string()),
                ("Mismatches", results.mismatches.to_string()),
                ("Uploads", results.uploads.to_string()),
                ("Downloads", results.downloads.to_string()),
            ])
        );
        println!();
        if results.mismatches == 0 {
            output::print_success("accelerator agrees with the host kernels");
        } else {
            output::print_error("accelerator disagrees with the host kernels");
        }
    }

    if results.mismatches > 0 {
        bail!(
            "{} of {} kernel comparisons exceeded tolerance {:e}",
            results.mismatches,
            results.checks,
            tolerance
        );
    }
    Ok(())
}

fn random_tensor(rng: &mut StdRng, len: usize) -> FloatTensor {
    FloatTensor::from_vec((0..len).map(|_| rng.gen_range(-1.0..1.0)).collect())
}

/// One pass over every kernel with sizes that grow per round.
fn run_round(backend: &dyn ComputeBackend, rng: &mut StdRng, round: usize) -> Result<()> {
    let size = 17 + round * 31;

    let a = random_tensor(rng, size);
    let b = random_tensor(rng, size);
    backend.dot(&a, 0, &b, 0, size)?;

    let mut logits = random_tensor(rng, size);
    backend.softmax(&mut logits, 0, size)?;

    let weight = random_tensor(rng, size);
    let mut normed = FloatTensor::zeros(size);
    backend.rmsnorm(&mut normed, &a, &weight, size, 1e-5)?;

    let rows = 8 + round;
    let weights = random_tensor(rng, rows * size);
    let mut out = FloatTensor::zeros(rows);
    backend.matmul(&weights, &a, &mut out, rows, size)?;

    let inputs: Vec<FloatTensor> = (0..3).map(|_| random_tensor(rng, size)).collect();
    let mut outs: Vec<FloatTensor> = (0..3).map(|_| FloatTensor::zeros(rows)).collect();
    {
        let input_refs: Vec<&FloatTensor> = inputs.iter().collect();
        let mut out_refs: Vec<&mut FloatTensor> = outs.iter_mut().collect();
        backend.matmul_batched(&weights, &input_refs, &mut out_refs, rows, size)?;
    }

    let shape = AttentionShape {
        num_heads: 4,
        num_kv_heads: 2,
        head_size: 8,
        context_length: 16,
    };
    let position = (round * 5) % shape.context_length;
    let query = random_tensor(rng, shape.dim());
    let keys = random_tensor(rng, shape.cache_len());
    let values = random_tensor(rng, shape.cache_len());
    let mut att = FloatTensor::zeros(shape.scores_len());
    let mut attended = FloatTensor::zeros(shape.dim());
    attend(backend, &shape, position, &query, &keys, &values, &mut att, &mut attended)?;

    let rope = RotaryEmbedding::new(shape.context_length, shape.head_size, 10000.0)?;
    let mut q = random_tensor(rng, shape.dim());
    let mut k = random_tensor(rng, shape.kv_dim());
    rope.apply(
        backend,
        &mut [&mut q],
        &mut [&mut k],
        position,
        shape.dim(),
        shape.kv_dim(),
    )?;

    Ok(())
}
