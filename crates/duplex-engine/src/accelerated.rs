//! Accelerator-dispatched kernels.
//!
//! Every operand goes through `offer` before a launch, so clean tensors cost
//! nothing to reuse. Outputs are reclaimed right after the launch: the host
//! buffer is current again when a method returns.

use std::sync::Arc;

use tracing::trace;

use duplex_core::Result;
use duplex_metrics::time_kernel;
use duplex_tensor::accelerator::{
    KernelOperand, MatmulLaunch, RmsNormLaunch, RopeLaunch, ScoreLaunch, WeightedSumLaunch,
};
use duplex_tensor::kernels::{self, AttentionGeometry, RopeShape};
use duplex_tensor::{DeviceContext, FloatTensor, TableAccess};

use crate::backend::ComputeBackend;

/// Runs kernels on the context's accelerator.
#[derive(Debug, Clone)]
pub struct AcceleratorBackend {
    ctx: Arc<DeviceContext>,
}

impl AcceleratorBackend {
    /// Dispatch through `ctx`.
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self { ctx }
    }

    /// The device context operands are placed through.
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    fn launch<T>(&self, kernel: &'static str, body: impl FnOnce() -> Result<T>) -> Result<T> {
        let backend = self.ctx.accelerator().name().to_string();
        trace!("Launching {} on {}", kernel, backend);
        time_kernel!(kernel, backend.as_str(), body())
    }
}

impl ComputeBackend for AcceleratorBackend {
    fn name(&self) -> &'static str {
        "accelerator"
    }

    fn dot(
        &self,
        a: &FloatTensor,
        a_offset: usize,
        b: &FloatTensor,
        b_offset: usize,
        size: usize,
    ) -> Result<f32> {
        kernels::check_window("dot lhs", a.len(), a_offset, size)?;
        kernels::check_window("dot rhs", b.len(), b_offset, size)?;
        let ctx = &self.ctx;
        let pa = ctx.offer(a, "dot.lhs", false)?;
        let pb = ctx.offer(b, "dot.rhs", false)?;
        self.launch("dot", || {
            ctx.accelerator().dot(
                KernelOperand::f32(pa, a_offset),
                KernelOperand::f32(pb, b_offset),
                size,
            )
        })
    }

    fn softmax(&self, x: &mut FloatTensor, offset: usize, size: usize) -> Result<()> {
        kernels::check_window("softmax input", x.len(), offset, size)?;
        let ctx = &self.ctx;
        let ptr = ctx.offer(x, "softmax.x", false)?;
        self.launch("softmax", || ctx.accelerator().softmax(ptr, offset, size))?;
        ctx.reclaim_tensor(x, "softmax.x")
    }

    fn rmsnorm(
        &self,
        out: &mut FloatTensor,
        x: &FloatTensor,
        weight: &FloatTensor,
        size: usize,
        eps: f32,
    ) -> Result<()> {
        kernels::check_window("rmsnorm input", x.len(), 0, size)?;
        kernels::check_window("rmsnorm weight", weight.len(), 0, size)?;
        kernels::check_window("rmsnorm output", out.len(), 0, size)?;
        let ctx = &self.ctx;
        let launch = RmsNormLaunch {
            x: KernelOperand::f32(ctx.offer(x, "rmsnorm.x", false)?, 0),
            weight: KernelOperand::f32(ctx.offer(weight, "rmsnorm.weight", false)?, 0),
            out: ctx.offer(out, "rmsnorm.out", false)?,
            size,
            eps,
        };
        self.launch("rmsnorm", || ctx.accelerator().rmsnorm(&launch))?;
        ctx.reclaim_tensor(out, "rmsnorm.out")
    }

    fn attention_scores(
        &self,
        att: &mut FloatTensor,
        query: &FloatTensor,
        key_cache: &FloatTensor,
        geometry: &AttentionGeometry,
    ) -> Result<()> {
        let g = geometry;
        g.validate()?;
        kernels::check_window("query", query.len(), g.query_offset(), g.head_size)?;
        kernels::check_window("key cache", key_cache.len(), g.cache_offset(g.position), g.head_size)?;
        kernels::check_window("attention buffer", att.len(), g.att_offset(), g.prefix_len())?;

        let ctx = &self.ctx;
        let launch = ScoreLaunch {
            query: KernelOperand::f32(ctx.offer(query, "attention.query", false)?, g.query_offset()),
            key_cache: KernelOperand::f32(ctx.offer(key_cache, "attention.key_cache", false)?, 0),
            att: ctx.offer(att, "attention.scores", false)?,
            att_offset: g.att_offset(),
            geometry: *g,
        };
        self.launch("attention_scores", || {
            ctx.accelerator().attention_scores(&launch)
        })?;
        ctx.reclaim_tensor(att, "attention.scores")
    }

    fn weighted_sum(
        &self,
        out: &mut FloatTensor,
        att: &FloatTensor,
        value_cache: &FloatTensor,
        geometry: &AttentionGeometry,
    ) -> Result<()> {
        let g = geometry;
        g.validate()?;
        kernels::check_window("attention buffer", att.len(), g.att_offset(), g.prefix_len())?;
        kernels::check_window("value cache", value_cache.len(), g.cache_offset(g.position), g.head_size)?;
        kernels::check_window("output", out.len(), g.query_offset(), g.head_size)?;

        let ctx = &self.ctx;
        let launch = WeightedSumLaunch {
            att: ctx.offer(att, "attention.scores", false)?,
            att_offset: g.att_offset(),
            out: ctx.offer(out, "attention.out", false)?,
            out_offset: g.query_offset(),
            value_cache: ctx.offer(value_cache, "attention.value_cache", false)?,
            geometry: *g,
        };
        self.launch("weighted_sum", || ctx.accelerator().weighted_sum(&launch))?;
        ctx.reclaim_tensor(out, "attention.out")
    }

    fn matmul(
        &self,
        weights: &FloatTensor,
        input: &FloatTensor,
        out: &mut FloatTensor,
        dim0: usize,
        dim1: usize,
    ) -> Result<()> {
        let cells = dim0
            .checked_mul(dim1)
            .ok_or_else(|| duplex_core::Error::tensor("matmul dimensions overflow"))?;
        kernels::check_window("matmul weights", weights.len(), 0, cells)?;
        kernels::check_window("matmul input", input.len(), 0, dim1)?;
        kernels::check_window("matmul output", out.len(), 0, dim0)?;

        let ctx = &self.ctx;
        let launch = MatmulLaunch {
            weights: KernelOperand::f32(ctx.offer(weights, "matmul.weights", false)?, 0),
            input: KernelOperand::f32(ctx.offer(input, "matmul.input", false)?, 0),
            out: ctx.offer(out, "matmul.out", false)?,
            dim0,
            dim1,
        };
        self.launch("matmul", || ctx.accelerator().matmul(&launch))?;
        ctx.reclaim_tensor(out, "matmul.out")
    }

    fn matmul_batched(
        &self,
        weights: &FloatTensor,
        inputs: &[&FloatTensor],
        outs: &mut [&mut FloatTensor],
        dim0: usize,
        dim1: usize,
    ) -> Result<()> {
        kernels::check_batch("batched matmul", inputs.len(), outs.len())?;
        inputs
            .iter()
            .zip(outs.iter_mut())
            .try_for_each(|(input, out)| self.matmul(weights, input, out, dim0, dim1))
    }

    fn rope(
        &self,
        queries: &mut [&mut FloatTensor],
        keys: &mut [&mut FloatTensor],
        real: &FloatTensor,
        imag: &FloatTensor,
        shape: RopeShape,
    ) -> Result<()> {
        kernels::check_batch("rope", queries.len(), keys.len())?;
        if queries.is_empty() {
            return Ok(());
        }
        let last = shape.advanced(queries.len() - 1);
        last.validate(real.len().min(imag.len()))?;
        for (q, k) in queries.iter().zip(keys.iter()) {
            kernels::check_window("rope query", q.len(), 0, shape.dim)?;
            kernels::check_window("rope key", k.len(), 0, shape.kv_dim.min(shape.dim))?;
        }

        let ctx = &self.ctx;
        // The table handles stay alive until the launch returns so a
        // concurrent call under the same labels gets tables of its own.
        let (q_table, k_table) = {
            let q_refs: Vec<&FloatTensor> = queries.iter().map(|q| &**q).collect();
            let k_refs: Vec<&FloatTensor> = keys.iter().map(|k| &**k).collect();
            (
                ctx.offer_table(&q_refs, "rope.queries", TableAccess::ReadOnly, false)?,
                ctx.offer_table(&k_refs, "rope.keys", TableAccess::ReadOnly, false)?,
            )
        };
        let launch = RopeLaunch {
            real: KernelOperand::f32(ctx.offer(real, "rope.real", false)?, 0),
            imag: KernelOperand::f32(ctx.offer(imag, "rope.imag", false)?, 0),
            queries: q_table.device_ptr(),
            keys: k_table.device_ptr(),
            n_tokens: queries.len(),
            shape,
        };
        self.launch("rope", || ctx.accelerator().rope(&launch))?;
        drop((q_table, k_table));

        for (t, (q, k)) in queries.iter_mut().zip(keys.iter_mut()).enumerate() {
            ctx.reclaim_tensor(&mut **q, &format!("rope.queries[{t}]"))?;
            ctx.reclaim_tensor(&mut **k, &format!("rope.keys[{t}]"))?;
        }
        Ok(())
    }
}
