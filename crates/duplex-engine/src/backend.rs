//! Compute backends.
//!
//! Every numeric operation has a host implementation and an accelerator
//! implementation that must agree within a tolerance. [`ComputeBackend`] is
//! the seam between them; callers pick one at construction and never branch
//! on it again.

use duplex_core::Result;
use duplex_metrics::time_kernel;
use duplex_tensor::kernels::{self, AttentionGeometry, RopeShape};
use duplex_tensor::FloatTensor;

/// A strategy for running the numeric kernels.
pub trait ComputeBackend: Send + Sync {
    /// Short name for logs and metric labels.
    fn name(&self) -> &'static str;

    /// `sum(a[a_offset + i] * b[b_offset + i])` for `i < size`.
    fn dot(
        &self,
        a: &FloatTensor,
        a_offset: usize,
        b: &FloatTensor,
        b_offset: usize,
        size: usize,
    ) -> Result<f32>;

    /// Softmax over `size` elements at `offset`, in place.
    fn softmax(&self, x: &mut FloatTensor, offset: usize, size: usize) -> Result<()>;

    /// Row RMS normalization scaled by `weight`.
    fn rmsnorm(
        &self,
        out: &mut FloatTensor,
        x: &FloatTensor,
        weight: &FloatTensor,
        size: usize,
        eps: f32,
    ) -> Result<()>;

    /// Attention scores for one head over the causal prefix.
    fn attention_scores(
        &self,
        att: &mut FloatTensor,
        query: &FloatTensor,
        key_cache: &FloatTensor,
        geometry: &AttentionGeometry,
    ) -> Result<()>;

    /// Weighted value accumulation for one head.
    fn weighted_sum(
        &self,
        out: &mut FloatTensor,
        att: &FloatTensor,
        value_cache: &FloatTensor,
        geometry: &AttentionGeometry,
    ) -> Result<()>;

    /// Matrix-vector multiply.
    fn matmul(
        &self,
        weights: &FloatTensor,
        input: &FloatTensor,
        out: &mut FloatTensor,
        dim0: usize,
        dim1: usize,
    ) -> Result<()>;

    /// One matrix against a batch of inputs.
    fn matmul_batched(
        &self,
        weights: &FloatTensor,
        inputs: &[&FloatTensor],
        outs: &mut [&mut FloatTensor],
        dim0: usize,
        dim1: usize,
    ) -> Result<()>;

    /// Rotary embedding for consecutive tokens; token `t` sits at
    /// `shape.position + t`.
    fn rope(
        &self,
        queries: &mut [&mut FloatTensor],
        keys: &mut [&mut FloatTensor],
        real: &FloatTensor,
        imag: &FloatTensor,
        shape: RopeShape,
    ) -> Result<()>;
}

/// Host loops from `duplex_tensor`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl CpuBackend {
    /// Create the host backend.
    pub fn new() -> Self {
        Self
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
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
        Ok(time_kernel!("dot", "cpu", a.dot(a_offset, b, b_offset, size)))
    }

    fn softmax(&self, x: &mut FloatTensor, offset: usize, size: usize) -> Result<()> {
        kernels::check_window("softmax input", x.len(), offset, size)?;
        time_kernel!("softmax", "cpu", x.softmax_in_place(offset, size));
        Ok(())
    }

    fn rmsnorm(
        &self,
        out: &mut FloatTensor,
        x: &FloatTensor,
        weight: &FloatTensor,
        size: usize,
        eps: f32,
    ) -> Result<()> {
        time_kernel!("rmsnorm", "cpu", kernels::rmsnorm(out, x, weight, size, eps))
    }

    fn attention_scores(
        &self,
        att: &mut FloatTensor,
        query: &FloatTensor,
        key_cache: &FloatTensor,
        geometry: &AttentionGeometry,
    ) -> Result<()> {
        time_kernel!(
            "attention_scores",
            "cpu",
            kernels::attention_scores(att, query, key_cache, geometry)
        )
    }

    fn weighted_sum(
        &self,
        out: &mut FloatTensor,
        att: &FloatTensor,
        value_cache: &FloatTensor,
        geometry: &AttentionGeometry,
    ) -> Result<()> {
        time_kernel!(
            "weighted_sum",
            "cpu",
            kernels::weighted_sum(out, att, value_cache, geometry)
        )
    }

    fn matmul(
        &self,
        weights: &FloatTensor,
        input: &FloatTensor,
        out: &mut FloatTensor,
        dim0: usize,
        dim1: usize,
    ) -> Result<()> {
        time_kernel!(
            "matmul",
            "cpu",
            kernels::matmul(weights, input, out, dim0, dim1)
        )
    }

    fn matmul_batched(
        &self,
        weights: &FloatTensor,
        inputs: &[&FloatTensor],
        outs: &mut [&mut FloatTensor],
        dim0: usize,
        dim1: usize,
    ) -> Result<()> {
        time_kernel!(
            "matmul_batched",
            "cpu",
            kernels::matmul_batched(weights, inputs, outs, dim0, dim1)
        )
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
        time_kernel!("rope", "cpu", {
            queries
                .iter_mut()
                .zip(keys.iter_mut())
                .enumerate()
                .try_for_each(|(t, (q, k))| kernels::apply_rope(q, k, real, imag, shape.advanced(t)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_dot_bounds() {
        let cpu = CpuBackend::new();
        let a = FloatTensor::from_slice(&[1.0, 2.0, 3.0]);
        let b = FloatTensor::from_slice(&[4.0, 5.0, 6.0]);
        assert_eq!(cpu.dot(&a, 1, &b, 0, 2).unwrap(), 2.0 * 4.0 + 3.0 * 5.0);
        assert_eq!(cpu.dot(&a, 2, &b, 0, 2).unwrap_err().error_code(), "TENSOR_ERROR");
    }

    #[test]
    fn test_cpu_softmax_window() {
        let cpu = CpuBackend::new();
        let mut x = FloatTensor::from_slice(&[5.0, 1.0, 1.0, 5.0]);
        cpu.softmax(&mut x, 1, 2).unwrap();
        assert_eq!(x.get(0), 5.0);
        assert!((x.get(1) - 0.5).abs() < 1e-6);
        assert!((x.get(2) - 0.5).abs() < 1e-6);
        assert_eq!(x.get(3), 5.0);
    }

    #[test]
    fn test_cpu_rope_batch_mismatch() {
        let cpu = CpuBackend::new();
        let (real, imag) = kernels::precompute_freqs_cis(4, 2, 10000.0).unwrap();
        let real = FloatTensor::from_vec(real);
        let imag = FloatTensor::from_vec(imag);
        let mut q = FloatTensor::zeros(2);
        let shape = RopeShape {
            position: 0,
            dim: 2,
            head_size: 2,
            kv_dim: 2,
        };
        let err = cpu.rope(&mut [&mut q], &mut [], &real, &imag, shape).unwrap_err();
        assert_eq!(err.error_code(), "TENSOR_ERROR");
    }
}
