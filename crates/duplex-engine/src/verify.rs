//! Cross-checking backend.
//!
//! Runs every kernel on the accelerator and again on the host, compares the
//! outputs and keeps the accelerator's. Disagreements beyond the tolerance
//! are logged and counted; they never fail the call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use duplex_core::Result;
use duplex_tensor::kernels::{AttentionGeometry, RopeShape};
use duplex_tensor::{DeviceContext, FloatTensor};

use crate::accelerated::AcceleratorBackend;
use crate::backend::{ComputeBackend, CpuBackend};

/// Largest deviation between two results and where it occurred.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deviation {
    /// Index of the worst element.
    pub index: usize,
    /// Accelerator value.
    pub actual: f32,
    /// Host value.
    pub expected: f32,
}

impl Deviation {
    /// Absolute difference.
    pub fn abs(&self) -> f32 {
        (self.actual - self.expected).abs()
    }
}

/// Whether `actual` is within `tolerance` of `expected`, absolute for small
/// magnitudes and relative above one.
pub fn within_tolerance(actual: f32, expected: f32, tolerance: f32) -> bool {
    if actual.is_nan() || expected.is_nan() {
        return actual.is_nan() && expected.is_nan();
    }
    (actual - expected).abs() <= tolerance * expected.abs().max(1.0)
}

/// The element that fails the tolerance by the widest margin.
pub fn worst_deviation(actual: &[f32], expected: &[f32], tolerance: f32) -> Option<Deviation> {
    actual
        .iter()
        .zip(expected)
        .enumerate()
        .filter(|(_, (&a, &e))| !within_tolerance(a, e, tolerance))
        .map(|(index, (&actual, &expected))| Deviation {
            index,
            actual,
            expected,
        })
        .max_by(|x, y| x.abs().total_cmp(&y.abs()))
}

/// Accelerator results checked against the host kernels.
#[derive(Debug)]
pub struct VerifyingBackend {
    device: AcceleratorBackend,
    host: CpuBackend,
    tolerance: f32,
    checks: AtomicU64,
    mismatches: AtomicU64,
}

impl VerifyingBackend {
    /// Verify `ctx`'s accelerator with `tolerance`.
    pub fn new(ctx: Arc<DeviceContext>, tolerance: f32) -> Self {
        Self {
            device: AcceleratorBackend::new(ctx),
            host: CpuBackend::new(),
            tolerance,
            checks: AtomicU64::new(0),
            mismatches: AtomicU64::new(0),
        }
    }

    /// Tolerance in use.
    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    /// Comparisons made so far.
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    /// Comparisons that exceeded the tolerance.
    pub fn mismatches(&self) -> u64 {
        self.mismatches.load(Ordering::Relaxed)
    }

    fn compare(&self, kernel: &str, actual: &[f32], expected: &[f32]) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let deviation = worst_deviation(actual, expected, self.tolerance);
        if let Some(d) = deviation {
            self.mismatches.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{} mismatch at {}: accelerator {} vs host {} (tolerance {})",
                kernel, d.index, d.actual, d.expected, self.tolerance
            );
        }
        if let Ok(m) = duplex_metrics::metrics() {
            m.record_verification(kernel, deviation.is_none());
        }
    }
}

impl ComputeBackend for VerifyingBackend {
    fn name(&self) -> &'static str {
        "verify"
    }

    fn dot(
        &self,
        a: &FloatTensor,
        a_offset: usize,
        b: &FloatTensor,
        b_offset: usize,
        size: usize,
    ) -> Result<f32> {
        let expected = self.host.dot(a, a_offset, b, b_offset, size)?;
        let actual = self.device.dot(a, a_offset, b, b_offset, size)?;
        self.compare("dot", &[actual], &[expected]);
        Ok(actual)
    }

    fn softmax(&self, x: &mut FloatTensor, offset: usize, size: usize) -> Result<()> {
        let mut expected = x.clone();
        self.host.softmax(&mut expected, offset, size)?;
        self.device.softmax(x, offset, size)?;
        self.compare("softmax", x.as_slice(), expected.as_slice());
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
        let mut expected = out.clone();
        self.host.rmsnorm(&mut expected, x, weight, size, eps)?;
        self.device.rmsnorm(out, x, weight, size, eps)?;
        self.compare("rmsnorm", out.as_slice(), expected.as_slice());
        Ok(())
    }

    fn attention_scores(
        &self,
        att: &mut FloatTensor,
        query: &FloatTensor,
        key_cache: &FloatTensor,
        geometry: &AttentionGeometry,
    ) -> Result<()> {
        let mut expected = att.clone();
        self.host
            .attention_scores(&mut expected, query, key_cache, geometry)?;
        self.device
            .attention_scores(att, query, key_cache, geometry)?;
        self.compare("attention_scores", att.as_slice(), expected.as_slice());
        Ok(())
    }

    fn weighted_sum(
        &self,
        out: &mut FloatTensor,
        att: &FloatTensor,
        value_cache: &FloatTensor,
        geometry: &AttentionGeometry,
    ) -> Result<()> {
        let mut expected = out.clone();
        self.host
            .weighted_sum(&mut expected, att, value_cache, geometry)?;
        self.device.weighted_sum(out, att, value_cache, geometry)?;
        self.compare("weighted_sum", out.as_slice(), expected.as_slice());
        Ok(())
    }

    fn matmul(
        &self,
        weights: &FloatTensor,
        input: &FloatTensor,
        out: &mut FloatTensor,
        dim0: usize,
        dim1: usize,
    ) -> Result<()> {
        let mut expected = out.clone();
        self.host.matmul(weights, input, &mut expected, dim0, dim1)?;
        self.device.matmul(weights, input, out, dim0, dim1)?;
        self.compare("matmul", out.as_slice(), expected.as_slice());
        Ok(())
    }

    fn matmul_batched(
        &self,
        weights: &FloatTensor,
        inputs: &[&FloatTensor],
        outs: &mut [&mut FloatTensor],
        dim0: usize,
        dim1: usize,
    ) -> Result<()> {
        let mut expected: Vec<FloatTensor> = outs.iter().map(|o| (**o).clone()).collect();
        {
            let mut refs: Vec<&mut FloatTensor> = expected.iter_mut().collect();
            self.host
                .matmul_batched(weights, inputs, &mut refs, dim0, dim1)?;
        }
        self.device
            .matmul_batched(weights, inputs, outs, dim0, dim1)?;
        for (out, want) in outs.iter().zip(&expected) {
            self.compare("matmul_batched", out.as_slice(), want.as_slice());
        }
        Ok(())
    }

    fn rope(
        &self,
        queries: &mut [&mut FloatTensor],
        keys: &mut [&mut FloatTensor],
        real: &FloatTensor,
        imag: &FloatTensor,
        shape: RopeShape,
    ) -> Result<()> {
        let mut want_q: Vec<FloatTensor> = queries.iter().map(|q| (**q).clone()).collect();
        let mut want_k: Vec<FloatTensor> = keys.iter().map(|k| (**k).clone()).collect();
        {
            let mut q_refs: Vec<&mut FloatTensor> = want_q.iter_mut().collect();
            let mut k_refs: Vec<&mut FloatTensor> = want_k.iter_mut().collect();
            self.host
                .rope(&mut q_refs, &mut k_refs, real, imag, shape)?;
        }
        self.device.rope(queries, keys, real, imag, shape)?;
        for (q, want) in queries.iter().zip(&want_q) {
            self.compare("rope", q.as_slice(), want.as_slice());
        }
        for (k, want) in keys.iter().zip(&want_k) {
            self.compare("rope", k.as_slice(), want.as_slice());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_tensor::SimulatedAccelerator;

    #[test]
    fn test_tolerance_is_relative_above_one() {
        assert!(within_tolerance(1000.0, 1000.005, 1e-5));
        assert!(!within_tolerance(1.0, 1.001, 1e-5));
        assert!(within_tolerance(0.0, 5e-6, 1e-5));
        assert!(within_tolerance(f32::NAN, f32::NAN, 1e-5));
        assert!(!within_tolerance(f32::NAN, 0.0, 1e-5));
    }

    #[test]
    fn test_worst_deviation() {
        let actual = [1.0, 2.5, 3.0, 7.0];
        let expected = [1.0, 2.0, 3.0, 4.0];
        let worst = worst_deviation(&actual, &expected, 1e-5).unwrap();
        assert_eq!(worst.index, 3);
        assert_eq!(worst.abs(), 3.0);
        assert!(worst_deviation(&expected, &expected, 1e-5).is_none());
    }

    #[test]
    fn test_simulated_device_matches_host() {
        let ctx = DeviceContext::with_defaults(Arc::new(SimulatedAccelerator::new(16 << 20)));
        let backend = VerifyingBackend::new(ctx, 1e-5);

        let weights = FloatTensor::from_vec((0..24).map(|i| i as f32 * 0.1).collect());
        let input = FloatTensor::from_vec((0..6).map(|i| 1.0 - i as f32 * 0.3).collect());
        let mut out = FloatTensor::zeros(4);
        backend.matmul(&weights, &input, &mut out, 4, 6).unwrap();
        backend.softmax(&mut out, 0, 4).unwrap();
        backend.dot(&out, 0, &input, 0, 4).unwrap();

        assert_eq!(backend.checks(), 3);
        assert_eq!(backend.mismatches(), 0);
    }
}
