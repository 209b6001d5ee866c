//! Rotary position embedding driver.

use duplex_core::Result;
use duplex_tensor::kernels::{self, RopeScaling, RopeShape};
use duplex_tensor::FloatTensor;

use crate::backend::ComputeBackend;

/// Precomputed rotary tables for one model.
#[derive(Debug)]
pub struct RotaryEmbedding {
    real: FloatTensor,
    imag: FloatTensor,
    head_size: usize,
    context_length: usize,
}

impl RotaryEmbedding {
    /// Unscaled tables.
    pub fn new(context_length: usize, head_size: usize, theta: f64) -> Result<Self> {
        let (real, imag) = kernels::precompute_freqs_cis(context_length, head_size, theta)?;
        Ok(Self::from_tables(real, imag, head_size, context_length))
    }

    /// Tables with Llama 3.1 frequency scaling.
    pub fn scaled(
        context_length: usize,
        head_size: usize,
        theta: f64,
        scaling: &RopeScaling,
    ) -> Result<Self> {
        let (real, imag) =
            kernels::precompute_freqs_cis_scaled(context_length, head_size, theta, scaling)?;
        Ok(Self::from_tables(real, imag, head_size, context_length))
    }

    fn from_tables(real: Vec<f32>, imag: Vec<f32>, head_size: usize, context_length: usize) -> Self {
        Self {
            real: FloatTensor::from_vec_immutable(real),
            imag: FloatTensor::from_vec_immutable(imag),
            head_size,
            context_length,
        }
    }

    /// Cosine table.
    pub fn real(&self) -> &FloatTensor {
        &self.real
    }

    /// Sine table.
    pub fn imag(&self) -> &FloatTensor {
        &self.imag
    }

    /// Positions covered by the tables.
    pub fn context_length(&self) -> usize {
        self.context_length
    }

    /// Rotate a batch of consecutive tokens starting at `position`.
    pub fn apply(
        &self,
        backend: &dyn ComputeBackend,
        queries: &mut [&mut FloatTensor],
        keys: &mut [&mut FloatTensor],
        position: usize,
        dim: usize,
        kv_dim: usize,
    ) -> Result<()> {
        let shape = RopeShape {
            position,
            dim,
            head_size: self.head_size,
            kv_dim,
        };
        backend.rope(queries, keys, &self.real, &self.imag, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    #[test]
    fn test_rotation_preserves_norm() {
        let rope = RotaryEmbedding::new(16, 4, 10000.0).unwrap();
        let mut q = FloatTensor::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let mut k = FloatTensor::from_slice(&[1.0, 1.0, 1.0, 1.0]);
        let norm = |t: &FloatTensor| t.as_slice().iter().map(|v| v * v).sum::<f32>();
        let (nq, nk) = (norm(&q), norm(&k));

        rope.apply(&CpuBackend, &mut [&mut q], &mut [&mut k], 5, 8, 4)
            .unwrap();
        assert!((norm(&q) - nq).abs() < 1e-4);
        assert!((norm(&k) - nk).abs() < 1e-4);
    }

    #[test]
    fn test_position_beyond_tables() {
        let rope = RotaryEmbedding::new(4, 2, 10000.0).unwrap();
        let mut q = FloatTensor::zeros(2);
        let mut k = FloatTensor::zeros(2);
        assert!(rope
            .apply(&CpuBackend, &mut [&mut q], &mut [&mut k], 4, 2, 2)
            .is_err());
    }

    #[test]
    fn test_scaled_tables_cover_context() {
        let rope = RotaryEmbedding::scaled(32, 8, 500000.0, &RopeScaling::default()).unwrap();
        assert_eq!(rope.real().len(), 32 * 4);
        assert_eq!(rope.imag().len(), 32 * 4);
        assert_eq!(rope.context_length(), 32);
    }
}
