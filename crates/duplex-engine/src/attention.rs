//! Multi-head attention for one decoding step.

use duplex_core::{Error, Result};
use duplex_tensor::kernels::AttentionGeometry;
use duplex_tensor::FloatTensor;

use crate::backend::ComputeBackend;

/// Head layout of an attention layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    /// Query heads.
    pub num_heads: usize,
    /// Key/value heads; divides `num_heads`.
    pub num_kv_heads: usize,
    /// Elements per head.
    pub head_size: usize,
    /// Maximum sequence length.
    pub context_length: usize,
}

impl AttentionShape {
    /// Query width.
    pub fn dim(&self) -> usize {
        self.num_heads * self.head_size
    }

    /// Key/value cache row width.
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_size
    }

    /// Query heads per key/value head.
    pub fn kv_mul(&self) -> usize {
        self.num_heads / self.num_kv_heads.max(1)
    }

    /// Elements of the score buffer (one row per head).
    pub fn scores_len(&self) -> usize {
        self.num_heads * self.context_length
    }

    /// Elements of one layer's key or value cache.
    pub fn cache_len(&self) -> usize {
        self.context_length * self.kv_dim()
    }

    /// Geometry of `head` at `position`.
    pub fn geometry(&self, head: usize, position: usize) -> AttentionGeometry {
        AttentionGeometry {
            head,
            head_size: self.head_size,
            num_heads: self.num_heads,
            context_length: self.context_length,
            kv_dim: self.kv_dim(),
            kv_mul: self.kv_mul(),
            position,
        }
    }

    /// Fails unless the head counts divide evenly.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.num_kv_heads == 0 || self.head_size == 0 {
            return Err(Error::tensor("attention dimensions must be non-zero"));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(Error::tensor(format!(
                "{} query heads cannot share {} key/value heads",
                self.num_heads, self.num_kv_heads
            )));
        }
        Ok(())
    }
}

/// Score every head against the cache and accumulate values into `out`.
///
/// `att` holds one score row per head and `out` receives one head-sized slice
/// per head. The caches must already contain the row for `position`.
#[allow(clippy::too_many_arguments)]
pub fn attend(
    backend: &dyn ComputeBackend,
    shape: &AttentionShape,
    position: usize,
    query: &FloatTensor,
    key_cache: &FloatTensor,
    value_cache: &FloatTensor,
    att: &mut FloatTensor,
    out: &mut FloatTensor,
) -> Result<()> {
    shape.validate()?;
    for head in 0..shape.num_heads {
        let geometry = shape.geometry(head, position);
        backend.attention_scores(att, query, key_cache, &geometry)?;
        backend.weighted_sum(out, att, value_cache, &geometry)?;
    }
    Ok(())
}
