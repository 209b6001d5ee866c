//! Host implementations of the transformer kernels.
//!
//! These are both the compute path when no accelerator is present and the
//! oracle accelerator results are checked against, so the arithmetic order
//! here is the reference order.

use tracing::instrument;

use duplex_core::{Error, Result};

use crate::ops::{dot_slices, saxpy_slice, softmax_slice};
use crate::parallel::{parallel_fill, parallel_fill_batched};
use crate::tensor::FloatTensor;

/// Shape of one attention head's work at a given position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionGeometry {
    /// Head being scored.
    pub head: usize,
    /// Elements per head.
    pub head_size: usize,
    /// Query heads.
    pub num_heads: usize,
    /// Maximum sequence length (row stride of the score buffer).
    pub context_length: usize,
    /// Width of one key/value cache row.
    pub kv_dim: usize,
    /// Query heads sharing one key/value head.
    pub kv_mul: usize,
    /// Current position; the causal prefix is `0..=position`.
    pub position: usize,
}

impl AttentionGeometry {
    /// Offset of this head inside the query and output vectors.
    pub fn query_offset(&self) -> usize {
        self.head * self.head_size
    }

    /// Offset of this head's row in the score buffer.
    pub fn att_offset(&self) -> usize {
        self.head * self.context_length
    }

    /// Offset of this head's slice in cache row `t`.
    pub fn cache_offset(&self, t: usize) -> usize {
        t * self.kv_dim + (self.head / self.kv_mul.max(1)) * self.head_size
    }

    /// Length of the causal prefix.
    pub fn prefix_len(&self) -> usize {
        self.position + 1
    }

    /// Fails unless the head and position fit the dimensions.
    pub fn validate(&self) -> Result<()> {
        if self.head_size == 0 || self.kv_mul == 0 {
            return Err(Error::tensor("head_size and kv_mul must be non-zero"));
        }
        if self.head >= self.num_heads {
            return Err(Error::tensor(format!(
                "head {} out of range for {} heads",
                self.head, self.num_heads
            )));
        }
        if self.position >= self.context_length {
            return Err(Error::tensor(format!(
                "position {} beyond context length {}",
                self.position, self.context_length
            )));
        }
        Ok(())
    }
}

/// Llama 3.1 rotary frequency scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeScaling {
    /// Divisor applied to low frequencies.
    pub factor: f32,
    /// Low frequency factor.
    pub low_freq_factor: f32,
    /// High frequency factor.
    pub high_freq_factor: f32,
    /// Context length the model was trained on.
    pub original_context_length: f32,
}

impl Default for RopeScaling {
    fn default() -> Self {
        Self {
            factor: 8.0,
            low_freq_factor: 1.0,
            high_freq_factor: 4.0,
            original_context_length: 8192.0,
        }
    }
}

impl RopeScaling {
    fn scale(&self, freq: f32) -> f32 {
        let lo_wavelen = self.original_context_length / self.low_freq_factor;
        let hi_wavelen = self.original_context_length / self.high_freq_factor;
        let wavelen = (2.0 * std::f64::consts::PI / freq as f64) as f32;
        if wavelen < hi_wavelen {
            freq
        } else if wavelen > lo_wavelen {
            freq / self.factor
        } else {
            let smooth = (self.original_context_length / wavelen - self.low_freq_factor)
                / (self.high_freq_factor - self.low_freq_factor);
            (1.0 - smooth) * freq / self.factor + smooth * freq
        }
    }
}

pub(crate) fn check_len(what: &str, actual: usize, needed: usize) -> Result<()> {
    if actual < needed {
        return Err(Error::length_mismatch(
            format!("{what} is too short"),
            needed,
            actual,
        ));
    }
    Ok(())
}

/// Fails unless `offset..offset + size` lies within `len` elements.
pub fn check_window(what: &str, len: usize, offset: usize, size: usize) -> Result<()> {
    let end = offset
        .checked_add(size)
        .ok_or_else(|| Error::tensor(format!("{what} window overflows")))?;
    check_len(what, len, end)
}

/// Fails unless two halves of a batch have the same length.
pub fn check_batch(what: &str, left: usize, right: usize) -> Result<()> {
    if left != right {
        return Err(Error::length_mismatch(
            format!("{what} needs matching batch lengths"),
            left,
            right,
        ));
    }
    Ok(())
}

/// `out[i] = weight[i] * x[i] / sqrt(mean(x^2) + eps)` over the first `size`
/// elements.
#[instrument(skip_all, level = "trace")]
pub fn rmsnorm(
    out: &mut FloatTensor,
    x: &FloatTensor,
    weight: &FloatTensor,
    size: usize,
    eps: f32,
) -> Result<()> {
    check_len("rmsnorm input", x.len(), size)?;
    check_len("rmsnorm weight", weight.len(), size)?;
    check_len("rmsnorm output", out.len(), size)?;

    rmsnorm_slices(
        &mut out.as_mut_slice()[..size],
        &x.as_slice()[..size],
        &weight.as_slice()[..size],
        eps,
    );
    Ok(())
}

pub(crate) fn rmsnorm_slices(out: &mut [f32], x: &[f32], weight: &[f32], eps: f32) {
    let mut ss = x.iter().fold(0.0f32, |acc, v| acc + v * v);
    ss /= x.len() as f32;
    ss += eps;
    let ss = (1.0 / (ss as f64).sqrt()) as f32;
    for ((o, xi), wi) in out.iter_mut().zip(x).zip(weight) {
        *o = wi * (ss * xi);
    }
}

/// Scaled dot product of one query head against the key cache over the causal
/// prefix, followed by softmax over that prefix.
#[instrument(skip_all, level = "trace")]
pub fn attention_scores(
    att: &mut FloatTensor,
    query: &FloatTensor,
    key_cache: &FloatTensor,
    geometry: &AttentionGeometry,
) -> Result<()> {
    geometry.validate()?;
    let g = geometry;
    let att_offset = g.att_offset();
    let q_offset = g.query_offset();
    check_len("attention buffer", att.len(), att_offset + g.prefix_len())?;
    check_len("query", query.len(), q_offset + g.head_size)?;
    check_len("key cache", key_cache.len(), g.cache_offset(g.position) + g.head_size)?;

    score_slices(
        &mut att.as_mut_slice()[att_offset..att_offset + g.prefix_len()],
        &query.as_slice()[q_offset..q_offset + g.head_size],
        key_cache.as_slice(),
        g,
    );
    Ok(())
}

/// `row` is the causal prefix of the score buffer, `q` one query head.
pub(crate) fn score_slices(row: &mut [f32], q: &[f32], keys: &[f32], g: &AttentionGeometry) {
    let scale = (g.head_size as f64).sqrt() as f32;
    for (t, score) in row.iter_mut().enumerate() {
        let k_offset = g.cache_offset(t);
        *score = dot_slices(q, &keys[k_offset..k_offset + g.head_size]) / scale;
    }
    softmax_slice(row);
}

/// Accumulate value cache rows weighted by the attention scores into this
/// head's slice of `out`.
#[instrument(skip_all, level = "trace")]
pub fn weighted_sum(
    out: &mut FloatTensor,
    att: &FloatTensor,
    value_cache: &FloatTensor,
    geometry: &AttentionGeometry,
) -> Result<()> {
    geometry.validate()?;
    let g = geometry;
    let att_offset = g.att_offset();
    let out_offset = g.query_offset();
    check_len("attention buffer", att.len(), att_offset + g.prefix_len())?;
    check_len("output", out.len(), out_offset + g.head_size)?;
    check_len("value cache", value_cache.len(), g.cache_offset(g.position) + g.head_size)?;

    weighted_slices(
        &mut out.as_mut_slice()[out_offset..out_offset + g.head_size],
        &att.as_slice()[att_offset..att_offset + g.prefix_len()],
        value_cache.as_slice(),
        g,
    );
    Ok(())
}

pub(crate) fn weighted_slices(
    xb: &mut [f32],
    scores: &[f32],
    values: &[f32],
    g: &AttentionGeometry,
) {
    xb.fill(0.0);
    for (t, &a) in scores.iter().enumerate() {
        let v_offset = g.cache_offset(t);
        saxpy_slice(xb, &values[v_offset..v_offset + g.head_size], a);
    }
}

/// `out[i] = dot(weights[i * dim1..], input[..dim1])` for `i < dim0`, one
/// parallel task per output row.
#[instrument(skip_all, level = "trace")]
pub fn matmul(
    weights: &FloatTensor,
    input: &FloatTensor,
    out: &mut FloatTensor,
    dim0: usize,
    dim1: usize,
) -> Result<()> {
    check_len("matmul weights", weights.len(), dim0 * dim1)?;
    check_len("matmul input", input.len(), dim1)?;
    check_len("matmul output", out.len(), dim0)?;

    let (w, x) = (weights.as_slice(), &input.as_slice()[..dim1]);
    parallel_fill(&mut out.as_mut_slice()[..dim0], |i| {
        dot_slices(&w[i * dim1..(i + 1) * dim1], x)
    });
    Ok(())
}

/// [`matmul`] of one weight matrix against a batch of independent inputs,
/// parallel over the flattened (batch, row) pairs.
#[instrument(skip_all, level = "trace")]
pub fn matmul_batched(
    weights: &FloatTensor,
    inputs: &[&FloatTensor],
    outs: &mut [&mut FloatTensor],
    dim0: usize,
    dim1: usize,
) -> Result<()> {
    check_batch("batched matmul", inputs.len(), outs.len())?;
    check_len("matmul weights", weights.len(), dim0 * dim1)?;
    for (input, out) in inputs.iter().zip(outs.iter()) {
        check_len("matmul input", input.len(), dim1)?;
        check_len("matmul output", out.len(), dim0)?;
    }

    let w = weights.as_slice();
    let mut rows: Vec<&mut [f32]> = outs
        .iter_mut()
        .map(|out| &mut out.as_mut_slice()[..dim0])
        .collect();
    parallel_fill_batched(&mut rows, |b, i| {
        dot_slices(&w[i * dim1..(i + 1) * dim1], &inputs[b].as_slice()[..dim1])
    });
    Ok(())
}

fn freqs_cis(
    context_length: usize,
    head_size: usize,
    theta: f64,
    scaling: Option<&RopeScaling>,
) -> Result<(Vec<f32>, Vec<f32>)> {
    if head_size == 0 || head_size % 2 != 0 {
        return Err(Error::tensor(format!(
            "rotary head size must be even, got {head_size}"
        )));
    }
    let half = head_size / 2;
    let freqs: Vec<f32> = (0..head_size)
        .step_by(2)
        .map(|i| {
            let freq = (1.0 / theta.powf(i as f64 / head_size as f64)) as f32;
            scaling.map_or(freq, |s| s.scale(freq))
        })
        .collect();

    let mut real = Vec::with_capacity(context_length * half);
    let mut imag = Vec::with_capacity(context_length * half);
    for pos in 0..context_length {
        for &freq in &freqs {
            let val = pos as f32 * freq;
            real.push(val.cos());
            imag.push(val.sin());
        }
    }
    Ok((real, imag))
}

/// Rotary embedding tables `(cos, sin)`, `context_length * head_size / 2`
/// entries each.
pub fn precompute_freqs_cis(
    context_length: usize,
    head_size: usize,
    theta: f64,
) -> Result<(Vec<f32>, Vec<f32>)> {
    freqs_cis(context_length, head_size, theta, None)
}

/// [`precompute_freqs_cis`] with Llama 3.1 frequency scaling.
pub fn precompute_freqs_cis_scaled(
    context_length: usize,
    head_size: usize,
    theta: f64,
    scaling: &RopeScaling,
) -> Result<(Vec<f32>, Vec<f32>)> {
    freqs_cis(context_length, head_size, theta, Some(scaling))
}

/// Dimensions of one rotary embedding step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RopeShape {
    /// Token position.
    pub position: usize,
    /// Query width.
    pub dim: usize,
    /// Elements per head.
    pub head_size: usize,
    /// Key width; only the first `kv_dim` key elements rotate.
    pub kv_dim: usize,
}

impl RopeShape {
    /// The same shape shifted `tokens` positions ahead.
    pub fn advanced(self, tokens: usize) -> Self {
        Self {
            position: self.position + tokens,
            ..self
        }
    }

    /// Rotary table entries needed to reach this position.
    pub fn table_len(&self) -> usize {
        (self.position + 1) * (self.head_size / 2)
    }

    /// Fails unless the dims are even, `kv_dim <= dim` and a table of
    /// `table_len` covers this position.
    pub fn validate(&self, table_len: usize) -> Result<()> {
        if self.head_size == 0 || self.head_size % 2 != 0 || self.dim % 2 != 0 {
            return Err(Error::tensor(format!(
                "rotary dims must be even, got head_size {} and dim {}",
                self.head_size, self.dim
            )));
        }
        if self.kv_dim % 2 != 0 || self.kv_dim > self.dim {
            return Err(Error::tensor(format!(
                "rotary kv_dim must be even and at most dim {}, got {}",
                self.dim, self.kv_dim
            )));
        }
        check_len("rope table", table_len, self.table_len())
    }
}

/// Rotate query and key pairs in place for one token.
///
/// Pairs with `i < kv_dim` rotate both vectors; the rest only the query.
#[instrument(skip_all, level = "trace")]
pub fn apply_rope(
    query: &mut FloatTensor,
    key: &mut FloatTensor,
    real: &FloatTensor,
    imag: &FloatTensor,
    shape: RopeShape,
) -> Result<()> {
    shape.validate(real.len().min(imag.len()))?;
    check_len("rope query", query.len(), shape.dim)?;
    check_len("rope key", key.len(), shape.kv_dim)?;

    rope_slices(
        query.as_mut_slice(),
        key.as_mut_slice(),
        real.as_slice(),
        imag.as_slice(),
        shape,
    );
    Ok(())
}

pub(crate) fn rope_slices(q: &mut [f32], k: &mut [f32], fr: &[f32], fi: &[f32], shape: RopeShape) {
    let RopeShape {
        position,
        dim,
        head_size,
        kv_dim,
    } = shape;
    let half = head_size / 2;
    for i in (0..dim).step_by(2) {
        let head_dim = i % head_size;
        let index = position * half + head_dim / 2;
        let (fcr, fci) = (fr[index], fi[index]);
        rotate_pair(q, i, fcr, fci);
        if i < kv_dim {
            rotate_pair(k, i, fcr, fci);
        }
    }
}

#[inline]
fn rotate_pair(v: &mut [f32], i: usize, fcr: f32, fci: f32) {
    let (v0, v1) = (v[i], v[i + 1]);
    v[i] = v0 * fcr - v1 * fci;
    v[i + 1] = v0 * fci + v1 * fcr;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(head: usize, position: usize) -> AttentionGeometry {
        AttentionGeometry {
            head,
            head_size: 2,
            num_heads: 2,
            context_length: 4,
            kv_dim: 2,
            kv_mul: 2,
            position,
        }
    }

    #[test]
    fn test_rmsnorm_unit_weights() {
        let x = FloatTensor::from_slice(&[3.0, 4.0]);
        let w = FloatTensor::from_slice(&[1.0, 2.0]);
        let mut out = FloatTensor::zeros(2);
        rmsnorm(&mut out, &x, &w, 2, 0.0).unwrap();
        let rms = (12.5f32).sqrt();
        assert!((out.get(0) - 3.0 / rms).abs() < 1e-6);
        assert!((out.get(1) - 8.0 / rms).abs() < 1e-6);
    }

    #[test]
    fn test_rmsnorm_rejects_short_weight() {
        let x = FloatTensor::zeros(4);
        let w = FloatTensor::zeros(3);
        let mut out = FloatTensor::zeros(4);
        let err = rmsnorm(&mut out, &x, &w, 4, 1e-5).unwrap_err();
        assert_eq!(err.error_code(), "TENSOR_ERROR");
    }

    #[test]
    fn test_attention_scores_softmax_over_prefix() {
        // Two query heads share one kv head (kv_mul = 2).
        let query = FloatTensor::from_slice(&[1.0, 0.0, 0.0, 1.0]);
        let keys = FloatTensor::from_slice(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 9.0, 9.0]);
        let mut att = FloatTensor::from_vec(vec![-1.0; 8]);

        attention_scores(&mut att, &query, &keys, &geometry(1, 2)).unwrap();
        let row = &att.as_slice()[4..7];
        let raw = [0.0f32, 1.0, 1.0].map(|s| s / 2f32.sqrt());
        let max = raw[1];
        let sum: f32 = raw.iter().map(|r| (r - max).exp()).sum();
        for (got, r) in row.iter().zip(raw) {
            assert!((got - (r - max).exp() / sum).abs() < 1e-6);
        }
        // Beyond the causal prefix and other heads are untouched.
        assert_eq!(att.get(7), -1.0);
        assert_eq!(att.get(0), -1.0);
    }

    #[test]
    fn test_attention_rejects_position_past_context() {
        let mut att = FloatTensor::zeros(8);
        let q = FloatTensor::zeros(4);
        let k = FloatTensor::zeros(8);
        assert!(attention_scores(&mut att, &q, &k, &geometry(0, 4)).is_err());
    }

    #[test]
    fn test_weighted_sum() {
        let att = FloatTensor::from_slice(&[0.25, 0.75, 0.0, 0.0]);
        let values = FloatTensor::from_slice(&[4.0, 8.0, 8.0, 4.0]);
        let mut out = FloatTensor::from_vec(vec![100.0; 4]);
        weighted_sum(&mut out, &att, &values, &geometry(0, 1)).unwrap();
        assert_eq!(&out.as_slice()[..2], &[7.0, 5.0]);
        assert_eq!(&out.as_slice()[2..], &[100.0, 100.0]);
    }

    #[test]
    fn test_matmul() {
        let w = FloatTensor::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let x = FloatTensor::from_slice(&[1.0, 0.0, -1.0]);
        let mut out = FloatTensor::zeros(2);
        matmul(&w, &x, &mut out, 2, 3).unwrap();
        assert_eq!(out.as_slice(), &[-2.0, -2.0]);
    }

    #[test]
    fn test_matmul_batched_matches_single() {
        let w = FloatTensor::from_vec((0..12).map(|v| v as f32 * 0.5).collect());
        let inputs = [
            FloatTensor::from_slice(&[1.0, 2.0, 3.0, 4.0]),
            FloatTensor::from_slice(&[-1.0, 0.5, 0.0, 2.0]),
        ];
        let mut expected = Vec::new();
        for input in &inputs {
            let mut out = FloatTensor::zeros(3);
            matmul(&w, input, &mut out, 3, 4).unwrap();
            expected.push(out);
        }

        let mut a = FloatTensor::zeros(3);
        let mut b = FloatTensor::zeros(3);
        {
            let refs: Vec<&FloatTensor> = inputs.iter().collect();
            let mut outs = [&mut a, &mut b];
            matmul_batched(&w, &refs, &mut outs, 3, 4).unwrap();
        }
        assert_eq!(a.as_slice(), expected[0].as_slice());
        assert_eq!(b.as_slice(), expected[1].as_slice());
    }

    #[test]
    fn test_matmul_batched_length_mismatch() {
        let w = FloatTensor::zeros(4);
        let x = FloatTensor::zeros(2);
        let mut outs: [&mut FloatTensor; 0] = [];
        assert!(matmul_batched(&w, &[&x], &mut outs, 2, 2).is_err());
    }

    #[test]
    fn test_freqs_cis_position_zero_is_identity() {
        let (real, imag) = precompute_freqs_cis(4, 8, 10000.0).unwrap();
        assert_eq!(real.len(), 16);
        assert!(real[..4].iter().all(|&c| c == 1.0));
        assert!(imag[..4].iter().all(|&s| s == 0.0));
        assert!(precompute_freqs_cis(4, 7, 10000.0).is_err());
    }

    #[test]
    fn test_scaled_freqs_keep_high_frequencies() {
        let scaling = RopeScaling::default();
        let (plain_re, plain_im) = precompute_freqs_cis(2, 64, 500000.0).unwrap();
        let (scaled_re, scaled_im) =
            precompute_freqs_cis_scaled(2, 64, 500000.0, &scaling).unwrap();
        // Position 1: the first pair has the shortest wavelength and is unscaled.
        assert_eq!(plain_re[32], scaled_re[32]);
        assert_eq!(plain_im[32], scaled_im[32]);
        // The last pair has the longest wavelength and is divided by the factor
        // (sin x ~ x at this angle).
        let expected = plain_im[63] / scaling.factor;
        assert!((scaled_im[63] - expected).abs() < 1e-3 * expected);
    }

    #[test]
    fn test_apply_rope_rotates_key_only_within_kv_dim() {
        let (real, imag) = precompute_freqs_cis(2, 2, 10000.0).unwrap();
        let real = FloatTensor::from_vec(real);
        let imag = FloatTensor::from_vec(imag);
        let mut q = FloatTensor::from_slice(&[1.0, 0.0, 1.0, 0.0]);
        let mut k = FloatTensor::from_slice(&[1.0, 0.0]);
        let shape = RopeShape {
            position: 1,
            dim: 4,
            head_size: 2,
            kv_dim: 2,
        };
        apply_rope(&mut q, &mut k, &real, &imag, shape).unwrap();
        let (c, s) = (1f32.cos(), 1f32.sin());
        assert!((q.get(0) - c).abs() < 1e-6 && (q.get(1) - s).abs() < 1e-6);
        assert!((q.get(2) - c).abs() < 1e-6 && (q.get(3) - s).abs() < 1e-6);
        assert!((k.get(0) - c).abs() < 1e-6 && (k.get(1) - s).abs() < 1e-6);
    }

    #[test]
    fn test_apply_rope_rejects_bad_kv_dim() {
        let (real, imag) = precompute_freqs_cis(2, 2, 10000.0).unwrap();
        let real = FloatTensor::from_vec(real);
        let imag = FloatTensor::from_vec(imag);
        let mut q = FloatTensor::zeros(4);

        let odd = RopeShape {
            position: 1,
            dim: 4,
            head_size: 2,
            kv_dim: 3,
        };
        let mut k = FloatTensor::zeros(3);
        assert!(apply_rope(&mut q, &mut k, &real, &imag, odd).is_err());

        let wide = RopeShape { kv_dim: 6, ..odd };
        let mut k = FloatTensor::zeros(6);
        assert!(apply_rope(&mut q, &mut k, &real, &imag, wide).is_err());
    }
}
