//! Element-wise and reduction primitives on float tensors.
//!
//! These are the host reference implementations. Every method works on a
//! window `[offset, offset + size)` and panics on out-of-range windows the
//! same way slice indexing does. Mutating methods go through `&mut self`, so
//! they always leave the device copy marked stale.

use rayon::prelude::*;

use crate::tensor::FloatTensor;

/// Dot product of two equal-length slices.
#[inline]
pub fn dot_slices(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).fold(0.0f32, |acc, (x, y)| acc + x * y)
}

/// Numerically stable softmax over a slice, in place.
pub fn softmax_slice(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    for v in values.iter_mut() {
        *v = (*v - max).exp();
    }
    let sum: f32 = values.iter().sum();
    for v in values.iter_mut() {
        *v /= sum;
    }
}

/// `y[i] += a * x[i]`.
#[inline]
pub fn saxpy_slice(y: &mut [f32], x: &[f32], a: f32) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += a * xi;
    }
}

impl FloatTensor {
    /// Fold `size` elements starting at `offset` into `seed`.
    pub fn reduce<F>(&self, offset: usize, size: usize, seed: f32, combine: F) -> f32
    where
        F: Fn(f32, f32) -> f32,
    {
        self.as_slice()[offset..offset + size]
            .iter()
            .fold(seed, |acc, &v| combine(acc, v))
    }

    /// Sum of a window.
    pub fn sum(&self, offset: usize, size: usize) -> f32 {
        self.reduce(offset, size, 0.0, |a, b| a + b)
    }

    /// Maximum of a window, `-inf` when empty.
    pub fn max(&self, offset: usize, size: usize) -> f32 {
        self.reduce(offset, size, f32::NEG_INFINITY, f32::max)
    }

    /// Absolute index of the first maximum in a window.
    pub fn argmax(&self, offset: usize, size: usize) -> Option<usize> {
        let window = &self.as_slice()[offset..offset + size];
        let mut best: Option<(usize, f32)> = None;
        for (i, &v) in window.iter().enumerate() {
            match best {
                Some((_, b)) if v <= b => {}
                _ => best = Some((offset + i, v)),
            }
        }
        best.map(|(i, _)| i)
    }

    /// Replace each element of a window with `f(value)`.
    pub fn map_in_place<F>(&mut self, offset: usize, size: usize, f: F) -> &mut Self
    where
        F: Fn(f32) -> f32,
    {
        for v in &mut self.as_mut_slice()[offset..offset + size] {
            *v = f(*v);
        }
        self
    }

    /// Replace each element of a window with `f(value, absolute_index)`.
    pub fn map_with_index_in_place<F>(&mut self, offset: usize, size: usize, f: F) -> &mut Self
    where
        F: Fn(f32, usize) -> f32,
    {
        for (i, v) in self.as_mut_slice()[offset..offset + size]
            .iter_mut()
            .enumerate()
        {
            *v = f(*v, offset + i);
        }
        self
    }

    /// Set every element of a window to `value`.
    pub fn fill_in_place(&mut self, offset: usize, size: usize, value: f32) -> &mut Self {
        self.as_mut_slice()[offset..offset + size].fill(value);
        self
    }

    /// `self[offset + i] += that[that_offset + i]`.
    pub fn add_in_place(
        &mut self,
        offset: usize,
        that: &FloatTensor,
        that_offset: usize,
        size: usize,
    ) -> &mut Self {
        let src = &that.as_slice()[that_offset..that_offset + size];
        for (v, s) in self.as_mut_slice()[offset..offset + size].iter_mut().zip(src) {
            *v += s;
        }
        self
    }

    /// `self[offset + i] *= that[that_offset + i]`.
    pub fn multiply_in_place(
        &mut self,
        offset: usize,
        that: &FloatTensor,
        that_offset: usize,
        size: usize,
    ) -> &mut Self {
        let src = &that.as_slice()[that_offset..that_offset + size];
        for (v, s) in self.as_mut_slice()[offset..offset + size].iter_mut().zip(src) {
            *v *= s;
        }
        self
    }

    /// Divide a window by a scalar.
    pub fn divide_in_place(&mut self, offset: usize, size: usize, value: f32) -> &mut Self {
        self.map_in_place(offset, size, |v| v / value)
    }

    /// Copy a window of this tensor into `that`.
    pub fn copy_to(&self, offset: usize, that: &mut FloatTensor, that_offset: usize, size: usize) {
        that.as_mut_slice()[that_offset..that_offset + size]
            .copy_from_slice(&self.as_slice()[offset..offset + size]);
    }

    /// Dot product of a window of this tensor with a window of `that`.
    pub fn dot(&self, offset: usize, that: &FloatTensor, that_offset: usize, size: usize) -> f32 {
        dot_slices(
            &self.as_slice()[offset..offset + size],
            &that.as_slice()[that_offset..that_offset + size],
        )
    }

    /// Max-subtract, exponentiate, normalize.
    pub fn softmax_in_place(&mut self, offset: usize, size: usize) -> &mut Self {
        softmax_slice(&mut self.as_mut_slice()[offset..offset + size]);
        self
    }

    /// `self[offset + i] += a * that[that_offset + i]`.
    pub fn saxpy_in_place(
        &mut self,
        offset: usize,
        that: &FloatTensor,
        that_offset: usize,
        size: usize,
        a: f32,
    ) -> &mut Self {
        saxpy_slice(
            &mut self.as_mut_slice()[offset..offset + size],
            &that.as_slice()[that_offset..that_offset + size],
            a,
        );
        self
    }

    /// Cosine similarity over the full length of `self`.
    pub fn cosine_similarity(&self, that: &FloatTensor) -> f32 {
        let n = self.len();
        let dot = self.dot(0, that, 0, n);
        let (a_norm, b_norm) = self.as_slice()[..n]
            .par_iter()
            .zip(&that.as_slice()[..n])
            .map(|(&a, &b)| ((a * a) as f64, (b * b) as f64))
            .reduce(|| (0.0, 0.0), |x, y| (x.0 + y.0, x.1 + y.1));
        dot / (a_norm.sqrt() as f32 * b_norm.sqrt() as f32)
    }
}
