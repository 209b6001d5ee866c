//! The foreign-call boundary to the accelerator.
//!
//! Everything crossing this boundary is a raw device address plus element
//! offsets and counts. Calls are synchronous: they complete or return an
//! error, and nothing here retries.

mod native;
mod simulated;

pub use native::NativeAccelerator;
pub use simulated::{SimulatedAccelerator, SimulatedStats};

pub use crate::kernels::{AttentionGeometry, RopeShape};

use duplex_core::{DevicePtr, ElementKind, FormatDescriptor, MemInfo, Result};

/// A tensor argument to a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelOperand {
    /// Base device address.
    pub ptr: DevicePtr,
    /// Element offset from `ptr`.
    pub offset: usize,
    /// Element layout.
    pub format: FormatDescriptor,
}

impl KernelOperand {
    /// Dense f32 operand.
    pub fn f32(ptr: DevicePtr, offset: usize) -> Self {
        Self {
            ptr,
            offset,
            format: F32_FORMAT,
        }
    }

    /// Whether the operand is dense f32.
    pub fn is_f32(&self) -> bool {
        self.format == F32_FORMAT
    }
}

pub(crate) const F32_FORMAT: FormatDescriptor = match ElementKind::F32.format() {
    Some(format) => format,
    None => FormatDescriptor::dense(5, 4),
};

/// `out[..size] = rmsnorm(x[..size]) * weight[..size]`.
#[derive(Debug, Clone, Copy)]
pub struct RmsNormLaunch {
    /// Input.
    pub x: KernelOperand,
    /// Per-element weights.
    pub weight: KernelOperand,
    /// Output buffer (element offset 0).
    pub out: DevicePtr,
    /// Elements to normalize.
    pub size: usize,
    /// Epsilon added to the mean square.
    pub eps: f32,
}

/// Attention scores for one head over the causal prefix.
#[derive(Debug, Clone, Copy)]
pub struct ScoreLaunch {
    /// Query vector; `offset` selects the head.
    pub query: KernelOperand,
    /// Key cache of one layer.
    pub key_cache: KernelOperand,
    /// Score buffer.
    pub att: DevicePtr,
    /// Element offset of this head's score row.
    pub att_offset: usize,
    /// Head and position.
    pub geometry: AttentionGeometry,
}

/// Weighted accumulation of value rows for one head.
#[derive(Debug, Clone, Copy)]
pub struct WeightedSumLaunch {
    /// Score buffer.
    pub att: DevicePtr,
    /// Element offset of this head's score row.
    pub att_offset: usize,
    /// Output buffer.
    pub out: DevicePtr,
    /// Element offset of this head's output slice.
    pub out_offset: usize,
    /// Value cache of one layer.
    pub value_cache: DevicePtr,
    /// Head and position.
    pub geometry: AttentionGeometry,
}

/// `out[i] = dot(weights[i * dim1..], input[..dim1])` for `i < dim0`.
#[derive(Debug, Clone, Copy)]
pub struct MatmulLaunch {
    /// Row-major `dim0 x dim1` matrix.
    pub weights: KernelOperand,
    /// Input vector.
    pub input: KernelOperand,
    /// Output vector.
    pub out: DevicePtr,
    /// Output rows.
    pub dim0: usize,
    /// Inner dimension.
    pub dim1: usize,
}

/// Rotary embedding over a batch of tokens.
///
/// `queries` and `keys` are pointer tables: device buffers holding one
/// device address per token.
#[derive(Debug, Clone, Copy)]
pub struct RopeLaunch {
    /// Cosine table.
    pub real: KernelOperand,
    /// Sine table.
    pub imag: KernelOperand,
    /// Pointer table of query vectors.
    pub queries: DevicePtr,
    /// Pointer table of key vectors.
    pub keys: DevicePtr,
    /// Tokens in the batch; token `t` sits at `shape.position + t`.
    pub n_tokens: usize,
    /// Dimensions of the first token.
    pub shape: RopeShape,
}

/// An accelerator reached through allocate/copy/free calls.
pub trait Accelerator: Send + Sync {
    /// Short name for logs and metric labels.
    fn name(&self) -> &str;

    /// Allocate `bytes` of device memory. A null pointer is never returned
    /// as success.
    fn allocate(&self, bytes: u64) -> Result<DevicePtr>;

    /// Free an allocation.
    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Copy `host` to the start of the allocation at `ptr`.
    fn copy_host_to_device(&self, host: &[u8], ptr: DevicePtr) -> Result<()>;

    /// Copy the start of the allocation at `ptr` into `host`.
    fn copy_device_to_host(&self, ptr: DevicePtr, host: &mut [u8]) -> Result<()>;

    /// Current free and total device memory.
    fn mem_info(&self) -> Result<MemInfo>;

    /// Row RMS normalization.
    fn rmsnorm(&self, launch: &RmsNormLaunch) -> Result<()>;

    /// Softmax over `size` elements at `offset`, in place.
    fn softmax(&self, ptr: DevicePtr, offset: usize, size: usize) -> Result<()>;

    /// Attention scoring with softmax over the causal prefix.
    fn attention_scores(&self, launch: &ScoreLaunch) -> Result<()>;

    /// Weighted value accumulation.
    fn weighted_sum(&self, launch: &WeightedSumLaunch) -> Result<()>;

    /// Matrix-vector multiply.
    fn matmul(&self, launch: &MatmulLaunch) -> Result<()>;

    /// Rotary position embedding.
    fn rope(&self, launch: &RopeLaunch) -> Result<()>;

    /// Dot product of two device windows.
    fn dot(&self, a: KernelOperand, b: KernelOperand, size: usize) -> Result<f32>;
}
