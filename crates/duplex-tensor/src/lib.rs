//! # Duplex Tensor
//!
//! Host tensors mirrored on an accelerator, and the bookkeeping that keeps
//! both copies coherent.
//!
//! This crate provides:
//!
//! - **Tensors**: fixed-width host buffers ([`FloatTensor`], [`IntTensor`],
//!   [`ByteTensor`], [`PointerTensor`]) with an optional device allocation
//! - **CPU kernels**: reference numeric primitives (reduce, softmax, dot,
//!   rmsnorm, attention scoring, weighted sums, matmul, rotary embedding)
//! - **Parallel dispatch**: fork-join loops over independent index ranges
//! - **Accelerator boundary**: the [`Accelerator`] trait with a simulated and
//!   a dynamically loaded native bridge
//! - **Memory ledger**: admission control over device memory
//! - **Placement tracker**: decides when host and device copies must be synced
//! - **Reclamation**: scoped release of device allocations
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use duplex_tensor::{DeviceContext, FloatTensor, SimulatedAccelerator};
//!
//! let ctx = DeviceContext::with_defaults(Arc::new(SimulatedAccelerator::new(1 << 30)));
//! let x = FloatTensor::from_vec(vec![1.0, 2.0, 3.0]);
//! ctx.offer(&x, "x", false)?;   // allocates and uploads
//! ctx.offer(&x, "x", false)?;   // cache hit, no transfer
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod accelerator;
pub mod context;
pub mod kernels;
pub mod ledger;
pub mod ops;
pub mod parallel;
pub mod placement;
pub mod reclaim;
pub mod table;
pub mod tensor;

pub use accelerator::{
    Accelerator, AttentionGeometry, KernelOperand, MatmulLaunch, NativeAccelerator, RmsNormLaunch,
    RopeLaunch, ScoreLaunch, SimulatedAccelerator, SimulatedStats, WeightedSumLaunch,
};
pub use context::DeviceContext;
pub use ledger::{LedgerSnapshot, MemoryLedger};
pub use placement::{PlacementReport, PlacementStatus, PlacementTracker};
pub use reclaim::DeviceAllocation;
pub use table::{PointerTable, TableAccess};
pub use tensor::{ByteTensor, Element, FloatTensor, IntTensor, PointerTensor, Tensor};

/// Prelude for common imports
pub mod prelude {
    pub use super::accelerator::*;
    pub use super::context::DeviceContext;
    pub use super::kernels::*;
    pub use super::parallel::*;
    pub use super::placement::{PlacementReport, PlacementStatus};
    pub use super::table::{PointerTable, TableAccess};
    pub use super::tensor::*;
    pub use duplex_core::{DevicePtr, ElementKind, Error, Result};
}
