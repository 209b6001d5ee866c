//! # Duplex Engine
//!
//! Compute backends over the Duplex tensor runtime, and the assembly of a
//! runtime from configuration.
//!
//! ## Architecture
//!
//! - **Backends**: [`ComputeBackend`] with a host implementation
//!   ([`CpuBackend`]), an accelerator implementation that places operands
//!   through the device context ([`AcceleratorBackend`]) and a cross-checking
//!   implementation that runs both ([`VerifyingBackend`])
//! - **Drivers**: multi-head attention and rotary embedding over any backend
//! - **Runtime**: accelerator, context and backend built from a [`Config`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use duplex_config::BackendKind;
//! use duplex_engine::Runtime;
//! use duplex_tensor::FloatTensor;
//!
//! let runtime = Runtime::simulated(1 << 30, BackendKind::Verify)?;
//! let x = FloatTensor::from_vec(vec![1.0, 2.0, 3.0]);
//! let dot = runtime.backend().dot(&x, 0, &x, 0, 3)?;
//! ```
//!
//! [`Config`]: duplex_config::Config

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod accelerated;
pub mod attention;
pub mod backend;
pub mod rope;
pub mod runtime;
pub mod verify;

pub use accelerated::AcceleratorBackend;
pub use attention::{attend, AttentionShape};
pub use backend::{ComputeBackend, CpuBackend};
pub use rope::RotaryEmbedding;
pub use runtime::Runtime;
pub use verify::{Deviation, VerifyingBackend};

/// Prelude for common imports
pub mod prelude {
    pub use super::attention::{attend, AttentionShape};
    pub use super::backend::{ComputeBackend, CpuBackend};
    pub use super::rope::RotaryEmbedding;
    pub use super::runtime::Runtime;
}
