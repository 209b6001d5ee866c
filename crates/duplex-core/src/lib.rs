//! # Duplex Core
//!
//! Core types shared by every crate of the Duplex accelerator memory runtime.
//!
//! - **Error handling**: the [`Error`] taxonomy (admission, allocation, transfer,
//!   protocol misuse) with error codes and context helpers
//! - **Device addressing**: raw accelerator pointers and memory reports
//! - **Element kinds**: the closed set of tensor element encodings
//! - **Placement vocabulary**: host/device residency and transfer direction
//!
//! ## Example
//!
//! ```rust
//! use duplex_core::{DevicePtr, ElementKind, Error, Result};
//!
//! fn table_entry(ptr: DevicePtr) -> Result<u64> {
//!     if ptr.is_null() {
//!         return Err(Error::protocol("member has no device allocation"));
//!     }
//!     Ok(ptr.addr())
//! }
//!
//! assert_eq!(ElementKind::F32.size_in_bytes(), 4);
//! assert!(table_entry(DevicePtr::NULL).is_err());
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod device;
pub mod element;
pub mod error;
pub mod types;

pub use device::*;
pub use element::*;
pub use error::{Error, ErrorContext, Result};
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::device::*;
    pub use crate::element::*;
    pub use crate::error::{Error, ErrorContext, Result};
    pub use crate::types::*;
}
