//! Error types for the Duplex runtime.
//!
//! The taxonomy follows the failure classes of the coherency layer: admission
//! denials are recoverable, allocation and transfer faults are fatal for the
//! operation that raised them, and protocol errors signal a caller bug.
//! Bookkeeping drift is never an error; it is logged and healed in place.

use thiserror::Error;

use crate::types::TransferDirection;

/// Specialized Result type for Duplex operations.
pub type Result<T> = std::result::Result<T, Error>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// The main error type for Duplex operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The memory ledger refused a reservation.
    #[error("Admission denied: requested {requested_bytes} bytes with {available_bytes} bytes of budget left")]
    Admission {
        /// Requested bytes (without safety margin)
        requested_bytes: u64,
        /// Budget left at the time of the request
        available_bytes: u64,
    },

    /// The accelerator allocator failed after admission was granted.
    #[error("Allocation failed for {requested_bytes} bytes: {message}")]
    Allocation {
        /// Detailed error message
        message: String,
        /// Requested bytes
        requested_bytes: u64,
        /// Source error
        #[source]
        source: Option<BoxedSource>,
    },

    /// A host/device copy failed.
    #[error("Transfer {direction} failed for '{label}' ({storage}): {message}")]
    Transfer {
        /// Label of the tensor being moved
        label: String,
        /// Copy direction
        direction: TransferDirection,
        /// Description of the backing storage
        storage: String,
        /// Detailed error message
        message: String,
        /// Source error
        #[source]
        source: Option<BoxedSource>,
    },

    /// The caller broke the placement protocol.
    #[error("Protocol violation: {message}")]
    Protocol {
        /// Detailed error message
        message: String,
    },

    /// A foreign call into the accelerator bridge failed.
    #[error("Device error: {message}")]
    Device {
        /// Detailed error message
        message: String,
        /// Source error
        #[source]
        source: Option<BoxedSource>,
    },

    /// Tensor shape or bounds errors.
    #[error("Tensor error: {message}")]
    Tensor {
        /// Detailed error message
        message: String,
        /// Expected element count if applicable
        expected_len: Option<usize>,
        /// Actual element count if applicable
        actual_len: Option<usize>,
    },

    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config {
        /// Detailed error message
        message: String,
        /// Optional source error
        #[source]
        source: Option<BoxedSource>,
    },

    /// Internal errors (bugs, invariant violations)
    #[error("Internal error: {message}")]
    Internal {
        /// Detailed error message
        message: String,
        /// Source error
        #[source]
        source: Option<BoxedSource>,
    },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        /// Detailed error message
        message: String,
        /// Source error
        #[source]
        source: Option<std::io::Error>,
    },

    /// Unsupported operation or feature
    #[error("Unsupported: {feature}")]
    Unsupported {
        /// Feature that is not supported
        feature: String,
    },
}

impl Error {
    /// Create an admission denial
    pub fn admission(requested_bytes: u64, available_bytes: u64) -> Self {
        Self::Admission {
            requested_bytes,
            available_bytes,
        }
    }

    /// Create an allocation fault
    pub fn allocation(message: impl Into<String>, requested_bytes: u64) -> Self {
        Self::Allocation {
            message: message.into(),
            requested_bytes,
            source: None,
        }
    }

    /// Create an allocation fault wrapping the allocator's error
    pub fn allocation_with_source(
        requested_bytes: u64,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Allocation {
            message: source.to_string(),
            requested_bytes,
            source: Some(Box::new(source)),
        }
    }

    /// Create a transfer fault for a labelled tensor
    pub fn transfer(
        label: impl Into<String>,
        direction: TransferDirection,
        storage: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transfer {
            label: label.into(),
            direction,
            storage: storage.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol misuse error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a device error
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device {
            message: message.into(),
            source: None,
        }
    }

    /// Create a device error with source
    pub fn device_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a tensor error
    pub fn tensor(message: impl Into<String>) -> Self {
        Self::Tensor {
            message: message.into(),
            expected_len: None,
            actual_len: None,
        }
    }

    /// Create a tensor length mismatch error
    pub fn length_mismatch(message: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::Tensor {
            message: message.into(),
            expected_len: Some(expected),
            actual_len: Some(actual),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Create an unsupported feature error
    pub fn unsupported(feature: impl Into<String>) -> Self {
        Self::Unsupported {
            feature: feature.into(),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only admission denials qualify: the caller may free other tensors and
    /// try again. Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Admission { .. })
    }

    /// Check if this error signals a caller bug
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::Protocol { .. })
    }

    /// Get the stable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Admission { .. } => "ADMISSION_DENIED",
            Error::Allocation { .. } => "ALLOCATION_FAILED",
            Error::Transfer { .. } => "TRANSFER_FAILED",
            Error::Protocol { .. } => "PROTOCOL_VIOLATION",
            Error::Device { .. } => "DEVICE_ERROR",
            Error::Tensor { .. } => "TENSOR_ERROR",
            Error::Config { .. } => "CONFIG_ERROR",
            Error::Internal { .. } => "INTERNAL_ERROR",
            Error::Io { .. } => "IO_ERROR",
            Error::Unsupported { .. } => "UNSUPPORTED",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context to an error with a closure
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ErrorContext<T>
    for std::result::Result<T, E>
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Internal {
            message: message.into(),
            source: Some(Box::new(e)),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::Internal {
            message: f(),
            source: Some(Box::new(e)),
        })
    }
}
