//! Tensor element encodings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of element encodings a tensor can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    /// 32-bit floating point
    #[default]
    F32,
    /// 32-bit signed integer (token ids)
    I32,
    /// Raw bytes (string payloads)
    U8,
    /// 64-bit device addresses (composite pointer tables)
    Pointer,
}

impl ElementKind {
    /// Size of one element in bytes
    pub const fn size_in_bytes(&self) -> usize {
        match self {
            ElementKind::F32 | ElementKind::I32 => 4,
            ElementKind::U8 => 1,
            ElementKind::Pointer => 8,
        }
    }

    /// Check if this is a floating point kind
    pub const fn is_float(&self) -> bool {
        matches!(self, ElementKind::F32)
    }

    /// Layout descriptor passed to bridge kernels, if the bridge knows this kind.
    pub const fn format(&self) -> Option<FormatDescriptor> {
        match self {
            ElementKind::F32 => Some(FormatDescriptor::dense(5, 4)),
            ElementKind::I32 => Some(FormatDescriptor::dense(6, 4)),
            ElementKind::U8 | ElementKind::Pointer => None,
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementKind::F32 => write!(f, "f32"),
            ElementKind::I32 => write!(f, "i32"),
            ElementKind::U8 => write!(f, "u8"),
            ElementKind::Pointer => write!(f, "ptr"),
        }
    }
}

impl std::str::FromStr for ElementKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "f32" | "float32" | "float" => Ok(ElementKind::F32),
            "i32" | "int32" | "int" => Ok(ElementKind::I32),
            "u8" | "byte" | "bytes" => Ok(ElementKind::U8),
            "ptr" | "pointer" => Ok(ElementKind::Pointer),
            _ => Err(crate::error::Error::config(format!(
                "Unknown element kind: {s}"
            ))),
        }
    }
}

/// Element layout as understood by the accelerator bridge.
///
/// Block-quantized formats pack `block_size` values into `type_size` bytes
/// behind a `header_bytes` scale header; dense formats use a block of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatDescriptor {
    /// Bridge format code
    pub code: i32,
    /// Elements per block
    pub block_size: i32,
    /// Bytes per block
    pub type_size: i32,
    /// Header bytes per block
    pub header_bytes: i32,
}

impl FormatDescriptor {
    /// Descriptor for an unquantized format.
    pub const fn dense(code: i32, type_size: i32) -> Self {
        Self {
            code,
            block_size: 1,
            type_size,
            header_bytes: 0,
        }
    }
}
