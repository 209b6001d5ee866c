//! Accelerator addressing.
//!
//! Device memory is only ever reached through raw addresses handed out by the
//! accelerator bridge. [`DevicePtr`] wraps such an address; zero means "no
//! allocation" and is never an error by itself.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A raw accelerator address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// The null pointer.
    pub const NULL: DevicePtr = DevicePtr(0);

    /// Wrap a raw address.
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Raw address value.
    pub const fn addr(&self) -> u64 {
        self.0
    }

    /// Whether this is the null pointer.
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// `None` for the null pointer.
    pub const fn non_null(self) -> Option<Self> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for DevicePtr {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<DevicePtr> for u64 {
    fn from(ptr: DevicePtr) -> Self {
        ptr.0
    }
}

/// Free and total accelerator memory as reported by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemInfo {
    /// Free bytes
    pub free: u64,
    /// Total bytes
    pub total: u64,
}

impl MemInfo {
    /// Create a new memory report.
    pub const fn new(free: u64, total: u64) -> Self {
        Self { free, total }
    }

    /// Bytes in use.
    pub const fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }

    /// Memory utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.used() as f64 / self.total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_pointer() {
        assert!(DevicePtr::NULL.is_null());
        assert_eq!(DevicePtr::NULL.non_null(), None);
        assert_eq!(DevicePtr::new(0x1000).non_null(), Some(DevicePtr::new(0x1000)));
    }

    #[test]
    fn test_pointer_display() {
        assert_eq!(DevicePtr::new(255).to_string(), "0xff");
    }

    #[test]
    fn test_mem_info() {
        let info = MemInfo::new(256, 1024);
        assert_eq!(info.used(), 768);
        assert!((info.utilization() - 75.0).abs() < 1e-9);
        assert_eq!(MemInfo::default().utilization(), 0.0);
    }

    #[test]
    fn test_pointer_serializes_as_integer() {
        let json = serde_json::to_string(&DevicePtr::new(42)).unwrap();
        assert_eq!(json, "42");
    }
}
