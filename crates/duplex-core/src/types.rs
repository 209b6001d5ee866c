//! Placement vocabulary shared across the runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// One gibibyte.
pub const GIB: u64 = 1024 * MIB;

/// Which memory tier holds the authoritative bytes of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Only the host copy is current.
    #[default]
    OnHost,
    /// The device copy is current.
    OnDevice,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::OnHost => write!(f, "ON_HOST"),
            Placement::OnDevice => write!(f, "ON_DEVICE"),
        }
    }
}

/// Direction of a host/device copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Host to device (upload)
    HostToDevice,
    /// Device to host (download)
    DeviceToHost,
}

impl TransferDirection {
    /// Short metric label.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::HostToDevice => "h2d",
            TransferDirection::DeviceToHost => "d2h",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::HostToDevice => write!(f, "host-to-device"),
            TransferDirection::DeviceToHost => write!(f, "device-to-host"),
        }
    }
}

/// Render a byte count with a binary unit.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement_display() {
        assert_eq!(Placement::OnHost.to_string(), "ON_HOST");
        assert_eq!(Placement::OnDevice.to_string(), "ON_DEVICE");
        assert_eq!(Placement::default(), Placement::OnHost);
    }

    #[test]
    fn test_direction_labels() {
        assert_eq!(TransferDirection::HostToDevice.as_str(), "h2d");
        assert_eq!(TransferDirection::DeviceToHost.to_string(), "device-to-host");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(100 * MIB), "100.00 MiB");
        assert_eq!(format_bytes(GIB), "1.00 GiB");
    }
}
