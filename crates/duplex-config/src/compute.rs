//! Accelerator bridge and compute backend configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ConfigError;

/// Which accelerator bridge to bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorKind {
    /// Host-memory emulation of a device.
    #[default]
    Simulated,
    /// Dynamically loaded vendor bridge library.
    Native,
}

impl fmt::Display for AcceleratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simulated => write!(f, "simulated"),
            Self::Native => write!(f, "native"),
        }
    }
}

impl FromStr for AcceleratorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simulated" | "sim" => Ok(Self::Simulated),
            "native" => Ok(Self::Native),
            other => Err(ConfigError::invalid_value(
                "accelerator.kind",
                format!("unknown accelerator '{other}', expected simulated or native"),
            )),
        }
    }
}

/// Accelerator bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AcceleratorConfig {
    /// Bridge implementation.
    #[serde(default)]
    pub kind: AcceleratorKind,

    /// Path of the bridge library for the native accelerator.
    #[serde(default)]
    pub library_path: Option<String>,

    /// Device capacity of the simulated accelerator.
    #[serde(default = "default_capacity")]
    #[validate(range(min = 1))]
    pub simulated_capacity_bytes: u64,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            kind: AcceleratorKind::default(),
            library_path: None,
            simulated_capacity_bytes: default_capacity(),
        }
    }
}

impl AcceleratorConfig {
    /// Simulated device with the given capacity.
    pub fn simulated(capacity_bytes: u64) -> Self {
        Self {
            kind: AcceleratorKind::Simulated,
            library_path: None,
            simulated_capacity_bytes: capacity_bytes,
        }
    }

    /// Native bridge loaded from `path`.
    pub fn native(path: impl Into<String>) -> Self {
        Self {
            kind: AcceleratorKind::Native,
            library_path: Some(path.into()),
            ..Self::default()
        }
    }
}

fn default_capacity() -> u64 {
    1024 * 1024 * 1024
}

/// Compute backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Host loops only.
    #[default]
    Cpu,
    /// Accelerator kernels through the placement tracker.
    Accelerator,
    /// Accelerator kernels cross-checked against the host loops.
    Verify,
}

impl BackendKind {
    /// Whether this backend needs an accelerator.
    pub const fn uses_accelerator(&self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Accelerator => write!(f, "accelerator"),
            Self::Verify => write!(f, "verify"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "accelerator" | "gpu" | "device" => Ok(Self::Accelerator),
            "verify" => Ok(Self::Verify),
            other => Err(ConfigError::invalid_value(
                "kernels.backend",
                format!("unknown backend '{other}', expected cpu, accelerator or verify"),
            )),
        }
    }
}

/// Kernel execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct KernelConfig {
    /// Backend strategy.
    #[serde(default)]
    pub backend: BackendKind,

    /// Absolute tolerance used when cross-checking results.
    #[serde(default = "default_tolerance")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub tolerance: f32,

    /// Worker threads for host kernels (0 = one per core).
    #[serde(default)]
    pub num_threads: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            tolerance: default_tolerance(),
            num_threads: 0,
        }
    }
}

fn default_tolerance() -> f32 {
    1e-5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("CPU".parse::<BackendKind>().unwrap(), BackendKind::Cpu);
        assert_eq!("gpu".parse::<BackendKind>().unwrap(), BackendKind::Accelerator);
        assert_eq!("verify".parse::<BackendKind>().unwrap(), BackendKind::Verify);
        assert!("tpu".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_backend_needs_accelerator() {
        assert!(!BackendKind::Cpu.uses_accelerator());
        assert!(BackendKind::Accelerator.uses_accelerator());
        assert!(BackendKind::Verify.uses_accelerator());
    }

    #[test]
    fn test_accelerator_constructors() {
        let sim = AcceleratorConfig::simulated(4096);
        assert_eq!(sim.kind, AcceleratorKind::Simulated);
        assert_eq!(sim.simulated_capacity_bytes, 4096);

        let native = AcceleratorConfig::native("/opt/bridge/libbridge.so");
        assert_eq!(native.kind, AcceleratorKind::Native);
        assert_eq!(native.library_path.as_deref(), Some("/opt/bridge/libbridge.so"));
    }
}
