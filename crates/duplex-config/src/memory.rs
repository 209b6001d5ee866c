//! Memory ledger and placement tracker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

const MIB: u64 = 1024 * 1024;

/// Memory ledger policy.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LedgerConfig {
    /// Releases between refreshes right after a failure.
    #[serde(default = "default_min_interval")]
    #[validate(range(min = 1))]
    pub min_refresh_interval: u32,

    /// Ceiling for the adaptive refresh interval.
    #[serde(default = "default_max_interval")]
    #[validate(range(min = 1))]
    pub max_refresh_interval: u32,

    /// Longest wall-clock gap between refreshes, in milliseconds.
    #[serde(default = "default_max_gap_ms")]
    pub max_refresh_gap_ms: u64,

    /// Safety margin is `requested / margin_divisor` before clamping.
    #[serde(default = "default_margin_divisor")]
    #[validate(range(min = 1))]
    pub margin_divisor: u64,

    /// Lower clamp of the safety margin.
    #[serde(default = "default_min_margin")]
    pub min_margin_bytes: u64,

    /// Upper clamp of the safety margin.
    #[serde(default = "default_max_margin")]
    pub max_margin_bytes: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            min_refresh_interval: default_min_interval(),
            max_refresh_interval: default_max_interval(),
            max_refresh_gap_ms: default_max_gap_ms(),
            margin_divisor: default_margin_divisor(),
            min_margin_bytes: default_min_margin(),
            max_margin_bytes: default_max_margin(),
        }
    }
}

impl LedgerConfig {
    /// Longest gap between refreshes.
    pub fn max_refresh_gap(&self) -> Duration {
        Duration::from_millis(self.max_refresh_gap_ms)
    }

    /// Padding applied to a reservation of `bytes`.
    pub fn safety_margin(&self, bytes: u64) -> u64 {
        // Inverted bounds resolve to the upper one instead of panicking.
        (bytes / self.margin_divisor.max(1))
            .max(self.min_margin_bytes)
            .min(self.max_margin_bytes)
    }

    /// Set the refresh gap.
    pub fn with_max_refresh_gap(mut self, gap: Duration) -> Self {
        self.max_refresh_gap_ms = gap.as_millis() as u64;
        self
    }

    /// Set both interval bounds.
    pub fn with_refresh_intervals(mut self, min: u32, max: u32) -> Self {
        self.min_refresh_interval = min;
        self.max_refresh_interval = max;
        self
    }
}

fn default_min_interval() -> u32 {
    8
}

fn default_max_interval() -> u32 {
    1024
}

fn default_max_gap_ms() -> u64 {
    5_000
}

fn default_margin_divisor() -> u64 {
    10
}

fn default_min_margin() -> u64 {
    4 * MIB
}

fn default_max_margin() -> u64 {
    256 * MIB
}

/// Placement tracker options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Log every transfer at debug level.
    #[serde(default)]
    pub log_transfers: bool,
}
