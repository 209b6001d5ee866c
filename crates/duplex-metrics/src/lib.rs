//! Duplex Metrics and Observability.
//!
//! Tracing subscriber setup and Prometheus metrics for the accelerator
//! memory runtime: transfer traffic, ledger state, admission denials, kernel
//! latency and host/device cross-check mismatches.
//!
//! Recording goes through the global collector and is a no-op until
//! [`init_metrics`] has run, so library code can record unconditionally.
//!
//! # Example
//!
//! ```rust,ignore
//! use duplex_metrics::{init_metrics, metrics, CollectorConfig};
//!
//! init_metrics(CollectorConfig::default())?;
//! if let Ok(m) = metrics() {
//!     m.record_transfer("h2d", 4096);
//! }
//! ```

pub mod collector;
pub mod tracing_setup;

pub use collector::{CollectorConfig, MetricsCollector};
pub use tracing_setup::{init_tracing, LogFormat, TracingConfig};

use std::sync::OnceLock;
use thiserror::Error;

/// Global metrics collector.
static METRICS: OnceLock<MetricsCollector> = OnceLock::new();

/// Metrics error.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// `init_metrics` ran twice.
    #[error("Metrics already initialized")]
    AlreadyInitialized,

    /// No collector installed.
    #[error("Metrics not initialized")]
    NotInitialized,

    /// Registration or encoding failed.
    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] ::prometheus::Error),

    /// Subscriber installation failed.
    #[error("Tracing error: {0}")]
    TracingError(String),
}

/// Initialize the global metrics collector.
pub fn init_metrics(config: CollectorConfig) -> Result<(), MetricsError> {
    let collector = MetricsCollector::new(config)?;
    METRICS
        .set(collector)
        .map_err(|_| MetricsError::AlreadyInitialized)?;
    Ok(())
}

/// Get the global metrics collector.
pub fn metrics() -> Result<&'static MetricsCollector, MetricsError> {
    METRICS.get().ok_or(MetricsError::NotInitialized)
}

/// Export the global collector in Prometheus text format.
pub fn export_prometheus() -> Result<String, MetricsError> {
    metrics()?.export()
}

/// Time a kernel invocation and record it under `(kernel, backend)`.
#[macro_export]
macro_rules! time_kernel {
    ($kernel:expr, $backend:expr, $block:expr) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration = start.elapsed();
        tracing::trace!("{} on {} took {:?}", $kernel, $backend, duration);
        if let Ok(m) = $crate::metrics() {
            m.record_kernel_latency($kernel, $backend, duration.as_secs_f64());
        }
        result
    }};
}
