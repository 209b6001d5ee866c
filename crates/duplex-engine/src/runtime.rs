//! Runtime assembly from configuration.

use std::sync::Arc;

use tracing::{info, warn};

use duplex_config::{AcceleratorKind, BackendKind, Config};
use duplex_core::{Error, Result};
use duplex_metrics::{CollectorConfig, MetricsError, TracingConfig};
use duplex_tensor::accelerator::Accelerator;
use duplex_tensor::ledger::LedgerSnapshot;
use duplex_tensor::{parallel, DeviceContext, NativeAccelerator, PlacementReport, SimulatedAccelerator};

use crate::accelerated::AcceleratorBackend;
use crate::backend::{ComputeBackend, CpuBackend};
use crate::verify::VerifyingBackend;

/// A configured backend plus the device context it runs on.
pub struct Runtime {
    config: Config,
    context: Option<Arc<DeviceContext>>,
    backend: Box<dyn ComputeBackend>,
}

impl Runtime {
    /// Build the accelerator, context and backend described by `config`.
    ///
    /// The host backend never touches the accelerator, so none is created
    /// for it.
    pub fn from_config(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::config_with_source("invalid configuration", e))?;

        if config.kernels.num_threads > 0 && !parallel::configure_global_pool(config.kernels.num_threads) {
            warn!(
                "Thread pool already running with {} threads; ignoring num_threads = {}",
                parallel::current_num_threads(),
                config.kernels.num_threads
            );
        }
        if config.metrics.enabled {
            init_metrics(&config)?;
        }

        let backend_kind = config.kernels.backend;
        let context = if backend_kind.uses_accelerator() {
            let accelerator = build_accelerator(&config)?;
            Some(DeviceContext::new(
                accelerator,
                config.ledger.clone(),
                config.tracker.clone(),
            ))
        } else {
            None
        };

        let backend: Box<dyn ComputeBackend> = match (backend_kind, &context) {
            (BackendKind::Accelerator, Some(ctx)) => Box::new(AcceleratorBackend::new(Arc::clone(ctx))),
            (BackendKind::Verify, Some(ctx)) => Box::new(VerifyingBackend::new(
                Arc::clone(ctx),
                config.kernels.tolerance,
            )),
            _ => Box::new(CpuBackend::new()),
        };

        info!(
            "Runtime ready: backend={}, accelerator={}",
            backend.name(),
            context
                .as_ref()
                .map(|c| c.accelerator().name().to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        Ok(Self {
            config,
            context,
            backend,
        })
    }

    /// A runtime on a simulated device of `capacity` bytes.
    pub fn simulated(capacity: u64, backend: BackendKind) -> Result<Self> {
        let mut config = Config::default();
        config.accelerator = duplex_config::AcceleratorConfig::simulated(capacity);
        config.kernels.backend = backend;
        config.metrics.enabled = false;
        Self::from_config(config)
    }

    /// Install the tracing subscriber described by `config.logging`.
    pub fn init_tracing(config: &Config) -> Result<()> {
        let tracing = TracingConfig::new(config.logging.level.clone(), &config.logging.format)
            .with_span_events(config.logging.span_events);
        duplex_metrics::init_tracing(tracing)
            .map_err(|e| Error::config_with_source("failed to install tracing", e))
    }

    /// The compute backend.
    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    /// The device context, when an accelerator is in use.
    pub fn context(&self) -> Option<&Arc<DeviceContext>> {
        self.context.as_ref()
    }

    /// Configuration the runtime was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ledger state, when an accelerator is in use.
    pub fn ledger_snapshot(&self) -> Option<LedgerSnapshot> {
        self.context.as_ref().map(|ctx| ctx.ledger().snapshot())
    }

    /// Placement counters, when an accelerator is in use.
    pub fn placement_report(&self) -> Option<PlacementReport> {
        self.context.as_ref().map(|ctx| ctx.report())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &self.backend.name())
            .field("context", &self.context)
            .finish()
    }
}

fn build_accelerator(config: &Config) -> Result<Arc<dyn Accelerator>> {
    let accel = &config.accelerator;
    match accel.kind {
        AcceleratorKind::Simulated => Ok(Arc::new(SimulatedAccelerator::new(
            accel.simulated_capacity_bytes,
        ))),
        AcceleratorKind::Native => {
            let path = accel
                .library_path
                .as_deref()
                .ok_or_else(|| Error::config("accelerator.library_path is required for the native bridge"))?;
            Ok(Arc::new(NativeAccelerator::load(path)?))
        }
    }
}

fn init_metrics(config: &Config) -> Result<()> {
    let collector = CollectorConfig {
        namespace: config.metrics.namespace.clone(),
        latency_buckets: config.metrics.latency_buckets.clone(),
        ..CollectorConfig::default()
    };
    match duplex_metrics::init_metrics(collector) {
        Ok(()) | Err(MetricsError::AlreadyInitialized) => Ok(()),
        Err(e) => Err(Error::config_with_source("failed to initialize metrics", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_tensor::FloatTensor;

    #[test]
    fn test_cpu_runtime_has_no_device() {
        let runtime = Runtime::simulated(1 << 20, BackendKind::Cpu).unwrap();
        assert_eq!(runtime.backend().name(), "cpu");
        assert!(runtime.context().is_none());
        assert!(runtime.ledger_snapshot().is_none());
    }

    #[test]
    fn test_accelerator_runtime_places_operands() {
        let runtime = Runtime::simulated(16 << 20, BackendKind::Accelerator).unwrap();
        assert_eq!(runtime.backend().name(), "accelerator");

        let a = FloatTensor::from_slice(&[1.0, 2.0, 3.0]);
        let dot = runtime.backend().dot(&a, 0, &a, 0, 3).unwrap();
        assert_eq!(dot, 14.0);

        let report = runtime.placement_report().unwrap();
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.total_uploads, 1);
        let snapshot = runtime.ledger_snapshot().unwrap();
        assert_eq!(snapshot.total, 16 << 20);
    }

    #[test]
    fn test_native_without_path_is_config_error() {
        let mut config = Config::default();
        config.accelerator.kind = AcceleratorKind::Native;
        config.accelerator.library_path = None;
        config.kernels.backend = BackendKind::Accelerator;
        config.metrics.enabled = false;
        let err = Runtime::from_config(config).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_native_with_missing_library() {
        let mut config = Config::default();
        config.accelerator = duplex_config::AcceleratorConfig::native("/nonexistent/libbridge.so");
        config.kernels.backend = BackendKind::Verify;
        config.metrics.enabled = false;
        let err = Runtime::from_config(config).unwrap_err();
        assert!(matches!(err.error_code(), "DEVICE_ERROR" | "CONFIG_ERROR"));
    }
}
