//! Metrics collector.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::debug;

use crate::MetricsError;

/// Collector configuration.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Namespace for metrics.
    pub namespace: String,

    /// Subsystem for metrics.
    pub subsystem: String,

    /// Kernel latency histogram buckets, in seconds.
    pub latency_buckets: Vec<f64>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            namespace: "duplex".to_string(),
            subsystem: "device".to_string(),
            latency_buckets: vec![
                0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5,
            ],
        }
    }
}

/// Metrics collector.
pub struct MetricsCollector {
    registry: Registry,

    // Placement traffic
    transfers_total: CounterVec,
    transfer_bytes_total: CounterVec,
    offer_cache_hits_total: Counter,

    // Ledger
    ledger_allocated_bytes: Gauge,
    ledger_baseline_free_bytes: Gauge,
    ledger_total_bytes: Gauge,
    ledger_refreshes_total: Counter,
    admission_denials_total: Counter,
    allocation_failures_total: Counter,
    live_allocations: IntGauge,

    // Kernels
    kernel_latency: HistogramVec,
    verify_comparisons_total: CounterVec,
    verify_mismatches_total: CounterVec,
}

impl MetricsCollector {
    /// Create a collector with its own registry.
    pub fn new(config: CollectorConfig) -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(config.namespace.as_str())
                .subsystem(config.subsystem.as_str())
        };

        let transfers_total = CounterVec::new(
            opts("transfers_total", "Host/device copies by direction"),
            &["direction"],
        )?;
        let transfer_bytes_total = CounterVec::new(
            opts("transfer_bytes_total", "Bytes copied by direction"),
            &["direction"],
        )?;
        let offer_cache_hits_total = Counter::with_opts(opts(
            "offer_cache_hits_total",
            "Offers that needed no transfer",
        ))?;

        let ledger_allocated_bytes = Gauge::with_opts(opts(
            "ledger_allocated_bytes",
            "Bytes reserved since the last ledger refresh",
        ))?;
        let ledger_baseline_free_bytes = Gauge::with_opts(opts(
            "ledger_baseline_free_bytes",
            "Free device memory at the last ledger refresh",
        ))?;
        let ledger_total_bytes =
            Gauge::with_opts(opts("ledger_total_bytes", "Total device memory"))?;
        let ledger_refreshes_total =
            Counter::with_opts(opts("ledger_refreshes_total", "Ledger refreshes"))?;
        let admission_denials_total = Counter::with_opts(opts(
            "admission_denials_total",
            "Reservations refused by the ledger",
        ))?;
        let allocation_failures_total = Counter::with_opts(opts(
            "allocation_failures_total",
            "Allocator failures after admission",
        ))?;
        let live_allocations = IntGauge::with_opts(opts(
            "live_allocations",
            "Device allocations not yet reclaimed",
        ))?;

        let kernel_latency = HistogramVec::new(
            HistogramOpts::new("kernel_latency_seconds", "Kernel latency")
                .namespace(config.namespace.as_str())
                .subsystem(config.subsystem.as_str())
                .buckets(config.latency_buckets.clone()),
            &["kernel", "backend"],
        )?;
        let verify_comparisons_total = CounterVec::new(
            opts("verify_comparisons_total", "Host/device result comparisons"),
            &["kernel"],
        )?;
        let verify_mismatches_total = CounterVec::new(
            opts(
                "verify_mismatches_total",
                "Host/device results outside tolerance",
            ),
            &["kernel"],
        )?;

        registry.register(Box::new(transfers_total.clone()))?;
        registry.register(Box::new(transfer_bytes_total.clone()))?;
        registry.register(Box::new(offer_cache_hits_total.clone()))?;
        registry.register(Box::new(ledger_allocated_bytes.clone()))?;
        registry.register(Box::new(ledger_baseline_free_bytes.clone()))?;
        registry.register(Box::new(ledger_total_bytes.clone()))?;
        registry.register(Box::new(ledger_refreshes_total.clone()))?;
        registry.register(Box::new(admission_denials_total.clone()))?;
        registry.register(Box::new(allocation_failures_total.clone()))?;
        registry.register(Box::new(live_allocations.clone()))?;
        registry.register(Box::new(kernel_latency.clone()))?;
        registry.register(Box::new(verify_comparisons_total.clone()))?;
        registry.register(Box::new(verify_mismatches_total.clone()))?;

        debug!(
            "Metrics collector created with namespace {}_{}",
            config.namespace, config.subsystem
        );

        Ok(Self {
            registry,
            transfers_total,
            transfer_bytes_total,
            offer_cache_hits_total,
            ledger_allocated_bytes,
            ledger_baseline_free_bytes,
            ledger_total_bytes,
            ledger_refreshes_total,
            admission_denials_total,
            allocation_failures_total,
            live_allocations,
            kernel_latency,
            verify_comparisons_total,
            verify_mismatches_total,
        })
    }

    // Placement traffic
    pub fn record_transfer(&self, direction: &str, bytes: u64) {
        self.transfers_total.with_label_values(&[direction]).inc();
        self.transfer_bytes_total
            .with_label_values(&[direction])
            .inc_by(bytes as f64);
    }

    pub fn record_offer_cache_hit(&self) {
        self.offer_cache_hits_total.inc();
    }

    // Ledger
    pub fn set_ledger_state(&self, allocated: u64, baseline_free: u64, total: u64) {
        self.ledger_allocated_bytes.set(allocated as f64);
        self.ledger_baseline_free_bytes.set(baseline_free as f64);
        self.ledger_total_bytes.set(total as f64);
    }

    pub fn record_ledger_refresh(&self) {
        self.ledger_refreshes_total.inc();
    }

    pub fn record_admission_denial(&self) {
        self.admission_denials_total.inc();
    }

    pub fn record_allocation_failure(&self) {
        self.allocation_failures_total.inc();
    }

    pub fn inc_live_allocations(&self) {
        self.live_allocations.inc();
    }

    pub fn dec_live_allocations(&self) {
        self.live_allocations.dec();
    }

    // Kernels
    pub fn record_kernel_latency(&self, kernel: &str, backend: &str, seconds: f64) {
        self.kernel_latency
            .with_label_values(&[kernel, backend])
            .observe(seconds);
    }

    pub fn record_verification(&self, kernel: &str, matched: bool) {
        self.verify_comparisons_total
            .with_label_values(&[kernel])
            .inc();
        if !matched {
            self.verify_mismatches_total
                .with_label_values(&[kernel])
                .inc();
        }
    }

    /// Mismatch count for a kernel.
    pub fn verify_mismatches(&self, kernel: &str) -> u64 {
        self.verify_mismatches_total
            .with_label_values(&[kernel])
            .get() as u64
    }

    /// Encode all metrics in Prometheus text format.
    pub fn export(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Get registry for custom metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_counters_exported() {
        let collector = MetricsCollector::new(CollectorConfig::default()).unwrap();
        collector.record_transfer("h2d", 4096);
        collector.record_transfer("h2d", 4096);
        collector.record_transfer("d2h", 16);

        let text = collector.export().unwrap();
        assert!(text.contains("duplex_device_transfers_total{direction=\"h2d\"} 2"));
        assert!(text.contains("duplex_device_transfer_bytes_total{direction=\"h2d\"} 8192"));
        assert!(text.contains("duplex_device_transfer_bytes_total{direction=\"d2h\"} 16"));
    }

    #[test]
    fn test_ledger_gauges() {
        let collector = MetricsCollector::new(CollectorConfig::default()).unwrap();
        collector.set_ledger_state(100, 900, 1000);
        let text = collector.export().unwrap();
        assert!(text.contains("duplex_device_ledger_allocated_bytes 100"));
        assert!(text.contains("duplex_device_ledger_total_bytes 1000"));
    }

    #[test]
    fn test_verification_counts() {
        let collector = MetricsCollector::new(CollectorConfig::default()).unwrap();
        collector.record_verification("dot", true);
        collector.record_verification("dot", false);
        collector.record_verification("softmax", true);
        assert_eq!(collector.verify_mismatches("dot"), 1);
        assert_eq!(collector.verify_mismatches("softmax"), 0);
    }
}
