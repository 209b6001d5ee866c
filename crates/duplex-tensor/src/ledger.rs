//! Admission control over device memory.
//!
//! The ledger does not track individual allocations. It keeps the free memory
//! reported at the last refresh and the bytes it has granted since, and
//! refuses a reservation that would not fit with a safety margin. Refreshes
//! happen after a bounded time gap or after a release count that grows
//! logarithmically with churn, and reset the granted total to zero.
//!
//! Resetting on refresh can under-count usage when a refresh races with
//! reservations whose allocations have not reached the device yet. This is a
//! known approximation; the real allocator remains the final authority.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use duplex_config::LedgerConfig;

use crate::accelerator::Accelerator;

/// Copy of the ledger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Free device memory at the last refresh.
    pub baseline_free: u64,

    /// Total device memory at the last refresh.
    pub total: u64,

    /// Bytes granted since the last refresh.
    pub allocated: u64,

    /// Releases between count-triggered refreshes.
    pub refresh_interval: u32,

    /// Releases since the last refresh.
    pub release_count: u32,

    /// Successful refreshes, including the initial one.
    pub refreshes: u64,
}

impl LedgerSnapshot {
    /// Budget left before the safety margin.
    pub fn available(&self) -> u64 {
        self.baseline_free.saturating_sub(self.allocated)
    }
}

#[derive(Debug)]
struct LedgerState {
    baseline_free: u64,
    total: u64,
    allocated: u64,
    refresh_interval: u32,
    release_count: u32,
    last_refresh: Instant,
    refreshes: u64,
}

/// Budget tracker for one accelerator.
pub struct MemoryLedger {
    /// Refresh and margin policy.
    config: LedgerConfig,

    /// Source of free/total memory.
    accelerator: Arc<dyn Accelerator>,

    /// All mutable state, behind one lock.
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    /// Create a ledger and take the first memory reading.
    pub fn new(accelerator: Arc<dyn Accelerator>, config: LedgerConfig) -> Self {
        let ledger = Self {
            state: Mutex::new(LedgerState {
                baseline_free: 0,
                total: 0,
                allocated: 0,
                refresh_interval: config.min_refresh_interval,
                release_count: 0,
                last_refresh: Instant::now(),
                refreshes: 0,
            }),
            config,
            accelerator,
        };
        ledger.refresh();

        let snapshot = ledger.snapshot();
        info!(
            "MemoryLedger initialized on {}: {} MB free of {} MB",
            ledger.accelerator.name(),
            snapshot.baseline_free / (1024 * 1024),
            snapshot.total / (1024 * 1024)
        );
        ledger
    }

    /// Safety margin added to a request of `bytes`.
    pub fn margin_for(&self, bytes: u64) -> u64 {
        self.config.safety_margin(bytes)
    }

    /// Grant `bytes` if they fit with the safety margin.
    ///
    /// A denial leaves the granted total unchanged and resets the refresh
    /// backoff, so the next releases refresh the view aggressively.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        let margin = self.margin_for(bytes);
        let mut state = self.state.lock();
        let needed = state
            .allocated
            .saturating_add(bytes)
            .saturating_add(margin);
        if needed > state.baseline_free {
            debug!(
                "Reservation of {} bytes denied: {} granted, {} free at last refresh",
                bytes, state.allocated, state.baseline_free
            );
            Self::reset_backoff(&self.config, &mut state);
            if let Ok(m) = duplex_metrics::metrics() {
                m.record_admission_denial();
            }
            return false;
        }
        state.allocated += bytes;
        self.publish(&state);
        true
    }

    /// Reset the refresh backoff to its minimum.
    pub fn on_allocation_failure(&self) {
        let mut state = self.state.lock();
        Self::reset_backoff(&self.config, &mut state);
        debug!(
            "Ledger backoff reset: {} free of {} at last refresh",
            state.baseline_free, state.total
        );
    }

    /// Return `bytes` to the budget, refreshing when due.
    pub fn release(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.allocated = state.allocated.saturating_sub(bytes);
        state.release_count = state.release_count.saturating_add(1);

        let now = Instant::now();
        let time_expired = now.duration_since(state.last_refresh) > self.config.max_refresh_gap();
        let count_expired = state.release_count >= state.refresh_interval;
        if time_expired || count_expired {
            self.refresh_locked(&mut state);
            let min = self.config.min_refresh_interval;
            let windup = min.saturating_mul(1 + (state.release_count.saturating_add(1)).ilog2());
            state.refresh_interval = windup.min(self.config.max_refresh_interval);
            state.release_count = 0;
            state.last_refresh = now;
        }
        self.publish(&state);
    }

    /// Undo a reservation whose allocation never happened. Not a release:
    /// the refresh counter is untouched.
    pub fn rollback(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.allocated = state.allocated.saturating_sub(bytes);
        self.publish(&state);
    }

    /// Re-read free and total memory from the accelerator. On failure the
    /// previous view stays in place and false is returned.
    pub fn refresh(&self) -> bool {
        let mut state = self.state.lock();
        self.refresh_locked(&mut state)
    }

    /// Current state.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock();
        LedgerSnapshot {
            baseline_free: state.baseline_free,
            total: state.total,
            allocated: state.allocated,
            refresh_interval: state.refresh_interval,
            release_count: state.release_count,
            refreshes: state.refreshes,
        }
    }

    /// Bytes granted since the last refresh.
    pub fn allocated(&self) -> u64 {
        self.state.lock().allocated
    }

    /// Budget left before the safety margin.
    pub fn available(&self) -> u64 {
        self.snapshot().available()
    }

    fn refresh_locked(&self, state: &mut LedgerState) -> bool {
        match self.accelerator.mem_info() {
            Ok(info) => {
                state.baseline_free = info.free;
                state.total = info.total;
                state.allocated = 0;
                state.last_refresh = Instant::now();
                state.refreshes += 1;
                debug!(
                    "Ledger refreshed: {} free of {} total",
                    info.free, info.total
                );
                if let Ok(m) = duplex_metrics::metrics() {
                    m.record_ledger_refresh();
                }
                self.publish(state);
                true
            }
            Err(e) => {
                warn!("Ledger refresh failed, keeping previous view: {}", e);
                false
            }
        }
    }

    fn reset_backoff(config: &LedgerConfig, state: &mut LedgerState) {
        state.refresh_interval = config.min_refresh_interval;
        state.release_count = 0;
        state.last_refresh = Instant::now();
    }

    fn publish(&self, state: &LedgerState) {
        if let Ok(m) = duplex_metrics::metrics() {
            m.set_ledger_state(state.allocated, state.baseline_free, state.total);
        }
    }
}

impl std::fmt::Debug for MemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLedger")
            .field("accelerator", &self.accelerator.name())
            .field("state", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::SimulatedAccelerator;
    use duplex_core::{GIB, MIB};
    use std::time::Duration;

    fn ledger(capacity: u64, config: LedgerConfig) -> (Arc<SimulatedAccelerator>, MemoryLedger) {
        let accel = Arc::new(SimulatedAccelerator::new(capacity));
        let ledger = MemoryLedger::new(accel.clone(), config);
        (accel, ledger)
    }

    fn quiet_config() -> LedgerConfig {
        LedgerConfig::default().with_max_refresh_gap(Duration::from_secs(3600))
    }

    #[test]
    fn test_gigabyte_scenario() {
        let (_, ledger) = ledger(GIB, quiet_config());
        assert!(ledger.try_reserve(100 * MIB));
        assert_eq!(ledger.allocated(), 100 * MIB);

        // 100 + 950 + 95 margin > 1024
        assert!(!ledger.try_reserve(950 * MIB));
        assert_eq!(ledger.allocated(), 100 * MIB);

        ledger.release(100 * MIB);
        assert_eq!(ledger.allocated(), 0);
    }

    #[test]
    fn test_margin_is_clamped() {
        let (_, ledger) = ledger(GIB, quiet_config());
        assert_eq!(ledger.margin_for(1024), 4 * MIB);
        assert_eq!(ledger.margin_for(100 * MIB), 10 * MIB);
        assert_eq!(ledger.margin_for(10 * GIB), 256 * MIB);
    }

    #[test]
    fn test_inverted_margin_bounds_do_not_panic() {
        let config = LedgerConfig {
            min_margin_bytes: 512 * MIB,
            ..quiet_config()
        };
        let (_, ledger) = ledger(GIB, config);
        assert_eq!(ledger.margin_for(1), 256 * MIB);
        assert!(ledger.try_reserve(1));
        assert_eq!(ledger.allocated(), 1);
    }

    #[test]
    fn test_reservation_fits_up_to_margin() {
        let (_, ledger) = ledger(GIB, quiet_config());
        let b = 900 * MIB;
        assert!(b + ledger.margin_for(b) <= GIB);
        assert!(ledger.try_reserve(b));
        assert_eq!(ledger.allocated(), b);
        assert!(!ledger.try_reserve(GIB - b));
    }

    #[test]
    fn test_release_inverts_reserve_and_never_goes_negative() {
        let (_, ledger) = ledger(GIB, quiet_config());
        for bytes in [MIB, 3 * MIB, 17 * MIB] {
            assert!(ledger.try_reserve(bytes));
        }
        ledger.release(3 * MIB);
        assert_eq!(ledger.allocated(), 18 * MIB);
        ledger.release(100 * MIB);
        assert_eq!(ledger.allocated(), 0);
        ledger.release(1);
        assert_eq!(ledger.allocated(), 0);
    }

    #[test]
    fn test_rollback_does_not_count_as_release() {
        let (_, ledger) = ledger(GIB, quiet_config());
        assert!(ledger.try_reserve(8 * MIB));
        ledger.rollback(8 * MIB);
        let snap = ledger.snapshot();
        assert_eq!(snap.allocated, 0);
        assert_eq!(snap.release_count, 0);
    }

    #[test]
    fn test_denial_resets_backoff() {
        let (_, ledger) = ledger(GIB, quiet_config());
        for _ in 0..3 {
            ledger.release(0);
        }
        assert_eq!(ledger.snapshot().release_count, 3);
        assert!(!ledger.try_reserve(2 * GIB));
        let snap = ledger.snapshot();
        assert_eq!(snap.release_count, 0);
        assert_eq!(snap.refresh_interval, 8);
    }

    #[test]
    fn test_count_triggered_refresh_winds_up_interval() {
        let (accel, ledger) = ledger(GIB, quiet_config());
        let initial = ledger.snapshot();
        assert_eq!(initial.refreshes, 1);
        assert_eq!(initial.refresh_interval, 8);

        // Memory used outside the ledger shows up at the next refresh.
        let outside = accel.allocate(64 * MIB).unwrap();
        for _ in 0..7 {
            ledger.release(0);
        }
        assert_eq!(ledger.snapshot().refreshes, 1);
        ledger.release(0);

        let snap = ledger.snapshot();
        assert_eq!(snap.refreshes, 2);
        assert_eq!(snap.baseline_free, GIB - 64 * MIB);
        // 8 * (1 + log2(9)) = 32
        assert_eq!(snap.refresh_interval, 32);
        assert_eq!(snap.release_count, 0);
        accel.free(outside).unwrap();
    }

    #[test]
    fn test_interval_capped_at_max() {
        let config = quiet_config().with_refresh_intervals(512, 1024);
        let (_, ledger) = ledger(GIB, config);
        for _ in 0..512 {
            ledger.release(0);
        }
        // 512 * (1 + log2(513)) would exceed the cap.
        assert_eq!(ledger.snapshot().refresh_interval, 1024);
    }

    #[test]
    fn test_time_triggered_refresh() {
        let config = LedgerConfig::default().with_max_refresh_gap(Duration::ZERO);
        let (_, ledger) = ledger(GIB, config);
        assert!(ledger.try_reserve(MIB));
        std::thread::sleep(Duration::from_millis(2));
        ledger.release(0);
        let snap = ledger.snapshot();
        assert_eq!(snap.refreshes, 2);
        // Refresh resets the granted total.
        assert_eq!(snap.allocated, 0);
        // 8 * (1 + log2(2)) = 16
        assert_eq!(snap.refresh_interval, 16);
    }

    #[test]
    fn test_failed_refresh_keeps_previous_view() {
        let (accel, ledger) = ledger(GIB, quiet_config());
        assert!(ledger.try_reserve(MIB));
        accel.fail_mem_info(true);
        assert!(!ledger.refresh());
        let snap = ledger.snapshot();
        assert_eq!(snap.baseline_free, GIB);
        assert_eq!(snap.allocated, MIB);
    }

    #[test]
    fn test_concurrent_reservations_never_oversubscribe() {
        let (_, ledger) = ledger(GIB, quiet_config());
        let granted = std::sync::atomic::AtomicU64::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        if ledger.try_reserve(10 * MIB) {
                            granted.fetch_add(10 * MIB, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });
        let granted = granted.into_inner();
        assert_eq!(ledger.allocated(), granted);
        assert!(granted + ledger.margin_for(10 * MIB) <= GIB);
    }
}
