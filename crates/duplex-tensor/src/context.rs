//! The explicitly constructed home of the ledger and the tracker.
//!
//! A [`DeviceContext`] ties one accelerator to its [`MemoryLedger`] and
//! [`PlacementTracker`]. It is shared through `Arc`; device allocations hold
//! only a weak handle back to it, so tensors may outlive the context.

use std::sync::{Arc, Weak};

use tracing::{debug, info};

use duplex_config::{LedgerConfig, TrackerConfig};
use duplex_core::{DevicePtr, Error, Result};

use crate::accelerator::Accelerator;
use crate::ledger::MemoryLedger;
use crate::placement::{PlacementReport, PlacementTracker};
use crate::reclaim::DeviceAllocation;
use crate::table::{PointerTable, TableAccess};
use crate::tensor::{Element, Tensor};

/// Accelerator, ledger and tracker of one device.
pub struct DeviceContext {
    accelerator: Arc<dyn Accelerator>,
    ledger: MemoryLedger,
    tracker: PlacementTracker,
    this: Weak<DeviceContext>,
}

impl DeviceContext {
    /// Create a context. The ledger takes its first memory reading here.
    pub fn new(
        accelerator: Arc<dyn Accelerator>,
        ledger: LedgerConfig,
        tracker: TrackerConfig,
    ) -> Arc<Self> {
        info!("Creating device context on {}", accelerator.name());
        Arc::new_cyclic(|this| Self {
            ledger: MemoryLedger::new(Arc::clone(&accelerator), ledger),
            tracker: PlacementTracker::new(tracker),
            accelerator,
            this: this.clone(),
        })
    }

    /// Create a context with default ledger and tracker settings.
    pub fn with_defaults(accelerator: Arc<dyn Accelerator>) -> Arc<Self> {
        Self::new(accelerator, LedgerConfig::default(), TrackerConfig::default())
    }

    /// The accelerator.
    pub fn accelerator(&self) -> &Arc<dyn Accelerator> {
        &self.accelerator
    }

    /// The memory ledger.
    pub fn ledger(&self) -> &MemoryLedger {
        &self.ledger
    }

    /// The placement tracker.
    pub fn tracker(&self) -> &PlacementTracker {
        &self.tracker
    }

    /// Reserve and allocate `bytes` of device memory.
    ///
    /// A ledger denial is an [`Error::Admission`]; the allocator is not
    /// called. An allocator failure after admission returns the reservation
    /// and surfaces as [`Error::Allocation`].
    pub fn allocate(&self, bytes: u64) -> Result<DeviceAllocation> {
        if !self.ledger.try_reserve(bytes) {
            return Err(Error::admission(bytes, self.ledger.available()));
        }

        match self.accelerator.allocate(bytes) {
            Ok(ptr) if !ptr.is_null() => {
                debug!("Allocated {} bytes at {}", bytes, ptr);
                Ok(DeviceAllocation::new(
                    ptr,
                    bytes,
                    Arc::clone(&self.accelerator),
                    self.this.clone(),
                ))
            }
            Ok(_) => {
                self.allocation_failed(bytes);
                Err(Error::allocation("allocator returned a null pointer", bytes))
            }
            Err(e) => {
                self.allocation_failed(bytes);
                Err(Error::allocation_with_source(bytes, e))
            }
        }
    }

    /// See [`PlacementTracker::offer`].
    pub fn offer<E: Element>(&self, tensor: &Tensor<E>, label: &str, force: bool) -> Result<DevicePtr> {
        self.tracker.offer(self, tensor, label, force)
    }

    /// See [`PlacementTracker::offer_table`].
    pub fn offer_table<E: Element>(
        &self,
        members: &[&Tensor<E>],
        label: &str,
        access: TableAccess,
        force: bool,
    ) -> Result<Arc<PointerTable>> {
        self.tracker.offer_table(self, members, label, access, force)
    }

    /// See [`PlacementTracker::reclaim`].
    pub fn reclaim(&self, table: &PointerTable) -> Result<()> {
        self.tracker.reclaim(self, table)
    }

    /// See [`PlacementTracker::reclaim_tensor`].
    pub fn reclaim_tensor<E: Element>(&self, tensor: &mut Tensor<E>, label: &str) -> Result<()> {
        self.tracker.reclaim_tensor(self, tensor, label)
    }

    /// Placement counters.
    pub fn report(&self) -> PlacementReport {
        self.tracker.report()
    }

    /// Zero placement counters.
    pub fn reset(&self) {
        self.tracker.reset()
    }

    fn allocation_failed(&self, bytes: u64) {
        self.ledger.rollback(bytes);
        self.ledger.on_allocation_failure();
        if let Ok(m) = duplex_metrics::metrics() {
            m.record_allocation_failure();
        }
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("accelerator", &self.accelerator.name())
            .field("ledger", &self.ledger)
            .field("tracker", &self.tracker)
            .finish()
    }
}
