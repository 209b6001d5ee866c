//! Scoped release of device allocations.
//!
//! A [`DeviceAllocation`] is created for every successful device allocation
//! and owned by the tensor's device slot. It carries the raw pointer and size
//! by value, so releasing it never needs the tensor. Release runs at most
//! once: explicitly through [`DeviceAllocation::close`] or when the guard is
//! dropped with its tensor.

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use duplex_core::DevicePtr;

use crate::accelerator::Accelerator;
use crate::context::DeviceContext;

/// Owner of one live device allocation.
pub struct DeviceAllocation {
    ptr: DevicePtr,
    bytes: u64,
    accelerator: Arc<dyn Accelerator>,
    context: Weak<DeviceContext>,
}

impl DeviceAllocation {
    pub(crate) fn new(
        ptr: DevicePtr,
        bytes: u64,
        accelerator: Arc<dyn Accelerator>,
        context: Weak<DeviceContext>,
    ) -> Self {
        if let Ok(m) = duplex_metrics::metrics() {
            m.inc_live_allocations();
        }
        Self {
            ptr,
            bytes,
            accelerator,
            context,
        }
    }

    /// Device address, or null once closed.
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Size of the allocation in bytes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Whether the allocation has been released.
    pub fn is_closed(&self) -> bool {
        self.ptr.is_null()
    }

    /// Free the device memory and settle the bookkeeping.
    ///
    /// A failing native free is logged and otherwise ignored; the ledger and
    /// tracker are updated regardless. When the owning context is gone only
    /// the free runs. Calling this again does nothing.
    pub fn close(&mut self) {
        let ptr = std::mem::replace(&mut self.ptr, DevicePtr::NULL);
        if ptr.is_null() {
            return;
        }

        if let Err(e) = self.accelerator.free(ptr) {
            warn!("Failed to free device allocation {} ({} bytes): {}", ptr, self.bytes, e);
        }

        match self.context.upgrade() {
            Some(ctx) => {
                ctx.ledger().release(self.bytes);
                ctx.tracker().remove(ptr);
                debug!("Released device allocation {} ({} bytes)", ptr, self.bytes);
            }
            None => debug!(
                "Freed device allocation {} after its context was dropped",
                ptr
            ),
        }

        if let Ok(m) = duplex_metrics::metrics() {
            m.dec_live_allocations();
        }
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .field("accelerator", &self.accelerator.name())
            .finish()
    }
}
