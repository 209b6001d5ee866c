//! Host/device placement bookkeeping.
//!
//! The tracker keeps one [`PlacementStatus`] per live device pointer and a
//! registry of pointer tables by label. [`PlacementTracker::offer`] decides
//! whether a host-to-device copy is needed before a kernel reads a tensor;
//! [`PlacementTracker::reclaim_tensor`] pulls kernel output back to the host.
//!
//! Records are keyed by device address only. The tracker never owns a
//! tensor; records go away when the allocation's guard releases it.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use duplex_config::TrackerConfig;
use duplex_core::{format_bytes, DevicePtr, Error, Placement, Result, TransferDirection};

use crate::context::DeviceContext;
use crate::table::{self, PointerTable, TableAccess};
use crate::tensor::{Element, Tensor};

/// Placement and traffic of one device allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementStatus {
    /// Where the current bytes live.
    pub placement: Placement,

    /// Label given at the first offer.
    pub label: String,

    /// Host-to-device copies.
    pub uploads: u64,

    /// Device-to-host copies.
    pub downloads: u64,

    /// Bytes copied host-to-device.
    pub upload_bytes: u64,

    /// Bytes copied device-to-host.
    pub download_bytes: u64,
}

impl PlacementStatus {
    fn new(label: &str) -> Self {
        Self {
            placement: Placement::OnHost,
            label: label.to_string(),
            uploads: 0,
            downloads: 0,
            upload_bytes: 0,
            download_bytes: 0,
        }
    }

    fn reset_counters(&mut self) {
        self.uploads = 0;
        self.downloads = 0;
        self.upload_bytes = 0;
        self.download_bytes = 0;
    }
}

/// Counters of every tracked allocation plus totals.
#[derive(Debug, Clone, Default)]
pub struct PlacementReport {
    /// Records ordered by device address.
    pub entries: Vec<(DevicePtr, PlacementStatus)>,

    /// Sum of upload counts.
    pub total_uploads: u64,

    /// Sum of download counts.
    pub total_downloads: u64,

    /// Sum of uploaded bytes.
    pub total_upload_bytes: u64,

    /// Sum of downloaded bytes.
    pub total_download_bytes: u64,
}

impl PlacementReport {
    /// Record for `label`, if any.
    pub fn find(&self, label: &str) -> Option<&PlacementStatus> {
        self.entries
            .iter()
            .map(|(_, status)| status)
            .find(|status| status.label == label)
    }
}

impl fmt::Display for PlacementReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<18} {:<10} {:>8} {:>12} {:>8} {:>12}  label",
            "pointer", "state", "uploads", "up bytes", "downs", "down bytes"
        )?;
        for (ptr, status) in &self.entries {
            writeln!(
                f,
                "{:<18} {:<10} {:>8} {:>12} {:>8} {:>12}  {}",
                ptr.to_string(),
                status.placement.to_string(),
                status.uploads,
                status.upload_bytes,
                status.downloads,
                status.download_bytes,
                status.label
            )?;
        }
        write!(
            f,
            "total: {} uploads ({}), {} downloads ({})",
            self.total_uploads,
            format_bytes(self.total_upload_bytes),
            self.total_downloads,
            format_bytes(self.total_download_bytes)
        )
    }
}

/// Decides when host and device copies must be synchronized.
pub struct PlacementTracker {
    /// Logging policy.
    config: TrackerConfig,

    /// Serializes single-tensor offers.
    offer_lock: Mutex<()>,

    /// Records by device pointer.
    statuses: RwLock<AHashMap<DevicePtr, PlacementStatus>>,

    /// Pointer tables by label.
    tables: Mutex<AHashMap<String, Arc<PointerTable>>>,
}

impl PlacementTracker {
    /// Create an empty tracker.
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            offer_lock: Mutex::new(()),
            statuses: RwLock::new(AHashMap::new()),
            tables: Mutex::new(AHashMap::new()),
        }
    }

    /// Make the device copy of `tensor` current and return its pointer.
    ///
    /// Allocates on first use. Uploads when the device copy is absent or
    /// stale, or when `force` is set; otherwise this is a cache hit and no
    /// bytes move.
    pub fn offer<E: Element>(
        &self,
        ctx: &DeviceContext,
        tensor: &Tensor<E>,
        label: &str,
        force: bool,
    ) -> Result<DevicePtr> {
        let _serial = self.offer_lock.lock();
        let mut slot = tensor.device_slot();
        let (ptr, fresh) = slot.ensure_allocated(ctx, tensor.byte_len())?;

        let placement = if fresh {
            self.register(ptr, label);
            Placement::OnHost
        } else {
            let known = self.statuses.read().get(&ptr).map(|s| s.placement);
            match known {
                Some(placement) => placement,
                None => {
                    warn!(
                        "No placement record for '{}' at {}; adopting it as host-resident",
                        label, ptr
                    );
                    self.register(ptr, label);
                    Placement::OnHost
                }
            }
        };

        if placement != Placement::OnDevice || !slot.uploaded || force {
            tensor.upload_to(ctx, ptr, label)?;
            slot.uploaded = true;
            self.record(ptr, label, TransferDirection::HostToDevice, tensor.byte_len());
        } else if let Ok(m) = duplex_metrics::metrics() {
            m.record_offer_cache_hit();
        }
        Ok(ptr)
    }

    /// Offer every member, then make a pointer table over their current
    /// pointers available on the device.
    ///
    /// The table registered under `label` is rebuilt when any member pointer
    /// changed and reallocated when its own allocation was dropped. A table
    /// still held by an earlier caller is never rewritten; a new one replaces
    /// it in the registry and the old handle keeps its members.
    pub fn offer_table<E: Element>(
        &self,
        ctx: &DeviceContext,
        members: &[&Tensor<E>],
        label: &str,
        access: TableAccess,
        force: bool,
    ) -> Result<Arc<PointerTable>> {
        let mut tables = self.tables.lock();

        let snapshot = members
            .iter()
            .enumerate()
            .map(|(i, &member)| self.offer(ctx, member, &format!("{label}[{i}]"), force))
            .collect::<Result<Vec<_>>>()?;

        let cached = tables
            .get(label)
            .filter(|existing| existing.access() == access)
            .cloned();
        let table = match cached {
            Some(existing) if reusable(&existing, &snapshot) => existing,
            _ => {
                let built = Arc::new(PointerTable::build(label, access, &snapshot)?);
                tables.insert(label.to_string(), Arc::clone(&built));
                debug!("Registered pointer table '{}' over {} members", label, members.len());
                built
            }
        };

        {
            let mut inner = table.lock();
            if !table::matches(&inner, &snapshot) {
                table.rewrite(&mut inner, &snapshot)?;
                debug!("Rebuilt pointer table '{}' after a member moved", label);
            }
            self.offer(ctx, &*inner, label, force)?;
        }
        Ok(table)
    }

    /// Copy a table back from the device.
    pub fn reclaim(&self, ctx: &DeviceContext, table: &PointerTable) -> Result<()> {
        if table.is_read_only() {
            return Err(Error::protocol(format!(
                "pointer table '{}' is read-only and cannot be reclaimed",
                table.label()
            )));
        }
        let mut inner = table.lock();
        self.download(ctx, &mut *inner, table.label())
    }

    /// Copy a tensor's device bytes back into its host buffer.
    pub fn reclaim_tensor<E: Element>(
        &self,
        ctx: &DeviceContext,
        tensor: &mut Tensor<E>,
        label: &str,
    ) -> Result<()> {
        self.download(ctx, tensor, label)
    }

    /// Forget the record for `ptr`.
    pub fn remove(&self, ptr: DevicePtr) {
        if let Some(status) = self.statuses.write().remove(&ptr) {
            if self.config.log_transfers {
                debug!("Dropped placement record for '{}' at {}", status.label, ptr);
            }
        }
    }

    /// Copy of the record for `ptr`.
    pub fn status(&self, ptr: DevicePtr) -> Option<PlacementStatus> {
        self.statuses.read().get(&ptr).cloned()
    }

    /// Number of tracked allocations.
    pub fn tracked(&self) -> usize {
        self.statuses.read().len()
    }

    /// Number of registered pointer tables.
    pub fn table_count(&self) -> usize {
        self.tables.lock().len()
    }

    /// Snapshot of all records and totals.
    pub fn report(&self) -> PlacementReport {
        let statuses = self.statuses.read();
        let mut entries: Vec<_> = statuses
            .iter()
            .map(|(ptr, status)| (*ptr, status.clone()))
            .collect();
        drop(statuses);
        entries.sort_by_key(|(ptr, _)| *ptr);

        let mut report = PlacementReport::default();
        for (_, status) in &entries {
            report.total_uploads += status.uploads;
            report.total_downloads += status.downloads;
            report.total_upload_bytes += status.upload_bytes;
            report.total_download_bytes += status.download_bytes;
        }
        report.entries = entries;
        report
    }

    /// Zero every counter. Records and placements are kept.
    pub fn reset(&self) {
        for status in self.statuses.write().values_mut() {
            status.reset_counters();
        }
    }

    fn register(&self, ptr: DevicePtr, label: &str) {
        self.statuses.write().insert(ptr, PlacementStatus::new(label));
    }

    fn download<E: Element>(
        &self,
        ctx: &DeviceContext,
        tensor: &mut Tensor<E>,
        label: &str,
    ) -> Result<()> {
        tensor.copy_device_to_host(ctx, label)?;
        let slot = tensor.device_slot_mut();
        slot.uploaded = true;
        let ptr = slot.ptr();
        self.record(ptr, label, TransferDirection::DeviceToHost, tensor.byte_len());
        Ok(())
    }

    fn record(&self, ptr: DevicePtr, label: &str, direction: TransferDirection, bytes: u64) {
        {
            let mut statuses = self.statuses.write();
            let status = statuses.entry(ptr).or_insert_with(|| {
                warn!("No placement record for '{}' at {}; creating one", label, ptr);
                PlacementStatus::new(label)
            });
            status.placement = Placement::OnDevice;
            match direction {
                TransferDirection::HostToDevice => {
                    status.uploads += 1;
                    status.upload_bytes += bytes;
                }
                TransferDirection::DeviceToHost => {
                    status.downloads += 1;
                    status.download_bytes += bytes;
                }
            }
        }

        if self.config.log_transfers {
            debug!("{} {} bytes of '{}' at {}", direction, bytes, label, ptr);
        }
        if let Ok(m) = duplex_metrics::metrics() {
            m.record_transfer(direction.as_str(), bytes);
        }
    }
}

impl fmt::Debug for PlacementTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlacementTracker")
            .field("tracked", &self.tracked())
            .field("tables", &self.table_count())
            .finish()
    }
}

/// Whether a registered table can serve an offer over `members`: it already
/// lists them, or nobody outside the registry holds it.
fn reusable(cached: &Arc<PointerTable>, members: &[DevicePtr]) -> bool {
    // The registry's reference plus the clone taken for this offer.
    Arc::strong_count(cached) <= 2 || table::matches(&cached.lock(), members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::{Accelerator, SimulatedAccelerator};
    use crate::tensor::FloatTensor;
    use duplex_core::MIB;

    fn context() -> (Arc<SimulatedAccelerator>, Arc<DeviceContext>) {
        let accel = Arc::new(SimulatedAccelerator::new(256 * MIB));
        let ctx = DeviceContext::with_defaults(accel.clone());
        (accel, ctx)
    }

    #[test]
    fn test_first_offer_uploads_then_hits() {
        let (accel, ctx) = context();
        let x = FloatTensor::from_vec(vec![1.0, 2.0, 3.0]);

        let ptr = ctx.offer(&x, "x", false).unwrap();
        assert!(!ptr.is_null());
        assert!(x.is_uploaded());
        assert_eq!(accel.stats().uploads, 1);

        let again = ctx.offer(&x, "x", false).unwrap();
        assert_eq!(again, ptr);
        assert_eq!(accel.stats().uploads, 1);

        let status = ctx.tracker().status(ptr).unwrap();
        assert_eq!(status.placement, Placement::OnDevice);
        assert_eq!(status.uploads, 1);
        assert_eq!(status.upload_bytes, 12);
    }

    #[test]
    fn test_dirty_tensor_is_reuploaded() {
        let (accel, ctx) = context();
        let mut x = FloatTensor::from_vec(vec![1.0; 8]);
        let ptr = ctx.offer(&x, "x", false).unwrap();

        x.set(3, 5.0);
        assert!(!x.is_uploaded());
        assert_eq!(ctx.offer(&x, "x", false).unwrap(), ptr);
        assert_eq!(accel.stats().uploads, 2);
        assert_eq!(accel.read_f32(ptr).unwrap()[3], 5.0);
    }

    #[test]
    fn test_force_uploads_clean_tensor() {
        let (accel, ctx) = context();
        let x = FloatTensor::from_vec(vec![1.0; 4]);
        ctx.offer(&x, "x", false).unwrap();
        ctx.offer(&x, "x", true).unwrap();
        assert_eq!(accel.stats().uploads, 2);
    }

    #[test]
    fn test_missing_record_is_adopted() {
        let (accel, ctx) = context();
        let x = FloatTensor::from_vec(vec![2.0; 4]);
        let ptr = ctx.offer(&x, "x", false).unwrap();

        ctx.tracker().remove(ptr);
        assert!(ctx.tracker().status(ptr).is_none());

        ctx.offer(&x, "x", false).unwrap();
        let status = ctx.tracker().status(ptr).unwrap();
        assert_eq!(status.placement, Placement::OnDevice);
        assert_eq!(status.uploads, 1);
        assert_eq!(accel.stats().uploads, 2);
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let (_, ctx) = context();
        let values: Vec<f32> = (0..37).map(|i| i as f32 * 0.37 - 3.0).collect();
        let mut x = FloatTensor::from_vec(values.clone());
        ctx.offer(&x, "x", false).unwrap();

        ctx.reclaim_tensor(&mut x, "x").unwrap();
        assert_eq!(x.as_slice(), values.as_slice());
        assert!(x.is_uploaded());

        let status = ctx.tracker().status(x.device_ptr_or_null()).unwrap();
        assert_eq!(status.downloads, 1);
        assert_eq!(status.download_bytes, 37 * 4);
    }

    #[test]
    fn test_reclaim_sees_kernel_output() {
        let (accel, ctx) = context();
        let mut x = FloatTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let ptr = ctx.offer(&x, "x", false).unwrap();
        accel.softmax(ptr, 0, 4).unwrap();

        ctx.reclaim_tensor(&mut x, "x").unwrap();
        let sum: f32 = x.as_slice().iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_reclaim_protocol_errors() {
        let (_, ctx) = context();
        let mut unallocated = FloatTensor::zeros(4);
        let err = ctx.reclaim_tensor(&mut unallocated, "u").unwrap_err();
        assert!(err.is_protocol_violation());

        let mut weights = FloatTensor::from_vec_immutable(vec![1.0; 4]);
        ctx.offer(&weights, "w", false).unwrap();
        let err = ctx.reclaim_tensor(&mut weights, "w").unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_table_tracks_member_pointers() {
        let (_, ctx) = context();
        let a = FloatTensor::from_vec(vec![1.0; 4]);
        let b = FloatTensor::from_vec(vec![2.0; 4]);
        let c = FloatTensor::from_vec(vec![3.0; 4]);

        let table = ctx
            .offer_table(&[&a, &b, &c], "abc", TableAccess::ReadOnly, false)
            .unwrap();
        assert_eq!(
            table.entries(),
            vec![a.device_ptr_or_null(), b.device_ptr_or_null(), c.device_ptr_or_null()]
        );
        assert!(table.is_uploaded());
        assert_eq!(ctx.tracker().table_count(), 1);

        // Reallocating a member forces a rebuild.
        let old_a = a.device_ptr_or_null();
        assert!(a.free_device());
        let again = ctx
            .offer_table(&[&a, &b, &c], "abc", TableAccess::ReadOnly, false)
            .unwrap();
        let new_a = a.device_ptr_or_null();
        assert_ne!(new_a, old_a);
        assert_eq!(again.entries()[0], new_a);
        assert!(again.is_uploaded());
        // `table` is still held, so the rebuild went into a fresh table.
        assert!(!Arc::ptr_eq(&table, &again));
        assert_eq!(table.entries()[0], old_a);
        assert_eq!(ctx.tracker().table_count(), 1);
    }

    #[test]
    fn test_unheld_table_is_rewritten_in_place() {
        let (_, ctx) = context();
        let a = FloatTensor::from_vec(vec![1.0; 4]);
        let b = FloatTensor::from_vec(vec![2.0; 4]);

        let first = ctx
            .offer_table(&[&a], "t", TableAccess::ReadOnly, false)
            .unwrap();
        let table_ptr = first.device_ptr();
        drop(first);

        let second = ctx
            .offer_table(&[&b], "t", TableAccess::ReadOnly, false)
            .unwrap();
        assert_eq!(second.device_ptr(), table_ptr);
        assert_eq!(second.entries(), vec![b.device_ptr_or_null()]);
    }

    #[test]
    fn test_held_table_keeps_members_under_reused_label() {
        let (accel, ctx) = context();
        let a = FloatTensor::from_vec(vec![1.0; 4]);
        let b = FloatTensor::from_vec(vec![2.0; 4]);

        let first = ctx
            .offer_table(&[&a], "rope.queries", TableAccess::ReadOnly, false)
            .unwrap();
        let second = ctx
            .offer_table(&[&b], "rope.queries", TableAccess::ReadOnly, false)
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.device_ptr(), second.device_ptr());

        let mut word = [0u8; 8];
        accel
            .copy_device_to_host(first.device_ptr(), &mut word)
            .unwrap();
        assert_eq!(u64::from_ne_bytes(word), a.device_ptr_or_null().addr());
        accel
            .copy_device_to_host(second.device_ptr(), &mut word)
            .unwrap();
        assert_eq!(u64::from_ne_bytes(word), b.device_ptr_or_null().addr());

        assert_eq!(first.entries(), vec![a.device_ptr_or_null()]);
        assert_eq!(ctx.tracker().table_count(), 1);
    }

    #[test]
    fn test_unchanged_table_is_a_cache_hit() {
        let (accel, ctx) = context();
        let a = FloatTensor::from_vec(vec![1.0; 4]);
        let b = FloatTensor::from_vec(vec![2.0; 4]);
        ctx.offer_table(&[&a, &b], "ab", TableAccess::Mutable, false)
            .unwrap();
        let uploads = accel.stats().uploads;
        ctx.offer_table(&[&a, &b], "ab", TableAccess::Mutable, false)
            .unwrap();
        assert_eq!(accel.stats().uploads, uploads);
    }

    #[test]
    fn test_table_reallocated_after_free() {
        let (accel, ctx) = context();
        let a = FloatTensor::from_vec(vec![1.0; 4]);
        let table = ctx
            .offer_table(&[&a], "a", TableAccess::Mutable, false)
            .unwrap();
        let old = table.device_ptr();
        assert!(table.free_device());
        assert!(ctx.tracker().status(old).is_none());

        ctx.offer_table(&[&a], "a", TableAccess::Mutable, false)
            .unwrap();
        let new = table.device_ptr();
        assert!(!new.is_null());
        assert_ne!(new, old);
        let stored = accel.allocation_size(new).unwrap();
        assert_eq!(stored, 8);
    }

    #[test]
    fn test_reclaim_table() {
        let (_, ctx) = context();
        let a = FloatTensor::from_vec(vec![1.0; 4]);
        let b = FloatTensor::from_vec(vec![2.0; 4]);

        let read_only = ctx
            .offer_table(&[&a, &b], "ro", TableAccess::ReadOnly, false)
            .unwrap();
        assert!(ctx.reclaim(&read_only).unwrap_err().is_protocol_violation());

        let mutable = ctx
            .offer_table(&[&a, &b], "rw", TableAccess::Mutable, false)
            .unwrap();
        let before = mutable.entries();
        ctx.reclaim(&mutable).unwrap();
        assert_eq!(mutable.entries(), before);
    }

    #[test]
    fn test_table_with_unplaceable_member() {
        let (_, ctx) = context();
        let a = FloatTensor::from_vec(vec![1.0; 4]);
        let empty = FloatTensor::zeros(0);
        assert!(ctx
            .offer_table(&[&a, &empty], "bad", TableAccess::ReadOnly, false)
            .is_err());
        assert_eq!(ctx.tracker().table_count(), 0);
    }

    #[test]
    fn test_report_and_reset() {
        let (_, ctx) = context();
        let a = FloatTensor::from_vec(vec![1.0; 4]);
        let b = FloatTensor::from_vec(vec![1.0; 2]);
        ctx.offer(&a, "a", false).unwrap();
        ctx.offer(&b, "b", false).unwrap();

        let report = ctx.report();
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.total_uploads, 2);
        assert_eq!(report.total_upload_bytes, 24);
        assert!(report.entries.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(report.find("b").unwrap().upload_bytes, 8);
        assert!(report.to_string().contains("total: 2 uploads"));

        ctx.reset();
        let report = ctx.report();
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.total_uploads, 0);
        assert_eq!(report.find("a").unwrap().placement, Placement::OnDevice);
    }

    #[test]
    fn test_dropping_tensor_removes_record() {
        let (accel, ctx) = context();
        let ptr = {
            let x = FloatTensor::from_vec(vec![1.0; 16]);
            ctx.offer(&x, "x", false).unwrap()
        };
        assert!(ctx.tracker().status(ptr).is_none());
        assert_eq!(accel.live_allocations(), 0);
        assert_eq!(ctx.ledger().allocated(), 0);
    }
}
