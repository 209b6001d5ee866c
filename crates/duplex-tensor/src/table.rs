//! Device-resident tables of device pointers.
//!
//! Batched kernels take one argument per batch (a list of query vectors, say)
//! as a device buffer holding the device address of every member. A
//! [`PointerTable`] is that buffer. It is only valid while every member is
//! allocated and current, so the tracker rebuilds it whenever a member
//! pointer changes.

use parking_lot::{Mutex, MutexGuard};

use duplex_core::{DevicePtr, Error, Result};

use crate::tensor::PointerTensor;

/// How kernels may use a pointer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableAccess {
    /// Kernels only read through the table; it can never be reclaimed.
    ReadOnly,
    /// Kernels may write the table on the device.
    Mutable,
}

/// A labelled device pointer table.
pub struct PointerTable {
    label: String,
    access: TableAccess,
    inner: Mutex<PointerTensor>,
}

impl PointerTable {
    /// Build a table over `members`. Fails if any member has no device
    /// allocation.
    pub(crate) fn build(
        label: impl Into<String>,
        access: TableAccess,
        members: &[DevicePtr],
    ) -> Result<Self> {
        let label = label.into();
        let entries = encode(&label, members)?;
        let tensor = match access {
            TableAccess::ReadOnly => PointerTensor::from_vec_immutable(entries),
            TableAccess::Mutable => PointerTensor::from_vec(entries),
        };
        Ok(Self {
            label,
            access,
            inner: Mutex::new(tensor),
        })
    }

    /// Label the table is registered under.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Access mode.
    pub fn access(&self) -> TableAccess {
        self.access
    }

    /// Whether kernels may only read the table.
    pub fn is_read_only(&self) -> bool {
        self.access == TableAccess::ReadOnly
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the table has no members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Member pointers as stored on the host.
    pub fn entries(&self) -> Vec<DevicePtr> {
        self.inner
            .lock()
            .as_slice()
            .iter()
            .map(|&addr| DevicePtr::new(addr))
            .collect()
    }

    /// Device address of the table itself, or null.
    pub fn device_ptr(&self) -> DevicePtr {
        self.inner.lock().device_ptr_or_null()
    }

    /// Whether the table has a device allocation.
    pub fn is_allocated(&self) -> bool {
        self.inner.lock().is_allocated()
    }

    /// Whether the device copy matches the host entries.
    pub fn is_uploaded(&self) -> bool {
        self.inner.lock().is_uploaded()
    }

    /// Release the table's device allocation.
    pub fn free_device(&self) -> bool {
        self.inner.lock().free_device()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PointerTensor> {
        self.inner.lock()
    }

    /// Overwrite the entries with `members`. A change in member count
    /// replaces the tensor, dropping its device allocation.
    pub(crate) fn rewrite(&self, tensor: &mut PointerTensor, members: &[DevicePtr]) -> Result<()> {
        let entries = encode(&self.label, members)?;
        if tensor.len() == entries.len() {
            tensor.as_mut_slice().copy_from_slice(&entries);
        } else {
            *tensor = match self.access {
                TableAccess::ReadOnly => PointerTensor::from_vec_immutable(entries),
                TableAccess::Mutable => PointerTensor::from_vec(entries),
            };
        }
        Ok(())
    }
}

/// Whether `tensor` already holds exactly `members`.
pub(crate) fn matches(tensor: &PointerTensor, members: &[DevicePtr]) -> bool {
    tensor.len() == members.len()
        && tensor
            .as_slice()
            .iter()
            .zip(members)
            .all(|(&addr, ptr)| addr == ptr.addr())
}

fn encode(label: &str, members: &[DevicePtr]) -> Result<Vec<u64>> {
    members
        .iter()
        .enumerate()
        .map(|(i, ptr)| {
            ptr.non_null().map(|p| p.addr()).ok_or_else(|| {
                Error::protocol(format!(
                    "member {i} of pointer table '{label}' has no device allocation"
                ))
            })
        })
        .collect()
}

impl std::fmt::Debug for PointerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointerTable")
            .field("label", &self.label)
            .field("access", &self.access)
            .field("entries", &self.entries())
            .field("device_ptr", &self.device_ptr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptrs(addrs: &[u64]) -> Vec<DevicePtr> {
        addrs.iter().copied().map(DevicePtr::new).collect()
    }

    #[test]
    fn test_build_rejects_null_member() {
        let err = PointerTable::build("qs", TableAccess::ReadOnly, &ptrs(&[0x100, 0, 0x300]))
            .unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(err.to_string().contains("member 1"));
    }

    #[test]
    fn test_entries_and_matching() {
        let table = PointerTable::build("qs", TableAccess::Mutable, &ptrs(&[0x100, 0x200])).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.entries(), ptrs(&[0x100, 0x200]));
        assert!(!table.is_read_only());
        assert!(!table.is_allocated());
        assert!(table.device_ptr().is_null());

        let guard = table.lock();
        assert!(matches(&guard, &ptrs(&[0x100, 0x200])));
        assert!(!matches(&guard, &ptrs(&[0x100, 0x280])));
        assert!(!matches(&guard, &ptrs(&[0x100])));
    }

    #[test]
    fn test_rewrite_keeps_access_mode() {
        let table = PointerTable::build("ks", TableAccess::ReadOnly, &ptrs(&[0x100])).unwrap();
        {
            let mut guard = table.lock();
            table.rewrite(&mut guard, &ptrs(&[0x500, 0x600])).unwrap();
            assert!(guard.is_immutable());
        }
        assert_eq!(table.entries(), ptrs(&[0x500, 0x600]));

        let mut guard = table.lock();
        assert!(table.rewrite(&mut guard, &ptrs(&[0x500, 0])).is_err());
    }
}
