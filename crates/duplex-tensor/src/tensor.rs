//! Host tensors with an optional device mirror.
//!
//! A [`Tensor`] owns a contiguous host buffer of fixed-width elements and, at
//! most, one device allocation of exactly `len * element size` bytes. The
//! `uploaded` flag is true only while host and device bytes are known to be
//! identical; every host-side write through `&mut self` clears it.

use std::fmt;

use bytemuck::Pod;
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use duplex_core::{DevicePtr, ElementKind, Error, Result, TransferDirection};

use crate::context::DeviceContext;
use crate::reclaim::DeviceAllocation;

/// A fixed-width element that can live on the device.
pub trait Element: Pod + Default + Send + Sync + PartialEq + fmt::Debug + 'static {
    /// Encoding tag of this element type.
    const KIND: ElementKind;
}

impl Element for f32 {
    const KIND: ElementKind = ElementKind::F32;
}

impl Element for i32 {
    const KIND: ElementKind = ElementKind::I32;
}

impl Element for u8 {
    const KIND: ElementKind = ElementKind::U8;
}

impl Element for u64 {
    const KIND: ElementKind = ElementKind::Pointer;
}

/// Float32 tensor.
pub type FloatTensor = Tensor<f32>;

/// Int32 tensor (token ids).
pub type IntTensor = Tensor<i32>;

/// Byte tensor (string payloads).
pub type ByteTensor = Tensor<u8>;

/// Tensor of raw device addresses.
pub type PointerTensor = Tensor<u64>;

/// Device side of a tensor.
#[derive(Debug, Default)]
pub(crate) struct DeviceSlot {
    pub(crate) allocation: Option<DeviceAllocation>,
    pub(crate) uploaded: bool,
}

impl DeviceSlot {
    pub(crate) fn ptr(&self) -> DevicePtr {
        self.allocation
            .as_ref()
            .map(DeviceAllocation::ptr)
            .unwrap_or(DevicePtr::NULL)
    }

    /// Allocate `bytes` if there is no allocation yet. Returns the pointer and
    /// whether it is new.
    pub(crate) fn ensure_allocated(
        &mut self,
        ctx: &DeviceContext,
        bytes: u64,
    ) -> Result<(DevicePtr, bool)> {
        if let Some(allocation) = &self.allocation {
            return Ok((allocation.ptr(), false));
        }
        if bytes == 0 {
            return Err(Error::tensor("cannot place an empty tensor on the device"));
        }
        let allocation = ctx.allocate(bytes)?;
        let ptr = allocation.ptr();
        self.allocation = Some(allocation);
        self.uploaded = false;
        Ok((ptr, true))
    }
}

/// Host buffer of `E` with an optional device allocation.
pub struct Tensor<E: Element> {
    data: Vec<E>,
    immutable: bool,
    device: Mutex<DeviceSlot>,
}

impl<E: Element> Tensor<E> {
    /// Zero-filled tensor of `len` elements.
    pub fn zeros(len: usize) -> Self {
        Self::from_vec(vec![E::default(); len])
    }

    /// Zero-filled tensor holding the product of `dims` elements.
    pub fn with_shape(dims: &[usize]) -> Result<Self> {
        let len = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| Error::tensor(format!("element count of {dims:?} overflows")))?;
        Ok(Self::zeros(len))
    }

    /// Wrap an existing buffer.
    pub fn from_vec(data: Vec<E>) -> Self {
        Self {
            data,
            immutable: false,
            device: Mutex::new(DeviceSlot::default()),
        }
    }

    /// Wrap a buffer whose contents never change (model weights). Immutable
    /// tensors are never downloaded into.
    pub fn from_vec_immutable(data: Vec<E>) -> Self {
        Self {
            immutable: true,
            ..Self::from_vec(data)
        }
    }

    /// Copy a slice into a new tensor.
    pub fn from_slice(data: &[E]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element encoding.
    pub fn kind(&self) -> ElementKind {
        E::KIND
    }

    /// Size of the host buffer and of any device allocation, in bytes.
    pub fn byte_len(&self) -> u64 {
        (self.data.len() * E::KIND.size_in_bytes()) as u64
    }

    /// Whether the tensor was created immutable.
    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    /// Element at `index`.
    #[inline]
    pub fn get(&self, index: usize) -> E {
        self.data[index]
    }

    /// Overwrite the element at `index`, marking the device copy stale.
    #[inline]
    pub fn set(&mut self, index: usize, value: E) {
        self.set_modified();
        self.data[index] = value;
    }

    /// Host elements.
    #[inline]
    pub fn as_slice(&self) -> &[E] {
        &self.data
    }

    /// Mutable host elements. Marks the device copy stale.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [E] {
        self.set_modified();
        &mut self.data
    }

    /// Host bytes.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    /// Take the host buffer, releasing any device allocation.
    pub fn into_vec(self) -> Vec<E> {
        self.data
    }

    /// Flag the device copy as stale.
    #[inline]
    pub fn set_modified(&mut self) {
        self.device.get_mut().uploaded = false;
    }

    /// Whether host and device bytes are known to match.
    pub fn is_uploaded(&self) -> bool {
        self.device.lock().uploaded
    }

    /// Whether a device allocation exists.
    pub fn is_allocated(&self) -> bool {
        self.device.lock().allocation.is_some()
    }

    /// Device pointer, or null when not allocated.
    pub fn device_ptr_or_null(&self) -> DevicePtr {
        self.device.lock().ptr()
    }

    /// Allocate device memory for this tensor without uploading.
    ///
    /// Returns the existing pointer if already allocated. A ledger denial
    /// surfaces as [`Error::Admission`].
    pub fn allocate_device(&self, ctx: &DeviceContext) -> Result<DevicePtr> {
        let mut slot = self.device.lock();
        let (ptr, _) = slot.ensure_allocated(ctx, self.byte_len())?;
        Ok(ptr)
    }

    /// Release the device allocation now. Returns false if there was none.
    pub fn free_device(&self) -> bool {
        let taken = {
            let mut slot = self.device.lock();
            slot.uploaded = false;
            slot.allocation.take()
        };
        match taken {
            Some(mut allocation) => {
                allocation.close();
                true
            }
            None => false,
        }
    }

    /// Copy host bytes to the device allocation. Placement flags are left to
    /// the caller.
    pub fn copy_host_to_device(&self, ctx: &DeviceContext, label: &str) -> Result<()> {
        let ptr = self.device.lock().ptr();
        self.upload_to(ctx, ptr, label)
    }

    /// Copy device bytes back into the host buffer. Placement flags are left
    /// to the caller.
    pub fn copy_device_to_host(&mut self, ctx: &DeviceContext, label: &str) -> Result<()> {
        if self.immutable {
            return Err(Error::protocol(format!(
                "'{label}' is immutable and cannot be overwritten from the device"
            )));
        }
        let ptr = self.device.get_mut().ptr();
        if ptr.is_null() {
            return Err(Error::protocol(format!(
                "'{label}' has no device allocation to copy from"
            )));
        }
        let storage = self.describe_storage();
        ctx.accelerator()
            .copy_device_to_host(ptr, bytemuck::cast_slice_mut(&mut self.data))
            .map_err(|e| Error::transfer(label, TransferDirection::DeviceToHost, storage, e))?;
        debug!("Copied {} bytes of '{}' from device {}", self.byte_len(), label, ptr);
        Ok(())
    }

    /// Human-readable description of the backing storage.
    pub fn describe_storage(&self) -> String {
        format!(
            "{} x {} ({} bytes{})",
            self.data.len(),
            E::KIND,
            self.byte_len(),
            if self.immutable { ", immutable" } else { "" }
        )
    }

    pub(crate) fn device_slot(&self) -> MutexGuard<'_, DeviceSlot> {
        self.device.lock()
    }

    pub(crate) fn device_slot_mut(&mut self) -> &mut DeviceSlot {
        self.device.get_mut()
    }

    /// Upload host bytes to `ptr` without touching the slot lock.
    pub(crate) fn upload_to(&self, ctx: &DeviceContext, ptr: DevicePtr, label: &str) -> Result<()> {
        if ptr.is_null() {
            return Err(Error::protocol(format!(
                "'{label}' has no device allocation to copy into"
            )));
        }
        ctx.accelerator()
            .copy_host_to_device(self.as_bytes(), ptr)
            .map_err(|e| {
                Error::transfer(
                    label,
                    TransferDirection::HostToDevice,
                    self.describe_storage(),
                    e,
                )
            })?;
        debug!("Copied {} bytes of '{}' to device {}", self.byte_len(), label, ptr);
        Ok(())
    }
}

impl<E: Element> Clone for Tensor<E> {
    /// Clones host data only; the copy starts without a device allocation.
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            immutable: self.immutable,
            device: Mutex::new(DeviceSlot::default()),
        }
    }
}

impl<E: Element> From<Vec<E>> for Tensor<E> {
    fn from(data: Vec<E>) -> Self {
        Self::from_vec(data)
    }
}

impl<E: Element> fmt::Debug for Tensor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.device.lock();
        f.debug_struct("Tensor")
            .field("kind", &E::KIND)
            .field("len", &self.data.len())
            .field("immutable", &self.immutable)
            .field("device_ptr", &slot.ptr())
            .field("uploaded", &slot.uploaded)
            .finish()
    }
}

impl ByteTensor {
    /// Byte tensor holding the UTF-8 encoding of `text`.
    pub fn from_str_bytes(text: &str) -> Self {
        Self::from_vec(text.as_bytes().to_vec())
    }

    /// Host bytes as text, replacing invalid sequences.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_len_matches_kind() {
        assert_eq!(FloatTensor::zeros(10).byte_len(), 40);
        assert_eq!(IntTensor::zeros(10).byte_len(), 40);
        assert_eq!(ByteTensor::zeros(10).byte_len(), 10);
        assert_eq!(PointerTensor::zeros(10).byte_len(), 80);
        assert_eq!(PointerTensor::zeros(1).kind(), ElementKind::Pointer);
    }

    #[test]
    fn test_with_shape() {
        assert_eq!(FloatTensor::with_shape(&[4, 8, 2]).unwrap().len(), 64);
        assert!(FloatTensor::with_shape(&[usize::MAX, 2]).is_err());
    }

    #[test]
    fn test_host_writes_clear_uploaded() {
        let mut t = FloatTensor::zeros(4);
        t.device_slot_mut().uploaded = true;
        assert!(t.is_uploaded());
        t.set(0, 1.0);
        assert!(!t.is_uploaded());

        t.device_slot_mut().uploaded = true;
        t.as_mut_slice()[1] = 2.0;
        assert!(!t.is_uploaded());
        assert_eq!(t.as_slice(), &[1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_unallocated_tensor() {
        let t = FloatTensor::from_vec(vec![1.0, 2.0]);
        assert!(!t.is_allocated());
        assert!(t.device_ptr_or_null().is_null());
        assert!(!t.free_device());
    }

    #[test]
    fn test_clone_drops_device_state() {
        let mut t = FloatTensor::from_vec_immutable(vec![3.0; 3]);
        t.device_slot_mut().uploaded = true;
        let c = t.clone();
        assert!(c.is_immutable());
        assert!(!c.is_uploaded());
        assert_eq!(c.as_slice(), t.as_slice());
    }

    #[test]
    fn test_byte_tensor_text() {
        let t = ByteTensor::from_str_bytes("héllo");
        assert_eq!(t.len(), 6);
        assert_eq!(t.to_string_lossy(), "héllo");
    }

    #[test]
    fn test_describe_storage() {
        let t = FloatTensor::from_vec_immutable(vec![0.0; 8]);
        assert_eq!(t.describe_storage(), "8 x f32 (32 bytes, immutable)");
    }
}
