//! Device memory emulated in host memory.
//!
//! Used by tests and on hosts without an accelerator. Capacity is enforced,
//! addresses are never reused, and every call can be made to fail on demand.
//! Kernels run the same slice arithmetic as the host kernels.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use duplex_core::{DevicePtr, Error, MemInfo, Result};

use super::{
    Accelerator, KernelOperand, MatmulLaunch, RmsNormLaunch, RopeLaunch, ScoreLaunch,
    WeightedSumLaunch,
};
use crate::kernels::{rmsnorm_slices, rope_slices, score_slices, weighted_slices};
use crate::ops::{dot_slices, softmax_slice};

const BASE_ADDRESS: u64 = 0x1000_0000;
const ALIGNMENT: u64 = 256;

/// Faults raised by the simulated device.
#[derive(Error, Debug)]
pub enum SimulatedFault {
    /// A failure requested through one of the `fail_*` switches.
    #[error("injected {0} failure")]
    Injected(&'static str),

    /// Not enough capacity left.
    #[error("out of device memory: requested {requested} bytes, {free} free")]
    OutOfMemory {
        /// Requested bytes
        requested: u64,
        /// Free bytes
        free: u64,
    },

    /// The address is not the base of a live allocation.
    #[error("unknown device pointer {0}")]
    UnknownPointer(DevicePtr),

    /// An access ran past the end of an allocation.
    #[error("access of {len} at offset {offset} exceeds {size} at {ptr}")]
    OutOfBounds {
        /// Allocation accessed
        ptr: DevicePtr,
        /// Start of the access
        offset: usize,
        /// Length of the access
        len: usize,
        /// Size of the allocation in the same unit
        size: usize,
    },

    /// The operand format is not dense f32.
    #[error("unsupported operand format code {0}")]
    UnsupportedFormat(i32),
}

impl From<SimulatedFault> for Error {
    fn from(fault: SimulatedFault) -> Self {
        Error::device_with_source("simulated accelerator", fault)
    }
}

/// Call counters of a [`SimulatedAccelerator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedStats {
    /// Successful allocations.
    pub allocations: u64,
    /// Successful frees.
    pub frees: u64,
    /// Host-to-device copies.
    pub uploads: u64,
    /// Device-to-host copies.
    pub downloads: u64,
    /// Bytes copied host-to-device.
    pub upload_bytes: u64,
    /// Bytes copied device-to-host.
    pub download_bytes: u64,
    /// Kernel launches.
    pub kernel_launches: u64,
}

struct DeviceBuffer {
    // u64 words keep every buffer 8-byte aligned for pointer tables.
    words: Vec<u64>,
    len: usize,
}

impl DeviceBuffer {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(8)],
            len,
        }
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }

    fn floats(&self) -> &[f32] {
        &bytemuck::cast_slice(&self.words)[..self.len / 4]
    }

    fn floats_mut(&mut self) -> &mut [f32] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len / 4]
    }

    fn pointers(&self) -> &[u64] {
        &self.words[..self.len / 8]
    }
}

#[derive(Default)]
struct DeviceMemory {
    buffers: AHashMap<u64, DeviceBuffer>,
    used: u64,
    next_addr: u64,
}

impl DeviceMemory {
    fn buffer(&self, ptr: DevicePtr) -> std::result::Result<&DeviceBuffer, SimulatedFault> {
        self.buffers
            .get(&ptr.addr())
            .ok_or(SimulatedFault::UnknownPointer(ptr))
    }

    fn buffer_mut(
        &mut self,
        ptr: DevicePtr,
    ) -> std::result::Result<&mut DeviceBuffer, SimulatedFault> {
        self.buffers
            .get_mut(&ptr.addr())
            .ok_or(SimulatedFault::UnknownPointer(ptr))
    }

    /// Copy `len` floats of an f32 operand.
    fn read(&self, op: KernelOperand, len: usize) -> std::result::Result<Vec<f32>, SimulatedFault> {
        if !op.is_f32() {
            return Err(SimulatedFault::UnsupportedFormat(op.format.code));
        }
        self.read_floats(op.ptr, op.offset, len)
    }

    fn read_floats(
        &self,
        ptr: DevicePtr,
        offset: usize,
        len: usize,
    ) -> std::result::Result<Vec<f32>, SimulatedFault> {
        let floats = self.buffer(ptr)?.floats();
        window(floats, ptr, offset, len).map(<[f32]>::to_vec)
    }

    fn write_floats(
        &mut self,
        ptr: DevicePtr,
        offset: usize,
        values: &[f32],
    ) -> std::result::Result<(), SimulatedFault> {
        let floats = self.buffer_mut(ptr)?.floats_mut();
        let size = floats.len();
        floats
            .get_mut(offset..offset + values.len())
            .ok_or(SimulatedFault::OutOfBounds {
                ptr,
                offset,
                len: values.len(),
                size,
            })?
            .copy_from_slice(values);
        Ok(())
    }

    fn read_table(&self, ptr: DevicePtr, len: usize) -> std::result::Result<Vec<DevicePtr>, SimulatedFault> {
        let words = self.buffer(ptr)?.pointers();
        let entries = window(words, ptr, 0, len)?;
        Ok(entries.iter().copied().map(DevicePtr::new).collect())
    }
}

fn window<T>(
    values: &[T],
    ptr: DevicePtr,
    offset: usize,
    len: usize,
) -> std::result::Result<&[T], SimulatedFault> {
    values
        .get(offset..offset + len)
        .ok_or(SimulatedFault::OutOfBounds {
            ptr,
            offset,
            len,
            size: values.len(),
        })
}

/// An [`Accelerator`] backed by host memory.
pub struct SimulatedAccelerator {
    capacity: u64,
    memory: Mutex<DeviceMemory>,

    allocations: AtomicU64,
    frees: AtomicU64,
    uploads: AtomicU64,
    downloads: AtomicU64,
    upload_bytes: AtomicU64,
    download_bytes: AtomicU64,
    kernel_launches: AtomicU64,

    fail_allocations: AtomicU32,
    fail_transfers: AtomicBool,
    fail_frees: AtomicBool,
    fail_mem_info: AtomicBool,
}

impl SimulatedAccelerator {
    /// A device with `capacity` bytes of memory.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            memory: Mutex::new(DeviceMemory {
                next_addr: BASE_ADDRESS,
                ..DeviceMemory::default()
            }),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            uploads: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
            upload_bytes: AtomicU64::new(0),
            download_bytes: AtomicU64::new(0),
            kernel_launches: AtomicU64::new(0),
            fail_allocations: AtomicU32::new(0),
            fail_transfers: AtomicBool::new(false),
            fail_frees: AtomicBool::new(false),
            fail_mem_info: AtomicBool::new(false),
        }
    }

    /// Configured capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Fail the next `count` allocations.
    pub fn fail_allocations(&self, count: u32) {
        self.fail_allocations.store(count, Ordering::SeqCst);
    }

    /// Fail every copy while set.
    pub fn fail_transfers(&self, enabled: bool) {
        self.fail_transfers.store(enabled, Ordering::SeqCst);
    }

    /// Fail every free while set. The allocation stays live.
    pub fn fail_frees(&self, enabled: bool) {
        self.fail_frees.store(enabled, Ordering::SeqCst);
    }

    /// Fail memory queries while set.
    pub fn fail_mem_info(&self, enabled: bool) {
        self.fail_mem_info.store(enabled, Ordering::SeqCst);
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SimulatedStats {
        SimulatedStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            upload_bytes: self.upload_bytes.load(Ordering::Relaxed),
            download_bytes: self.download_bytes.load(Ordering::Relaxed),
            kernel_launches: self.kernel_launches.load(Ordering::Relaxed),
        }
    }

    /// Allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.memory.lock().buffers.len()
    }

    /// Bytes currently allocated.
    pub fn used_bytes(&self) -> u64 {
        self.memory.lock().used
    }

    /// Size of the allocation at `ptr`, if live.
    pub fn allocation_size(&self, ptr: DevicePtr) -> Option<u64> {
        self.memory
            .lock()
            .buffers
            .get(&ptr.addr())
            .map(|b| b.len as u64)
    }

    /// Copy of the floats stored at `ptr`. For tests and diagnostics.
    pub fn read_f32(&self, ptr: DevicePtr) -> Result<Vec<f32>> {
        let memory = self.memory.lock();
        Ok(memory.buffer(ptr)?.floats().to_vec())
    }

    fn check_transfer(&self, what: &'static str) -> Result<()> {
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(SimulatedFault::Injected(what).into());
        }
        Ok(())
    }

    fn launched(&self, kernel: &str) {
        self.kernel_launches.fetch_add(1, Ordering::Relaxed);
        trace!("Simulated launch of {}", kernel);
    }
}

impl Default for SimulatedAccelerator {
    fn default() -> Self {
        Self::new(duplex_core::GIB)
    }
}

impl std::fmt::Debug for SimulatedAccelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedAccelerator")
            .field("capacity", &self.capacity)
            .field("used", &self.used_bytes())
            .field("live_allocations", &self.live_allocations())
            .finish()
    }
}

impl Accelerator for SimulatedAccelerator {
    fn name(&self) -> &str {
        "simulated"
    }

    fn allocate(&self, bytes: u64) -> Result<DevicePtr> {
        let injected = self
            .fail_allocations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SimulatedFault::Injected("allocation").into());
        }
        if bytes == 0 {
            return Err(Error::device("zero-byte device allocation"));
        }

        let mut memory = self.memory.lock();
        let free = self.capacity.saturating_sub(memory.used);
        if bytes > free {
            return Err(SimulatedFault::OutOfMemory {
                requested: bytes,
                free,
            }
            .into());
        }
        let len = usize::try_from(bytes)
            .map_err(|_| Error::device(format!("{bytes} bytes do not fit in host memory")))?;

        let addr = memory.next_addr;
        memory.next_addr += bytes.div_ceil(ALIGNMENT) * ALIGNMENT + ALIGNMENT;
        memory.used += bytes;
        memory.buffers.insert(addr, DeviceBuffer::new(len));
        self.allocations.fetch_add(1, Ordering::Relaxed);

        let ptr = DevicePtr::new(addr);
        debug!("Simulated allocation of {} bytes at {}", bytes, ptr);
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        if self.fail_frees.load(Ordering::SeqCst) {
            return Err(SimulatedFault::Injected("free").into());
        }
        let mut memory = self.memory.lock();
        let buffer = memory
            .buffers
            .remove(&ptr.addr())
            .ok_or(SimulatedFault::UnknownPointer(ptr))?;
        memory.used -= buffer.len as u64;
        self.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn copy_host_to_device(&self, host: &[u8], ptr: DevicePtr) -> Result<()> {
        self.check_transfer("host-to-device copy")?;
        let mut memory = self.memory.lock();
        let bytes = memory.buffer_mut(ptr)?.bytes_mut();
        let size = bytes.len();
        bytes
            .get_mut(..host.len())
            .ok_or(SimulatedFault::OutOfBounds {
                ptr,
                offset: 0,
                len: host.len(),
                size,
            })?
            .copy_from_slice(host);
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.upload_bytes
            .fetch_add(host.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn copy_device_to_host(&self, ptr: DevicePtr, host: &mut [u8]) -> Result<()> {
        self.check_transfer("device-to-host copy")?;
        let memory = self.memory.lock();
        let bytes = memory.buffer(ptr)?.bytes();
        host.copy_from_slice(window(bytes, ptr, 0, host.len())?);
        self.downloads.fetch_add(1, Ordering::Relaxed);
        self.download_bytes
            .fetch_add(host.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn mem_info(&self) -> Result<MemInfo> {
        if self.fail_mem_info.load(Ordering::SeqCst) {
            return Err(SimulatedFault::Injected("memory query").into());
        }
        let used = self.memory.lock().used;
        Ok(MemInfo::new(self.capacity.saturating_sub(used), self.capacity))
    }

    fn rmsnorm(&self, launch: &RmsNormLaunch) -> Result<()> {
        let mut memory = self.memory.lock();
        let x = memory.read(launch.x, launch.size)?;
        let weight = memory.read(launch.weight, launch.size)?;
        let mut out = vec![0.0; launch.size];
        rmsnorm_slices(&mut out, &x, &weight, launch.eps);
        memory.write_floats(launch.out, 0, &out)?;
        self.launched("rmsnorm");
        Ok(())
    }

    fn softmax(&self, ptr: DevicePtr, offset: usize, size: usize) -> Result<()> {
        let mut memory = self.memory.lock();
        let floats = memory.buffer_mut(ptr)?.floats_mut();
        let len = floats.len();
        let row = floats
            .get_mut(offset..offset + size)
            .ok_or(SimulatedFault::OutOfBounds {
                ptr,
                offset,
                len: size,
                size: len,
            })?;
        softmax_slice(row);
        self.launched("softmax");
        Ok(())
    }

    fn attention_scores(&self, launch: &ScoreLaunch) -> Result<()> {
        let g = &launch.geometry;
        let mut memory = self.memory.lock();
        let q = memory.read(launch.query, g.head_size)?;
        let keys = memory.read(
            launch.key_cache,
            g.cache_offset(g.position) + g.head_size,
        )?;
        let mut row = vec![0.0; g.prefix_len()];
        score_slices(&mut row, &q, &keys, g);
        memory.write_floats(launch.att, launch.att_offset, &row)?;
        self.launched("attention_scores");
        Ok(())
    }

    fn weighted_sum(&self, launch: &WeightedSumLaunch) -> Result<()> {
        let g = &launch.geometry;
        let mut memory = self.memory.lock();
        let scores = memory.read_floats(launch.att, launch.att_offset, g.prefix_len())?;
        let values = memory.read_floats(
            launch.value_cache,
            0,
            g.cache_offset(g.position) + g.head_size,
        )?;
        let mut xb = vec![0.0; g.head_size];
        weighted_slices(&mut xb, &scores, &values, g);
        memory.write_floats(launch.out, launch.out_offset, &xb)?;
        self.launched("weighted_sum");
        Ok(())
    }

    fn matmul(&self, launch: &MatmulLaunch) -> Result<()> {
        let (dim0, dim1) = (launch.dim0, launch.dim1);
        let mut memory = self.memory.lock();
        let w = memory.read(launch.weights, dim0 * dim1)?;
        let x = memory.read(launch.input, dim1)?;
        let out: Vec<f32> = (0..dim0)
            .map(|i| dot_slices(&w[i * dim1..(i + 1) * dim1], &x))
            .collect();
        memory.write_floats(launch.out, 0, &out)?;
        self.launched("matmul");
        Ok(())
    }

    fn rope(&self, launch: &RopeLaunch) -> Result<()> {
        let last = launch.shape.advanced(launch.n_tokens.saturating_sub(1));
        let table_len = last.table_len();
        last.validate(table_len)?;

        let mut memory = self.memory.lock();
        let real = memory.read(launch.real, table_len)?;
        let imag = memory.read(launch.imag, table_len)?;
        let queries = memory.read_table(launch.queries, launch.n_tokens)?;
        let keys = memory.read_table(launch.keys, launch.n_tokens)?;

        for (t, (&q_ptr, &k_ptr)) in queries.iter().zip(&keys).enumerate() {
            let shape = launch.shape.advanced(t);
            let k_len = shape.kv_dim.min(shape.dim);
            let mut q = memory.read_floats(q_ptr, 0, shape.dim)?;
            let mut k = memory.read_floats(k_ptr, 0, k_len)?;
            rope_slices(&mut q, &mut k, &real, &imag, shape);
            memory.write_floats(q_ptr, 0, &q)?;
            memory.write_floats(k_ptr, 0, &k)?;
        }
        self.launched("rope");
        Ok(())
    }

    fn dot(&self, a: KernelOperand, b: KernelOperand, size: usize) -> Result<f32> {
        let memory = self.memory.lock();
        let x = memory.read(a, size)?;
        let y = memory.read(b, size)?;
        self.launched("dot");
        Ok(dot_slices(&x, &y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(accel: &SimulatedAccelerator, values: &[f32]) -> DevicePtr {
        let ptr = accel.allocate((values.len() * 4) as u64).unwrap();
        accel
            .copy_host_to_device(bytemuck::cast_slice(values), ptr)
            .unwrap();
        ptr
    }

    #[test]
    fn test_allocation_accounting() {
        let accel = SimulatedAccelerator::new(1000);
        let a = accel.allocate(400).unwrap();
        let b = accel.allocate(400).unwrap();
        assert_ne!(a, b);
        assert!(!a.is_null());
        assert_eq!(accel.mem_info().unwrap(), MemInfo::new(200, 1000));
        assert!(accel.allocate(300).is_err());

        accel.free(a).unwrap();
        assert_eq!(accel.used_bytes(), 400);
        assert_eq!(accel.live_allocations(), 1);
        assert!(accel.free(a).is_err());
    }

    #[test]
    fn test_addresses_never_reused() {
        let accel = SimulatedAccelerator::new(1 << 20);
        let a = accel.allocate(64).unwrap();
        accel.free(a).unwrap();
        let b = accel.allocate(64).unwrap();
        assert_ne!(a, b);
        assert_eq!(b.addr() % ALIGNMENT, 0);
    }

    #[test]
    fn test_byte_round_trip() {
        let accel = SimulatedAccelerator::new(1 << 20);
        let ptr = accel.allocate(5).unwrap();
        accel.copy_host_to_device(&[1, 2, 3, 4, 5], ptr).unwrap();
        let mut back = [0u8; 5];
        accel.copy_device_to_host(ptr, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3, 4, 5]);
        assert_eq!(accel.stats().upload_bytes, 5);
        assert_eq!(accel.stats().downloads, 1);
    }

    #[test]
    fn test_oversized_copy_rejected() {
        let accel = SimulatedAccelerator::new(1 << 20);
        let ptr = accel.allocate(4).unwrap();
        assert!(accel.copy_host_to_device(&[0; 8], ptr).is_err());
        let mut host = [0u8; 8];
        assert!(accel.copy_device_to_host(ptr, &mut host).is_err());
    }

    #[test]
    fn test_injected_faults() {
        let accel = SimulatedAccelerator::new(1 << 20);
        accel.fail_allocations(2);
        assert!(accel.allocate(16).is_err());
        assert!(accel.allocate(16).is_err());
        let ptr = accel.allocate(16).unwrap();

        accel.fail_transfers(true);
        assert_eq!(
            accel.copy_host_to_device(&[0; 16], ptr).unwrap_err().error_code(),
            "DEVICE_ERROR"
        );
        accel.fail_transfers(false);

        accel.fail_frees(true);
        assert!(accel.free(ptr).is_err());
        assert_eq!(accel.live_allocations(), 1);

        accel.fail_mem_info(true);
        assert!(accel.mem_info().is_err());
    }

    #[test]
    fn test_dot_and_softmax() {
        let accel = SimulatedAccelerator::new(1 << 20);
        let a = upload(&accel, &[1.0, 2.0, 3.0]);
        let b = upload(&accel, &[4.0, 5.0, 6.0]);
        let d = accel
            .dot(KernelOperand::f32(a, 1), KernelOperand::f32(b, 0), 2)
            .unwrap();
        assert_eq!(d, 2.0 * 4.0 + 3.0 * 5.0);

        accel.softmax(a, 0, 3).unwrap();
        let probs = accel.read_f32(a).unwrap();
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(accel.softmax(a, 2, 2).is_err());
        assert_eq!(accel.stats().kernel_launches, 2);
    }

    #[test]
    fn test_rope_reads_pointer_tables() {
        let accel = SimulatedAccelerator::new(1 << 20);
        let real = upload(&accel, &[1.0, 0.0]);
        let imag = upload(&accel, &[0.0, 1.0]);
        let q0 = upload(&accel, &[1.0, 2.0]);
        let q1 = upload(&accel, &[1.0, 2.0]);
        let k0 = upload(&accel, &[3.0, 4.0]);
        let k1 = upload(&accel, &[3.0, 4.0]);

        let table = |ptrs: [DevicePtr; 2]| {
            let words = [ptrs[0].addr(), ptrs[1].addr()];
            let ptr = accel.allocate(16).unwrap();
            accel
                .copy_host_to_device(bytemuck::cast_slice(&words), ptr)
                .unwrap();
            ptr
        };
        let queries = table([q0, q1]);
        let keys = table([k0, k1]);

        accel
            .rope(&RopeLaunch {
                real: KernelOperand::f32(real, 0),
                imag: KernelOperand::f32(imag, 0),
                queries,
                keys,
                n_tokens: 2,
                shape: crate::kernels::RopeShape {
                    position: 0,
                    dim: 2,
                    head_size: 2,
                    kv_dim: 2,
                },
            })
            .unwrap();

        // Position 0 is the identity, position 1 rotates by 90 degrees.
        assert_eq!(accel.read_f32(q0).unwrap(), vec![1.0, 2.0]);
        assert_eq!(accel.read_f32(q1).unwrap(), vec![-2.0, 1.0]);
        assert_eq!(accel.read_f32(k1).unwrap(), vec![-4.0, 3.0]);
    }
}
