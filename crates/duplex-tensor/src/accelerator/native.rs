//! Runtime-loaded vendor bridge library.
//!
//! The bridge exports plain C symbols keyed by raw device addresses. Tensor
//! arguments travel as `(address, element offset, format code, block size,
//! type size, header bytes)`.

#![allow(unsafe_code)]

use std::ffi::c_int;

use libloading::Library;
use tracing::{debug, info};

use duplex_core::{DevicePtr, Error, MemInfo, Result};

use super::{
    Accelerator, KernelOperand, MatmulLaunch, RmsNormLaunch, RopeLaunch, ScoreLaunch,
    WeightedSumLaunch,
};

type FnCudaInit = unsafe extern "C" fn();
type FnAllocDevicePtr = unsafe extern "C" fn(i64) -> u64;
type FnFreeDevicePtr = unsafe extern "C" fn(u64);
type FnCopyHostToDevice = unsafe extern "C" fn(*const u8, u64, i64);
type FnCopyDeviceToHost = unsafe extern "C" fn(u64, *mut u8, i64);
type FnGetMemInfo = unsafe extern "C" fn(*mut usize, *mut usize);
type FnRmsNorm = unsafe extern "C" fn(
    u64, c_int, c_int, c_int, c_int, c_int, // x
    u64, c_int, c_int, c_int, c_int, c_int, // weight
    u64,                                    // out
    c_int,                                  // size
    f32,                                    // eps
);
type FnSoftmax = unsafe extern "C" fn(u64, c_int, c_int);
type FnQkScores = unsafe extern "C" fn(
    u64, c_int, c_int, c_int, c_int, c_int, // query
    u64, c_int, c_int, c_int, c_int,        // key cache (no offset)
    u64, c_int,                             // att, att offset
    c_int, c_int,                           // position, token
    c_int, c_int, c_int, c_int, c_int, c_int, // head, head size, heads, context, kv dim, kv mul
);
type FnWeightedSum = unsafe extern "C" fn(
    u64, u64, u64, // att, xb, value cache
    c_int, c_int,  // head, head size
    c_int, c_int,  // att offset, xb offset
    c_int, c_int,  // kv dim, kv mul
    c_int, c_int,  // position, token
);
type FnMatmul = unsafe extern "C" fn(
    u64, c_int, c_int, c_int, c_int, c_int, // weights
    u64, c_int, c_int, c_int, c_int, c_int, // input
    u64,                                    // out
    c_int, c_int,                           // dim0, dim1
);
type FnRope = unsafe extern "C" fn(
    u64, c_int, c_int, c_int, c_int, c_int, // real
    u64, c_int, c_int, c_int, c_int, c_int, // imag
    u64, u64,                               // query table, key table
    c_int, c_int, c_int, c_int, c_int,      // tokens, dim, position, head size, kv dim
);
type FnSdot = unsafe extern "C" fn(
    u64, c_int, c_int, c_int, c_int, c_int,
    u64, c_int, c_int, c_int, c_int, c_int,
    c_int,
) -> f32;

struct BridgeApi {
    _lib: Library,
    alloc_device_ptr: FnAllocDevicePtr,
    free_device_ptr: FnFreeDevicePtr,
    copy_host_to_device: FnCopyHostToDevice,
    copy_device_to_host: FnCopyDeviceToHost,
    get_mem_info: FnGetMemInfo,
    rmsnorm: FnRmsNorm,
    softmax: FnSoftmax,
    qk_scores: FnQkScores,
    weighted_sum: FnWeightedSum,
    matmul: FnMatmul,
    rope: FnRope,
    sdot: FnSdot,
}

unsafe fn symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T> {
    lib.get::<T>(name).map(|s| *s).map_err(|e| {
        let printable = String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name));
        Error::device_with_source(format!("bridge symbol {printable} not found"), e)
    })
}

impl BridgeApi {
    fn load(path: &str) -> Result<Self> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| Error::device_with_source(format!("failed to load {path}"), e))?;
        unsafe {
            let init: FnCudaInit = symbol(&lib, b"cudaInit\0")?;
            let api = BridgeApi {
                alloc_device_ptr: symbol(&lib, b"allocDevicePtr\0")?,
                free_device_ptr: symbol(&lib, b"freeDevicePtr\0")?,
                copy_host_to_device: symbol(&lib, b"copyHostToDevice\0")?,
                copy_device_to_host: symbol(&lib, b"copyDeviceToHost\0")?,
                get_mem_info: symbol(&lib, b"cudaGetMemInfo\0")?,
                rmsnorm: symbol(&lib, b"launch_rmsnorm_fp32_rowmajor\0")?,
                softmax: symbol(&lib, b"launch_row_softmax_inplace_fp32\0")?,
                qk_scores: symbol(&lib, b"launch_qkscores\0")?,
                weighted_sum: symbol(&lib, b"launch_weighted_sum\0")?,
                matmul: symbol(&lib, b"launch_Matmul\0")?,
                rope: symbol(&lib, b"launch_rope\0")?,
                sdot: symbol(&lib, b"sdotSliceDevice\0")?,
                _lib: lib,
            };
            init();
            Ok(api)
        }
    }
}

fn int(value: usize, what: &str) -> Result<c_int> {
    c_int::try_from(value)
        .map_err(|_| Error::device(format!("{what} {value} exceeds the bridge's int range")))
}

fn len64(bytes: usize) -> Result<i64> {
    i64::try_from(bytes).map_err(|_| Error::device(format!("{bytes} bytes exceeds bridge range")))
}

/// An operand spread into the six bridge arguments.
type Spread = (u64, c_int, c_int, c_int, c_int, c_int);

fn spread(op: &KernelOperand) -> Result<Spread> {
    let f = op.format;
    Ok((
        op.ptr.addr(),
        int(op.offset, "operand offset")?,
        f.code,
        f.block_size,
        f.type_size,
        f.header_bytes,
    ))
}

/// [`Accelerator`] backed by the vendor bridge shared library.
pub struct NativeAccelerator {
    path: String,
    api: BridgeApi,
}

impl NativeAccelerator {
    /// Load the bridge at `path` and initialize the device.
    pub fn load(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let api = BridgeApi::load(&path)?;
        info!("Loaded accelerator bridge from {}", path);
        Ok(Self { path, api })
    }

    /// Path the bridge was loaded from.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Debug for NativeAccelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeAccelerator")
            .field("path", &self.path)
            .finish()
    }
}

impl Accelerator for NativeAccelerator {
    fn name(&self) -> &str {
        "native"
    }

    fn allocate(&self, bytes: u64) -> Result<DevicePtr> {
        let request = i64::try_from(bytes)
            .map_err(|_| Error::allocation("request exceeds bridge range", bytes))?;
        let addr = unsafe { (self.api.alloc_device_ptr)(request) };
        let ptr = DevicePtr::new(addr)
            .non_null()
            .ok_or_else(|| Error::allocation("bridge returned a null pointer", bytes))?;
        debug!("Bridge allocated {} bytes at {}", bytes, ptr);
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        if ptr.is_null() {
            return Err(Error::device("free of a null device pointer"));
        }
        unsafe { (self.api.free_device_ptr)(ptr.addr()) };
        Ok(())
    }

    fn copy_host_to_device(&self, host: &[u8], ptr: DevicePtr) -> Result<()> {
        let bytes = len64(host.len())?;
        unsafe { (self.api.copy_host_to_device)(host.as_ptr(), ptr.addr(), bytes) };
        Ok(())
    }

    fn copy_device_to_host(&self, ptr: DevicePtr, host: &mut [u8]) -> Result<()> {
        let bytes = len64(host.len())?;
        unsafe { (self.api.copy_device_to_host)(ptr.addr(), host.as_mut_ptr(), bytes) };
        Ok(())
    }

    fn mem_info(&self) -> Result<MemInfo> {
        let (mut free, mut total) = (0usize, 0usize);
        unsafe { (self.api.get_mem_info)(&mut free, &mut total) };
        if total == 0 {
            return Err(Error::device("bridge reported zero total device memory"));
        }
        Ok(MemInfo::new(free as u64, total as u64))
    }

    fn rmsnorm(&self, launch: &RmsNormLaunch) -> Result<()> {
        let x = spread(&launch.x)?;
        let w = spread(&launch.weight)?;
        let size = int(launch.size, "rmsnorm size")?;
        unsafe {
            (self.api.rmsnorm)(
                x.0, x.1, x.2, x.3, x.4, x.5,
                w.0, w.1, w.2, w.3, w.4, w.5,
                launch.out.addr(),
                size,
                launch.eps,
            )
        };
        Ok(())
    }

    fn softmax(&self, ptr: DevicePtr, offset: usize, size: usize) -> Result<()> {
        let offset = int(offset, "softmax offset")?;
        let size = int(size, "softmax size")?;
        unsafe { (self.api.softmax)(ptr.addr(), offset, size) };
        Ok(())
    }

    fn attention_scores(&self, launch: &ScoreLaunch) -> Result<()> {
        let g = &launch.geometry;
        let q = spread(&launch.query)?;
        let k = spread(&launch.key_cache)?;
        let args = [
            int(launch.att_offset, "att offset")?,
            int(g.position, "position")?,
            int(g.head, "head")?,
            int(g.head_size, "head size")?,
            int(g.num_heads, "heads")?,
            int(g.context_length, "context length")?,
            int(g.kv_dim, "kv dim")?,
            int(g.kv_mul, "kv mul")?,
        ];
        unsafe {
            (self.api.qk_scores)(
                q.0, q.1, q.2, q.3, q.4, q.5,
                k.0, k.2, k.3, k.4, k.5,
                launch.att.addr(), args[0],
                args[1], 0,
                args[2], args[3], args[4], args[5], args[6], args[7],
            )
        };
        Ok(())
    }

    fn weighted_sum(&self, launch: &WeightedSumLaunch) -> Result<()> {
        let g = &launch.geometry;
        unsafe {
            (self.api.weighted_sum)(
                launch.att.addr(),
                launch.out.addr(),
                launch.value_cache.addr(),
                int(g.head, "head")?,
                int(g.head_size, "head size")?,
                int(launch.att_offset, "att offset")?,
                int(launch.out_offset, "output offset")?,
                int(g.kv_dim, "kv dim")?,
                int(g.kv_mul, "kv mul")?,
                int(g.position, "position")?,
                0,
            )
        };
        Ok(())
    }

    fn matmul(&self, launch: &MatmulLaunch) -> Result<()> {
        let w = spread(&launch.weights)?;
        let x = spread(&launch.input)?;
        let dim0 = int(launch.dim0, "dim0")?;
        let dim1 = int(launch.dim1, "dim1")?;
        unsafe {
            (self.api.matmul)(
                w.0, w.1, w.2, w.3, w.4, w.5,
                x.0, x.1, x.2, x.3, x.4, x.5,
                launch.out.addr(),
                dim0, dim1,
            )
        };
        Ok(())
    }

    fn rope(&self, launch: &RopeLaunch) -> Result<()> {
        let re = spread(&launch.real)?;
        let im = spread(&launch.imag)?;
        let s = &launch.shape;
        let args = [
            int(launch.n_tokens, "tokens")?,
            int(s.dim, "dim")?,
            int(s.position, "position")?,
            int(s.head_size, "head size")?,
            int(s.kv_dim, "kv dim")?,
        ];
        unsafe {
            (self.api.rope)(
                re.0, re.1, re.2, re.3, re.4, re.5,
                im.0, im.1, im.2, im.3, im.4, im.5,
                launch.queries.addr(), launch.keys.addr(),
                args[0], args[1], args[2], args[3], args[4],
            )
        };
        Ok(())
    }

    fn dot(&self, a: KernelOperand, b: KernelOperand, size: usize) -> Result<f32> {
        let a = spread(&a)?;
        let b = spread(&b)?;
        let n = int(size, "dot size")?;
        let result = unsafe {
            (self.api.sdot)(
                a.0, a.1, a.2, a.3, a.4, a.5,
                b.0, b.1, b.2, b.3, b.4, b.5,
                n,
            )
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_is_device_error() {
        let err = NativeAccelerator::load("/nonexistent/libduplex_bridge.so").unwrap_err();
        assert_eq!(err.error_code(), "DEVICE_ERROR");
        assert!(err.to_string().contains("libduplex_bridge.so"));
    }

    #[test]
    fn test_int_conversion_rejects_overflow() {
        assert_eq!(int(7, "x").unwrap(), 7);
        assert!(int(usize::MAX, "x").is_err());
    }
}
