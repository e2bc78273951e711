//! CUDA backend on top of cudarc.
//!
//! Device memory goes through the driver's synchronous allocator so the
//! kernel can hand out plain `DevicePtr` tokens; streams are cudarc
//! `CudaStream`s kept alive in a table keyed by `StreamId`.

use super::{DeviceBackend, DeviceError, DeviceInfo, DevicePtr, StreamId};
use cudarc::driver::result as cuda_result;
use cudarc::driver::sys::CUdevice_attribute_enum;
use cudarc::driver::{CudaContext, CudaStream};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A real GPU (or several) reached through the CUDA driver API.
pub struct CudaDevice {
    contexts: Mutex<HashMap<usize, Arc<CudaContext>>>,
    current: AtomicUsize,
    /// Live allocations: address → (device, bytes).
    allocations: Mutex<HashMap<u64, (usize, usize)>>,
    streams: Mutex<HashMap<u64, (usize, Arc<CudaStream>)>>,
    next_stream: AtomicU64,
}

impl CudaDevice {
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            current: AtomicUsize::new(0),
            allocations: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
        }
    }

    fn context(&self, ordinal: usize) -> Result<Arc<CudaContext>, DeviceError> {
        let mut contexts = self.contexts.lock();
        if let Some(ctx) = contexts.get(&ordinal) {
            return Ok(ctx.clone());
        }
        if ordinal >= self.device_count()? {
            return Err(DeviceError::InvalidDevice(ordinal));
        }
        let ctx = CudaContext::new(ordinal)?;
        contexts.insert(ordinal, ctx.clone());
        Ok(ctx)
    }

    /// Context of the current device, bound to the calling thread.
    fn bound_context(&self) -> Result<Arc<CudaContext>, DeviceError> {
        let ctx = self.context(self.current_device())?;
        ctx.bind_to_thread()?;
        Ok(ctx)
    }

    fn stream(&self, stream: StreamId) -> Result<Arc<CudaStream>, DeviceError> {
        self.streams
            .lock()
            .get(&stream.0)
            .map(|(_, s)| s.clone())
            .ok_or(DeviceError::InvalidStream(stream))
    }

    fn check_ptr(&self, ptr: DevicePtr, bytes: usize) -> Result<(), DeviceError> {
        let allocations = self.allocations.lock();
        let (_, size) = allocations
            .get(&ptr.0)
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        if bytes > *size {
            return Err(DeviceError::OutOfBounds {
                requested: bytes,
                capacity: *size,
            });
        }
        Ok(())
    }
}

impl Default for CudaDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for CudaDevice {
    fn device_count(&self) -> Result<usize, DeviceError> {
        Ok(CudaContext::device_count()? as usize)
    }

    fn device_info(&self, ordinal: usize) -> Result<DeviceInfo, DeviceError> {
        let ctx = self.context(ordinal)?;
        let attr = |a: CUdevice_attribute_enum| -> Result<u32, DeviceError> {
            Ok(ctx.attribute(a)? as u32)
        };

        let major = attr(CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
        let minor = attr(CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;

        ctx.bind_to_thread()?;
        let (free_memory, total_memory) = cuda_result::mem_get_info()?;

        Ok(DeviceInfo {
            device_id: ordinal,
            name: ctx.name()?,
            total_memory,
            free_memory,
            compute_capability: major * 10 + minor,
            max_threads_per_block: attr(
                CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
            )?,
            max_blocks_per_grid: attr(CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X)?,
            max_threads_per_multiprocessor: attr(
                CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_MULTIPROCESSOR,
            )?,
            multiprocessor_count: attr(
                CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT,
            )?,
            ..Default::default()
        }
        .with_estimates())
    }

    fn set_device(&self, ordinal: usize) -> Result<(), DeviceError> {
        let ctx = self.context(ordinal)?;
        ctx.bind_to_thread()?;
        self.current.store(ordinal, Ordering::Release);
        Ok(())
    }

    fn current_device(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    fn mem_info(&self) -> Result<(usize, usize), DeviceError> {
        self.bound_context()?;
        Ok(cuda_result::mem_get_info()?)
    }

    fn malloc(&self, bytes: usize) -> Result<DevicePtr, DeviceError> {
        self.bound_context()?;
        let ptr = unsafe { cuda_result::malloc_sync(bytes)? };
        self.allocations
            .lock()
            .insert(ptr, (self.current_device(), bytes));
        Ok(DevicePtr(ptr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        if self.allocations.lock().remove(&ptr.0).is_none() {
            return Err(DeviceError::InvalidPointer(ptr));
        }
        self.bound_context()?;
        unsafe { cuda_result::free_sync(ptr.0)? };
        Ok(())
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DeviceError> {
        self.check_ptr(dst, src.len())?;
        self.bound_context()?;
        unsafe { cuda_result::memcpy_htod_sync(dst.0, src)? };
        Ok(())
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DeviceError> {
        self.check_ptr(src, dst.len())?;
        self.bound_context()?;
        unsafe { cuda_result::memcpy_dtoh_sync(dst, src.0)? };
        Ok(())
    }

    fn memcpy_dtod(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
    ) -> Result<(), DeviceError> {
        self.check_ptr(dst, bytes)?;
        self.check_ptr(src, bytes)?;
        self.bound_context()?;
        unsafe { cuda_result::memcpy_dtod_sync(dst.0, src.0, bytes)? };
        Ok(())
    }

    fn memcpy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: StreamId,
    ) -> Result<(), DeviceError> {
        self.check_ptr(dst, bytes)?;
        self.check_ptr(src, bytes)?;
        let stream = self.stream(stream)?;
        stream.context().bind_to_thread()?;
        unsafe { cuda_result::memcpy_dtod_async(dst.0, src.0, bytes, stream.cu_stream())? };
        Ok(())
    }

    fn create_stream(&self) -> Result<StreamId, DeviceError> {
        let ordinal = self.current_device();
        let stream = self.context(ordinal)?.new_stream()?;
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        self.streams.lock().insert(id, (ordinal, stream));
        Ok(StreamId(id))
    }

    fn destroy_stream(&self, stream: StreamId) -> Result<(), DeviceError> {
        // Dropping the last Arc destroys the driver stream.
        self.streams
            .lock()
            .remove(&stream.0)
            .map(|_| ())
            .ok_or(DeviceError::InvalidStream(stream))
    }

    fn synchronize_stream(&self, stream: StreamId) -> Result<(), DeviceError> {
        self.stream(stream)?.synchronize()?;
        Ok(())
    }

    fn reset(&self) -> Result<(), DeviceError> {
        let ordinal = self.current_device();
        self.streams.lock().retain(|_, (device, _)| *device != ordinal);

        let doomed: Vec<u64> = {
            let mut allocations = self.allocations.lock();
            let ptrs: Vec<u64> = allocations
                .iter()
                .filter(|(_, (device, _))| *device == ordinal)
                .map(|(ptr, _)| *ptr)
                .collect();
            for ptr in &ptrs {
                allocations.remove(ptr);
            }
            ptrs
        };

        self.bound_context()?;
        for ptr in doomed {
            unsafe { cuda_result::free_sync(ptr)? };
        }
        Ok(())
    }
}
