//! In-process simulated device.
//!
//! Behaves like a driver from the kernel's point of view: memory is
//! accounted per device and runs out, copies move real bytes, and every
//! stream is its own worker thread draining an ordered queue, so
//! `synchronize_stream` blocks exactly until that stream is idle and never
//! on anyone else's work.

use super::{DeviceBackend, DeviceError, DeviceInfo, DevicePtr, StreamId};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Allocation granularity, matching the alignment real drivers hand out.
const ALLOC_ALIGN: u64 = 256;
const BASE_ADDR: u64 = 0x7f00_0000_0000;

/// Description of one simulated device.
#[derive(Debug, Clone)]
pub struct SimDeviceSpec {
    pub name: String,
    pub total_memory: usize,
    pub multiprocessor_count: u32,
    /// `major * 10 + minor`.
    pub compute_capability: u32,
}

impl Default for SimDeviceSpec {
    fn default() -> Self {
        Self {
            name: "Simulated GPU".to_string(),
            total_memory: 1 << 30,
            multiprocessor_count: 4,
            compute_capability: 89,
        }
    }
}

struct Allocation {
    device: usize,
    size: usize,
    /// Backing bytes, materialized on first write.
    data: Option<Vec<u8>>,
}

struct SimMemory {
    allocations: HashMap<u64, Allocation>,
    used: Vec<usize>,
    next_addr: u64,
}

impl SimMemory {
    fn copy(&mut self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<(), DeviceError> {
        let src_alloc = self
            .allocations
            .get(&src.0)
            .ok_or(DeviceError::InvalidPointer(src))?;
        if bytes > src_alloc.size {
            return Err(DeviceError::OutOfBounds {
                requested: bytes,
                capacity: src_alloc.size,
            });
        }
        let mut chunk = vec![0u8; bytes];
        if let Some(data) = &src_alloc.data {
            chunk.copy_from_slice(&data[..bytes]);
        }
        self.write(dst, &chunk)
    }

    fn write(&mut self, dst: DevicePtr, src: &[u8]) -> Result<(), DeviceError> {
        let alloc = self
            .allocations
            .get_mut(&dst.0)
            .ok_or(DeviceError::InvalidPointer(dst))?;
        if src.len() > alloc.size {
            return Err(DeviceError::OutOfBounds {
                requested: src.len(),
                capacity: alloc.size,
            });
        }
        let size = alloc.size;
        let data = alloc.data.get_or_insert_with(|| vec![0u8; size]);
        data[..src.len()].copy_from_slice(src);
        Ok(())
    }
}

type StreamOp = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct StreamProgress {
    pending: Mutex<usize>,
    drained: Condvar,
}

impl StreamProgress {
    fn complete_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.drained.wait(&mut pending);
        }
    }
}

struct SimStream {
    device: usize,
    sender: mpsc::Sender<StreamOp>,
    progress: Arc<StreamProgress>,
    worker: JoinHandle<()>,
}

impl SimStream {
    fn spawn(id: u64, device: usize) -> Result<Self, DeviceError> {
        let (sender, receiver) = mpsc::channel::<StreamOp>();
        let progress = Arc::new(StreamProgress::default());
        let worker_progress = progress.clone();

        let worker = thread::Builder::new()
            .name(format!("sim-stream-{id}"))
            .spawn(move || {
                for op in receiver {
                    if panic::catch_unwind(AssertUnwindSafe(op)).is_err() {
                        tracing::error!(stream = id, "operation panicked on simulated stream");
                    }
                    worker_progress.complete_one();
                }
            })
            .map_err(|e| DeviceError::Driver(format!("failed to start stream worker: {e}")))?;

        Ok(Self {
            device,
            sender,
            progress,
            worker,
        })
    }

    fn shutdown(self) {
        drop(self.sender);
        if self.worker.join().is_err() {
            tracing::error!("simulated stream worker exited abnormally");
        }
    }
}

/// A device that lives entirely in host memory.
pub struct SimDevice {
    specs: Vec<SimDeviceSpec>,
    current: AtomicUsize,
    memory: Arc<Mutex<SimMemory>>,
    streams: Mutex<HashMap<u64, SimStream>>,
    next_stream: AtomicU64,
    max_streams: Option<usize>,
}

impl SimDevice {
    /// Create a simulator exposing one device per spec. An empty list
    /// simulates a machine without GPUs.
    pub fn new(specs: Vec<SimDeviceSpec>) -> Self {
        let used = vec![0; specs.len()];
        Self {
            specs,
            current: AtomicUsize::new(0),
            memory: Arc::new(Mutex::new(SimMemory {
                allocations: HashMap::new(),
                used,
                next_addr: BASE_ADDR,
            })),
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            max_streams: None,
        }
    }

    /// A single device with the given multiprocessor count and memory size.
    pub fn single(multiprocessor_count: u32, total_memory: usize) -> Self {
        Self::new(vec![SimDeviceSpec {
            multiprocessor_count,
            total_memory,
            ..Default::default()
        }])
    }

    /// Cap the number of live streams; creation beyond it fails like a
    /// driver out of stream resources.
    pub fn with_max_streams(mut self, max_streams: usize) -> Self {
        self.max_streams = Some(max_streams);
        self
    }

    /// Queue arbitrary host work on a stream, ordered with the copies
    /// already queued there.
    pub fn launch<F>(&self, stream: StreamId, op: F) -> Result<(), DeviceError>
    where
        F: FnOnce() + Send + 'static,
    {
        let streams = self.streams.lock();
        let entry = streams
            .get(&stream.0)
            .ok_or(DeviceError::InvalidStream(stream))?;

        *entry.progress.pending.lock() += 1;
        if entry.sender.send(Box::new(op)).is_err() {
            entry.progress.complete_one();
            return Err(DeviceError::Driver(format!("stream {} is gone", stream.0)));
        }
        Ok(())
    }

    /// Bytes currently allocated on device `ordinal`.
    pub fn allocated_bytes(&self, ordinal: usize) -> usize {
        self.memory.lock().used.get(ordinal).copied().unwrap_or(0)
    }

    /// Number of live streams across all devices.
    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    fn spec(&self, ordinal: usize) -> Result<&SimDeviceSpec, DeviceError> {
        self.specs
            .get(ordinal)
            .ok_or(DeviceError::InvalidDevice(ordinal))
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new(vec![SimDeviceSpec::default()])
    }
}

impl DeviceBackend for SimDevice {
    fn device_count(&self) -> Result<usize, DeviceError> {
        Ok(self.specs.len())
    }

    fn device_info(&self, ordinal: usize) -> Result<DeviceInfo, DeviceError> {
        let spec = self.spec(ordinal)?;
        let used = self.allocated_bytes(ordinal);

        Ok(DeviceInfo {
            device_id: ordinal,
            name: spec.name.clone(),
            total_memory: spec.total_memory,
            free_memory: spec.total_memory.saturating_sub(used),
            compute_capability: spec.compute_capability,
            max_threads_per_block: 1024,
            max_blocks_per_grid: i32::MAX as u32,
            max_threads_per_multiprocessor: 1536,
            multiprocessor_count: spec.multiprocessor_count,
            ..Default::default()
        }
        .with_estimates())
    }

    fn set_device(&self, ordinal: usize) -> Result<(), DeviceError> {
        self.spec(ordinal)?;
        self.current.store(ordinal, Ordering::Release);
        Ok(())
    }

    fn current_device(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    fn mem_info(&self) -> Result<(usize, usize), DeviceError> {
        let ordinal = self.current_device();
        let total = self.spec(ordinal)?.total_memory;
        Ok((total.saturating_sub(self.allocated_bytes(ordinal)), total))
    }

    fn malloc(&self, bytes: usize) -> Result<DevicePtr, DeviceError> {
        if bytes == 0 {
            return Err(DeviceError::Driver("zero-byte allocation".to_string()));
        }
        let ordinal = self.current_device();
        let total = self.spec(ordinal)?.total_memory;

        let mut memory = self.memory.lock();
        let available = total.saturating_sub(memory.used[ordinal]);
        if bytes > available {
            return Err(DeviceError::OutOfMemory {
                requested: bytes,
                available,
            });
        }

        let addr = memory.next_addr;
        memory.next_addr += (bytes as u64).div_ceil(ALLOC_ALIGN) * ALLOC_ALIGN;
        memory.used[ordinal] += bytes;
        memory.allocations.insert(
            addr,
            Allocation {
                device: ordinal,
                size: bytes,
                data: None,
            },
        );
        Ok(DevicePtr(addr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        let mut memory = self.memory.lock();
        let alloc = memory
            .allocations
            .remove(&ptr.0)
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        memory.used[alloc.device] -= alloc.size;
        Ok(())
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DeviceError> {
        self.memory.lock().write(dst, src)
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DeviceError> {
        let memory = self.memory.lock();
        let alloc = memory
            .allocations
            .get(&src.0)
            .ok_or(DeviceError::InvalidPointer(src))?;
        if dst.len() > alloc.size {
            return Err(DeviceError::OutOfBounds {
                requested: dst.len(),
                capacity: alloc.size,
            });
        }
        match &alloc.data {
            Some(data) => dst.copy_from_slice(&data[..dst.len()]),
            None => dst.fill(0),
        }
        Ok(())
    }

    fn memcpy_dtod(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
    ) -> Result<(), DeviceError> {
        self.memory.lock().copy(dst, src, bytes)
    }

    fn memcpy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: StreamId,
    ) -> Result<(), DeviceError> {
        {
            let memory = self.memory.lock();
            for ptr in [dst, src] {
                let alloc = memory
                    .allocations
                    .get(&ptr.0)
                    .ok_or(DeviceError::InvalidPointer(ptr))?;
                if bytes > alloc.size {
                    return Err(DeviceError::OutOfBounds {
                        requested: bytes,
                        capacity: alloc.size,
                    });
                }
            }
        }

        let memory = self.memory.clone();
        self.launch(stream, move || {
            if let Err(e) = memory.lock().copy(dst, src, bytes) {
                tracing::error!(error = %e, "async device copy failed");
            }
        })
    }

    fn create_stream(&self) -> Result<StreamId, DeviceError> {
        let ordinal = self.current_device();
        self.spec(ordinal)?;

        let mut streams = self.streams.lock();
        if let Some(max) = self.max_streams {
            if streams.len() >= max {
                return Err(DeviceError::Driver(format!(
                    "stream limit of {max} reached"
                )));
            }
        }

        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        streams.insert(id, SimStream::spawn(id, ordinal)?);
        Ok(StreamId(id))
    }

    fn destroy_stream(&self, stream: StreamId) -> Result<(), DeviceError> {
        let entry = self
            .streams
            .lock()
            .remove(&stream.0)
            .ok_or(DeviceError::InvalidStream(stream))?;
        // Joined outside the map lock: queued copies still need the memory lock.
        entry.shutdown();
        Ok(())
    }

    fn synchronize_stream(&self, stream: StreamId) -> Result<(), DeviceError> {
        let progress = self
            .streams
            .lock()
            .get(&stream.0)
            .map(|s| s.progress.clone())
            .ok_or(DeviceError::InvalidStream(stream))?;
        progress.wait_idle();
        Ok(())
    }

    fn reset(&self) -> Result<(), DeviceError> {
        let ordinal = self.current_device();

        let doomed: Vec<SimStream> = {
            let mut streams = self.streams.lock();
            let ids: Vec<u64> = streams
                .iter()
                .filter(|(_, s)| s.device == ordinal)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| streams.remove(&id)).collect()
        };
        for stream in doomed {
            stream.shutdown();
        }

        let mut memory = self.memory.lock();
        memory.allocations.retain(|_, a| a.device != ordinal);
        if let Some(used) = memory.used.get_mut(ordinal) {
            *used = 0;
        }
        Ok(())
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        let streams: Vec<SimStream> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn reports_spec_as_device_info() {
        let dev = SimDevice::single(4, 1 << 30);
        assert_eq!(dev.device_count().unwrap(), 1);

        let info = dev.device_info(0).unwrap();
        assert_eq!(info.multiprocessor_count, 4);
        assert_eq!(info.total_memory, 1 << 30);
        assert_eq!(info.free_memory, 1 << 30);
        assert_eq!(info.tensor_core_count, 32);

        assert!(matches!(
            dev.device_info(1),
            Err(DeviceError::InvalidDevice(1))
        ));
    }

    #[test]
    fn malloc_accounts_and_runs_out() {
        let dev = SimDevice::single(1, 4096);
        let a = dev.malloc(3000).unwrap();
        assert_eq!(dev.mem_info().unwrap(), (1096, 4096));

        let err = dev.malloc(2000).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfMemory { available: 1096, .. }));

        dev.free(a).unwrap();
        assert_eq!(dev.allocated_bytes(0), 0);
        assert!(matches!(dev.free(a), Err(DeviceError::InvalidPointer(_))));
    }

    #[test]
    fn copies_move_bytes() {
        let dev = SimDevice::default();
        let a = dev.malloc(8).unwrap();
        let b = dev.malloc(8).unwrap();

        dev.memcpy_htod(a, &[1, 2, 3, 4]).unwrap();
        dev.memcpy_dtod(b, a, 8).unwrap();

        let mut out = [0u8; 8];
        dev.memcpy_dtoh(&mut out, b).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 0, 0, 0, 0]);

        let err = dev.memcpy_htod(a, &[0u8; 16]).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfBounds { requested: 16, capacity: 8 }));
    }

    #[test]
    fn async_copy_lands_after_synchronize() {
        let dev = SimDevice::default();
        let stream = dev.create_stream().unwrap();
        let a = dev.malloc(4).unwrap();
        let b = dev.malloc(4).unwrap();
        dev.memcpy_htod(a, &[9, 9, 9, 9]).unwrap();

        dev.memcpy_dtod_async(b, a, 4, stream).unwrap();
        dev.synchronize_stream(stream).unwrap();

        let mut out = [0u8; 4];
        dev.memcpy_dtoh(&mut out, b).unwrap();
        assert_eq!(out, [9, 9, 9, 9]);
    }

    #[test]
    fn streams_do_not_wait_on_each_other() {
        let dev = SimDevice::default();
        let blocked = dev.create_stream().unwrap();
        let free = dev.create_stream().unwrap();

        let release = Arc::new(AtomicBool::new(false));
        let gate = release.clone();
        dev.launch(blocked, move || {
            while !gate.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        dev.launch(free, move || flag.store(true, Ordering::Release))
            .unwrap();

        // The free stream drains while the other one is still stuck.
        dev.synchronize_stream(free).unwrap();
        assert!(ran.load(Ordering::Acquire));

        release.store(true, Ordering::Release);
        dev.synchronize_stream(blocked).unwrap();
    }

    #[test]
    fn stream_limit_fails_creation() {
        let dev = SimDevice::default().with_max_streams(1);
        let s = dev.create_stream().unwrap();
        assert!(matches!(dev.create_stream(), Err(DeviceError::Driver(_))));

        dev.destroy_stream(s).unwrap();
        assert!(dev.create_stream().is_ok());
    }

    #[test]
    fn reset_drops_everything_on_current_device() {
        let dev = SimDevice::default();
        dev.malloc(1024).unwrap();
        dev.create_stream().unwrap();

        dev.reset().unwrap();
        assert_eq!(dev.allocated_bytes(0), 0);
        assert_eq!(dev.stream_count(), 0);
    }

    #[test]
    fn no_devices_machine() {
        let dev = SimDevice::new(Vec::new());
        assert_eq!(dev.device_count().unwrap(), 0);
        assert!(dev.set_device(0).is_err());
    }
}
