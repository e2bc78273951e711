//! Device boundary: the only place the kernel touches hardware.
//!
//! The `DeviceBackend` trait is the cutpoint between resource bookkeeping
//! and the driver. The kernel never holds raw device addresses of its own;
//! it asks a backend for memory and streams and gets back opaque tokens
//! (`DevicePtr`, `StreamId`) that only the backend can interpret.
//!
//! Two backends ship with the crate: [`sim::SimDevice`], an in-process
//! device used by tests and demos, and `cuda::CudaDevice` (feature `cuda`).

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod sim;

use thiserror::Error;

/// Device memory address as understood by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevicePtr(pub u64);

/// Backend-level identifier of a command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// Errors from a device backend.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no compute devices found")]
    NoDevices,

    #[error("invalid device ordinal {0}")]
    InvalidDevice(usize),

    #[error("out of device memory ({requested} bytes requested, {available} available)")]
    OutOfMemory { requested: usize, available: usize },

    #[error("invalid device pointer {0:?}")]
    InvalidPointer(DevicePtr),

    #[error("copy of {requested} bytes exceeds allocation of {capacity} bytes")]
    OutOfBounds { requested: usize, capacity: usize },

    #[error("invalid stream {0:?}")]
    InvalidStream(StreamId),

    #[error("driver error: {0}")]
    Driver(String),

    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),
}

/// Static and dynamic description of one physical device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub device_id: usize,
    pub name: String,
    pub total_memory: usize,
    pub free_memory: usize,
    /// `major * 10 + minor`, e.g. 89 for sm_89.
    pub compute_capability: u32,
    pub max_threads_per_block: u32,
    pub max_blocks_per_grid: u32,
    pub max_threads_per_multiprocessor: u32,
    pub multiprocessor_count: u32,
    /// Estimate, see [`DeviceInfo::TENSOR_CORES_PER_SM`].
    pub tensor_core_count: u32,
    /// Estimate, see [`DeviceInfo::CUDA_CORES_PER_SM`].
    pub cuda_core_count: u32,
    pub supports_nvlink: bool,
}

impl DeviceInfo {
    /// Rough per-SM tensor core count used for capacity estimates.
    pub const TENSOR_CORES_PER_SM: u32 = 8;
    /// Rough per-SM general core count used for capacity estimates.
    pub const CUDA_CORES_PER_SM: u32 = 64;

    /// Fill in the derived fields from the raw properties a driver reports.
    pub fn with_estimates(mut self) -> Self {
        self.tensor_core_count = self.multiprocessor_count * Self::TENSOR_CORES_PER_SM;
        self.cuda_core_count = self.multiprocessor_count * Self::CUDA_CORES_PER_SM;
        // NVLink shows up from Volta (7.0) onwards.
        self.supports_nvlink = self.compute_capability >= 70;
        self
    }
}

/// The contract between the kernel and a physical (or simulated) device.
///
/// Implementations do their own internal locking; the kernel may call them
/// with or without its own lock held, from any thread.
pub trait DeviceBackend: Send + Sync {
    /// Number of devices visible to this backend.
    fn device_count(&self) -> Result<usize, DeviceError>;

    /// Properties and current memory figures of device `ordinal`.
    fn device_info(&self, ordinal: usize) -> Result<DeviceInfo, DeviceError>;

    /// Make `ordinal` the device subsequent calls operate on.
    fn set_device(&self, ordinal: usize) -> Result<(), DeviceError>;

    /// The device selected by the last successful `set_device`.
    fn current_device(&self) -> usize;

    /// `(free, total)` bytes on the current device.
    fn mem_info(&self) -> Result<(usize, usize), DeviceError>;

    /// Allocate `bytes` of device memory on the current device.
    fn malloc(&self, bytes: usize) -> Result<DevicePtr, DeviceError>;

    /// Release memory returned by `malloc`.
    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError>;

    /// Copy host bytes into the start of a device allocation.
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DeviceError>;

    /// Copy the start of a device allocation into host memory.
    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DeviceError>;

    /// Blocking device-to-device copy.
    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize)
        -> Result<(), DeviceError>;

    /// Enqueue a device-to-device copy on `stream`; returns once queued.
    fn memcpy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: StreamId,
    ) -> Result<(), DeviceError>;

    /// Create an independent, ordered command stream.
    fn create_stream(&self) -> Result<StreamId, DeviceError>;

    /// Destroy a stream. Work already queued on it still completes.
    fn destroy_stream(&self, stream: StreamId) -> Result<(), DeviceError>;

    /// Block until every operation queued on `stream` has finished.
    fn synchronize_stream(&self, stream: StreamId) -> Result<(), DeviceError>;

    /// Drop every allocation and stream on the current device.
    fn reset(&self) -> Result<(), DeviceError>;
}
