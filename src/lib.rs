//! gpu-tenant: multi-tenant GPU resource kernel.
//!
//! Shares one device among several model-serving tenants: a pool of
//! compute nodes and memory partitions carved from the device, isolated
//! command streams per tenant, opaque-handle memory allocations, and a
//! background scheduler that runs queued jobs on a worker pool.

pub mod config;
pub mod device;
pub mod kernel;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod stream;

pub use config::KernelConfig;
pub use device::sim::SimDevice;
pub use device::{DeviceBackend, DeviceInfo};
pub use kernel::{Kernel, KernelError};
pub use pool::allocations::MemoryHandle;
pub use pool::{ComputeNode, MatchPolicy, MemoryKind, MemoryPartition, NodeId, PartitionId};
pub use scheduler::{ComputeTask, Job, JobContext, JobError, QueuePolicy, TaskId, TaskPriority, TaskState};
pub use stream::StreamHandle;
