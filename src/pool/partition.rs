//! Memory partitions: fixed-size slices of device memory.

use crate::device::DevicePtr;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Identifier of a memory partition. Assigned sequentially, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Memory space a partition lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    #[default]
    Global,
    Shared,
    Constant,
    Texture,
    Local,
}

/// A slice of device memory, optionally owned by a tenant.
///
/// Partitions from the initial layout describe a region (`offset`, `size`)
/// but hold no device memory of their own (`device_ptr == None`); those
/// created on demand own a dedicated allocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryPartition {
    pub id: PartitionId,
    pub kind: MemoryKind,
    pub size: usize,
    pub offset: usize,
    pub allocated: bool,
    pub device_ptr: Option<DevicePtr>,
    /// Host mirror address, when the partition is mapped for host access.
    pub host_ptr: Option<u64>,
    pub owner: Option<String>,
    pub allocated_at: Option<SystemTime>,
}

impl MemoryPartition {
    pub(super) fn claim(&mut self, tenant: &str) {
        self.allocated = true;
        self.owner = Some(tenant.to_string());
        self.allocated_at = Some(SystemTime::now());
    }

    pub(super) fn release(&mut self) {
        self.allocated = false;
        self.owner = None;
        self.allocated_at = None;
    }
}
