//! Direct tenant allocations, addressed by opaque handles.
//!
//! Callers outside the kernel never see a device address. They get a
//! `MemoryHandle` and the kernel resolves it here.

use crate::device::DevicePtr;
use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

/// Opaque token for a direct allocation. Never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryHandle(pub u64);

impl fmt::Display for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectAllocation {
    pub handle: MemoryHandle,
    pub tenant: String,
    pub size: usize,
    pub allocated_at: SystemTime,
    pub(crate) ptr: DevicePtr,
}

/// Handle → allocation table.
#[derive(Debug)]
pub struct DirectAllocations {
    entries: HashMap<MemoryHandle, DirectAllocation>,
    next_handle: u64,
}

impl Default for DirectAllocations {
    fn default() -> Self {
        // Handle 0 is never issued so it can stand for "null" at a boundary.
        Self {
            entries: HashMap::new(),
            next_handle: 1,
        }
    }
}

impl DirectAllocations {
    pub fn insert(&mut self, tenant: &str, size: usize, ptr: DevicePtr) -> MemoryHandle {
        let handle = MemoryHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.insert(
            handle,
            DirectAllocation {
                handle,
                tenant: tenant.to_string(),
                size,
                allocated_at: SystemTime::now(),
                ptr,
            },
        );
        handle
    }

    pub fn get(&self, handle: MemoryHandle) -> Option<&DirectAllocation> {
        self.entries.get(&handle)
    }

    pub fn remove(&mut self, handle: MemoryHandle) -> Option<DirectAllocation> {
        self.entries.remove(&handle)
    }

    /// Allocations owned by `tenant`, oldest handle first.
    pub fn for_tenant(&self, tenant: &str) -> Vec<DirectAllocation> {
        let mut owned: Vec<DirectAllocation> = self
            .entries
            .values()
            .filter(|a| a.tenant == tenant)
            .cloned()
            .collect();
        owned.sort_by_key(|a| a.handle);
        owned
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.values().map(|a| a.size).sum()
    }

    /// Take every allocation out, for teardown. Handles keep counting up.
    pub fn drain(&mut self) -> Vec<DirectAllocation> {
        self.entries.drain().map(|(_, a)| a).collect()
    }
}
