//! Per-tenant stream registry.
//!
//! Every tenant gets its own device streams so its asynchronous work never
//! queues behind another tenant's. The registry only tracks ownership; the
//! streams themselves live in the device backend.

use crate::device::StreamId;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Opaque token for a tenant stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub u64);

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

#[derive(Debug)]
struct Entry {
    tenant: String,
    device_stream: StreamId,
}

/// Tenant → streams table, plus handle → device stream resolution.
#[derive(Debug)]
pub struct StreamRegistry {
    by_tenant: BTreeMap<String, Vec<StreamHandle>>,
    entries: HashMap<StreamHandle, Entry>,
    next_handle: u64,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self {
            by_tenant: BTreeMap::new(),
            entries: HashMap::new(),
            next_handle: 1,
        }
    }
}

impl StreamRegistry {
    /// Record a device stream as belonging to `tenant`.
    pub fn register(&mut self, tenant: &str, device_stream: StreamId) -> StreamHandle {
        let handle = StreamHandle(self.next_handle);
        self.next_handle += 1;

        self.by_tenant
            .entry(tenant.to_string())
            .or_default()
            .push(handle);
        self.entries.insert(
            handle,
            Entry {
                tenant: tenant.to_string(),
                device_stream,
            },
        );
        handle
    }

    /// Forget a stream, returning its owner and device stream.
    pub fn unregister(&mut self, handle: StreamHandle) -> Option<(String, StreamId)> {
        let entry = self.entries.remove(&handle)?;
        if let Some(streams) = self.by_tenant.get_mut(&entry.tenant) {
            streams.retain(|h| *h != handle);
            if streams.is_empty() {
                self.by_tenant.remove(&entry.tenant);
            }
        }
        Some((entry.tenant, entry.device_stream))
    }

    pub fn resolve(&self, handle: StreamHandle) -> Option<StreamId> {
        self.entries.get(&handle).map(|e| e.device_stream)
    }

    pub fn owner(&self, handle: StreamHandle) -> Option<&str> {
        self.entries.get(&handle).map(|e| e.tenant.as_str())
    }

    /// Streams of `tenant` in creation order.
    pub fn streams_for(&self, tenant: &str) -> Vec<StreamHandle> {
        self.by_tenant.get(tenant).cloned().unwrap_or_default()
    }

    /// Tenants owning at least one stream.
    pub fn tenants(&self) -> Vec<String> {
        self.by_tenant.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every stream, returning the device streams to destroy.
    pub fn drain(&mut self) -> Vec<(StreamHandle, StreamId)> {
        self.by_tenant.clear();
        let mut drained: Vec<(StreamHandle, StreamId)> = self
            .entries
            .drain()
            .map(|(h, e)| (h, e.device_stream))
            .collect();
        drained.sort_by_key(|(h, _)| *h);
        drained
    }
}
