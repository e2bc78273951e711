//! Performance and utilization counters.
//!
//! Both reports are flat `name → number` maps so they can be handed across
//! a language boundary untouched. Key names are the constants in [`keys`].

use crate::device::DeviceInfo;
use std::collections::BTreeMap;
use std::time::Duration;

pub mod keys {
    pub const COMPUTE_CAPABILITY: &str = "compute_capability";
    pub const MULTI_PROCESSOR_COUNT: &str = "multi_processor_count";
    pub const MAX_THREADS_PER_BLOCK: &str = "max_threads_per_block";
    pub const MAX_BLOCKS_PER_GRID: &str = "max_blocks_per_grid";
    pub const TOTAL_MEMORY_GB: &str = "total_memory_gb";
    pub const FREE_MEMORY_GB: &str = "free_memory_gb";
    pub const MEMORY_UTILIZATION: &str = "memory_utilization";
    pub const ACTIVE_TASKS: &str = "active_tasks";
    pub const QUEUED_TASKS: &str = "queued_tasks";
    pub const ALLOCATED_COMPUTE_NODES: &str = "allocated_compute_nodes";
    pub const TOTAL_COMPUTE_NODES: &str = "total_compute_nodes";
    pub const ALLOCATED_MEMORY_PARTITIONS: &str = "allocated_memory_partitions";
    pub const TOTAL_MEMORY_PARTITIONS: &str = "total_memory_partitions";
    pub const TOTAL_STREAMS: &str = "total_streams";
    pub const DIRECT_ALLOCATIONS: &str = "direct_allocations";
    pub const DIRECT_ALLOCATED_BYTES: &str = "direct_allocated_bytes";
    pub const TASKS_COMPLETED: &str = "tasks_completed";
    pub const TASKS_FAILED: &str = "tasks_failed";
    pub const AVG_TASK_MS: &str = "avg_task_ms";
    pub const MAX_TASK_MS: &str = "max_task_ms";
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Task execution timings, collected only while profiling is enabled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileStats {
    pub completed: u64,
    pub failed: u64,
    pub total: Duration,
    pub max: Duration,
}

impl ProfileStats {
    pub fn record(&mut self, elapsed: Duration, succeeded: bool) {
        if succeeded {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.total += elapsed;
        self.max = self.max.max(elapsed);
    }

    pub fn runs(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn average(&self) -> Duration {
        match self.runs() {
            0 => Duration::ZERO,
            n => Duration::from_secs_f64(self.total.as_secs_f64() / n as f64),
        }
    }
}

/// Counts taken from kernel state under its lock.
#[derive(Debug, Clone, Default)]
pub struct UsageSnapshot {
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub allocated_nodes: usize,
    pub total_nodes: usize,
    pub allocated_partitions: usize,
    pub total_partitions: usize,
    pub streams: usize,
    pub direct_allocations: usize,
    pub direct_bytes: usize,
}

/// Device properties, memory figures, and task/resource counts.
pub fn performance_metrics(
    device: &DeviceInfo,
    mem_info: Option<(usize, usize)>,
    usage: &UsageSnapshot,
    profile: Option<&ProfileStats>,
) -> BTreeMap<String, f64> {
    let mut m = BTreeMap::new();
    let mut put = |k: &str, v: f64| {
        m.insert(k.to_string(), v);
    };

    put(keys::COMPUTE_CAPABILITY, device.compute_capability as f64);
    put(keys::MULTI_PROCESSOR_COUNT, device.multiprocessor_count as f64);
    put(keys::MAX_THREADS_PER_BLOCK, device.max_threads_per_block as f64);
    put(keys::MAX_BLOCKS_PER_GRID, device.max_blocks_per_grid as f64);

    if let Some((free, total)) = mem_info {
        put(keys::TOTAL_MEMORY_GB, total as f64 / GIB);
        put(keys::FREE_MEMORY_GB, free as f64 / GIB);
        let utilization = if total == 0 {
            0.0
        } else {
            (total - free) as f64 / total as f64 * 100.0
        };
        put(keys::MEMORY_UTILIZATION, utilization);
    }

    put(keys::ACTIVE_TASKS, usage.active_tasks as f64);
    put(keys::QUEUED_TASKS, usage.queued_tasks as f64);
    put(keys::ALLOCATED_COMPUTE_NODES, usage.allocated_nodes as f64);
    put(keys::ALLOCATED_MEMORY_PARTITIONS, usage.allocated_partitions as f64);

    if let Some(p) = profile {
        put(keys::TASKS_COMPLETED, p.completed as f64);
        put(keys::TASKS_FAILED, p.failed as f64);
        put(keys::AVG_TASK_MS, p.average().as_secs_f64() * 1000.0);
        put(keys::MAX_TASK_MS, p.max.as_secs_f64() * 1000.0);
    }
    m
}

/// Allocated/total counts for every resource the kernel tracks.
pub fn resource_usage(usage: &UsageSnapshot) -> BTreeMap<String, usize> {
    [
        (keys::ALLOCATED_COMPUTE_NODES, usage.allocated_nodes),
        (keys::TOTAL_COMPUTE_NODES, usage.total_nodes),
        (keys::ALLOCATED_MEMORY_PARTITIONS, usage.allocated_partitions),
        (keys::TOTAL_MEMORY_PARTITIONS, usage.total_partitions),
        (keys::ACTIVE_TASKS, usage.active_tasks),
        (keys::TOTAL_STREAMS, usage.streams),
        (keys::DIRECT_ALLOCATIONS, usage.direct_allocations),
        (keys::DIRECT_ALLOCATED_BYTES, usage.direct_bytes),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
