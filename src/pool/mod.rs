//! Compute/memory resource pool: the inventory every tenant draws from.
//!
//! The pool is built from the selected device's properties: one compute
//! node per streaming multiprocessor, and a fixed layout of equally sized
//! global-memory partitions. Tenants (and the scheduler, on their behalf)
//! claim entries and give them back; nothing is ever handed out twice.
//!
//! The pool itself does no locking and no device calls. The kernel owns it
//! behind its single lock and performs the driver work around it.

pub mod allocations;
pub mod partition;

pub use partition::{MemoryKind, MemoryPartition, PartitionId};

use crate::device::{DeviceInfo, DevicePtr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;

/// Identifier of a compute node within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from pool bookkeeping.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("compute node {0} does not exist")]
    NodeNotFound(NodeId),

    #[error("compute node {0} is already allocated")]
    NodeAlreadyAllocated(NodeId),

    #[error("compute node {0} is not currently allocated")]
    NodeNotAllocated(NodeId),

    #[error("memory partition {0} does not exist")]
    PartitionNotFound(PartitionId),

    #[error("memory partition {0} is not currently allocated")]
    PartitionNotAllocated(PartitionId),

    #[error("no free memory partition of {kind:?} with at least {size} bytes")]
    NoPartitionAvailable { size: usize, kind: MemoryKind },
}

/// What kind of hardware a compute node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeNodeKind {
    #[default]
    TensorCore,
    CudaCore,
    MemoryBank,
    SharedMemory,
    L2Cache,
}

/// How a free entry is picked when several satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// First entry in pool order that is large enough.
    #[default]
    FirstFit,
    /// Smallest entry that is large enough; ties keep pool order.
    BestFit,
}

/// A fixed slice of device compute capacity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputeNode {
    pub id: NodeId,
    pub kind: ComputeNodeKind,
    /// Device memory attributed to this node, in bytes.
    pub memory_size: usize,
    /// Compute capacity score (estimated cores).
    pub compute_capacity: usize,
    pub allocated: bool,
    pub active: bool,
    pub last_used: Option<SystemTime>,
    /// Tenant holding the node while `allocated`.
    pub owner: Option<String>,
    /// Task holding the node, when it was claimed by the scheduler.
    pub task_id: Option<String>,
    /// Created on demand rather than derived from a multiprocessor.
    pub is_virtual: bool,
    /// Tenant that created a virtual node. Kept after the node is released.
    pub creator: Option<String>,
    pub cores: Vec<u32>,
    pub memory_regions: Vec<usize>,
    pub extensions: HashMap<String, String>,
}

impl ComputeNode {
    fn fits(&self, memory: usize, cores: usize) -> bool {
        self.memory_size >= memory && self.compute_capacity >= cores
    }

    fn claim(&mut self, tenant: &str, task_id: Option<&str>) {
        self.allocated = true;
        self.active = true;
        self.last_used = Some(SystemTime::now());
        self.owner = Some(tenant.to_string());
        self.task_id = task_id.map(str::to_string);
    }

    fn release(&mut self) {
        self.allocated = false;
        self.active = false;
        self.owner = None;
        self.task_id = None;
    }
}

/// Inventory of compute nodes and memory partitions for one device.
#[derive(Debug, Default)]
pub struct ResourcePool {
    nodes: Vec<ComputeNode>,
    partitions: Vec<MemoryPartition>,
    next_node_id: u32,
    next_partition_id: u32,
}

impl ResourcePool {
    /// Build the initial layout for a device.
    ///
    /// One tensor-core node per multiprocessor, each credited with an equal
    /// share of memory and tensor cores, plus `partition_count` unallocated
    /// global-memory partitions of `total_memory / partition_count` bytes.
    pub fn from_device(info: &DeviceInfo, partition_count: usize) -> Self {
        let mut pool = Self::default();

        let node_count = info.multiprocessor_count as usize;
        for i in 0..node_count {
            pool.nodes.push(ComputeNode {
                id: NodeId(i as u32),
                memory_size: info.total_memory / node_count,
                compute_capacity: info.tensor_core_count as usize / node_count,
                cores: (0..DeviceInfo::TENSOR_CORES_PER_SM).collect(),
                ..Default::default()
            });
        }
        pool.next_node_id = node_count as u32;

        let partition_size = info.total_memory / partition_count.max(1);
        for i in 0..partition_count {
            pool.partitions.push(MemoryPartition {
                id: PartitionId(i as u32),
                size: partition_size,
                offset: i * partition_size,
                ..Default::default()
            });
        }
        pool.next_partition_id = partition_count as u32;

        tracing::info!(
            nodes = node_count,
            partitions = partition_count,
            partition_size,
            "initialized resource pool"
        );
        pool
    }

    // ---- compute nodes -------------------------------------------------

    pub fn nodes(&self) -> &[ComputeNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&ComputeNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut ComputeNode, PoolError> {
        self.nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(PoolError::NodeNotFound(id))
    }

    /// Hand a specific node to a tenant.
    pub fn allocate_node(&mut self, id: NodeId, tenant: &str) -> Result<(), PoolError> {
        let node = self.node_mut(id)?;
        if node.allocated {
            return Err(PoolError::NodeAlreadyAllocated(id));
        }
        node.claim(tenant, None);
        Ok(())
    }

    /// Return a node to the pool.
    pub fn deallocate_node(&mut self, id: NodeId) -> Result<(), PoolError> {
        let node = self.node_mut(id)?;
        if !node.allocated {
            return Err(PoolError::NodeNotAllocated(id));
        }
        node.release();
        Ok(())
    }

    /// Find a free node with at least `memory` bytes and `cores` capacity.
    pub fn find_node(&self, memory: usize, cores: usize, policy: MatchPolicy) -> Option<NodeId> {
        let mut candidates = self
            .nodes
            .iter()
            .filter(|n| !n.allocated && n.fits(memory, cores));

        match policy {
            MatchPolicy::FirstFit => candidates.next(),
            MatchPolicy::BestFit => {
                candidates.min_by_key(|n| n.memory_size.saturating_add(n.compute_capacity))
            }
        }
        .map(|n| n.id)
    }

    /// Whether any node, allocated or not, could ever hold the request.
    pub fn can_satisfy(&self, memory: usize, cores: usize) -> bool {
        self.nodes.iter().any(|n| n.fits(memory, cores))
    }

    /// Match and allocate a node for a scheduled task in one step.
    pub fn claim_node_for_task(
        &mut self,
        memory: usize,
        cores: usize,
        tenant: &str,
        task_id: &str,
        policy: MatchPolicy,
    ) -> Option<NodeId> {
        let id = self.find_node(memory, cores, policy)?;
        if let Ok(node) = self.node_mut(id) {
            node.claim(tenant, Some(task_id));
        }
        Some(id)
    }

    /// Release a node claimed by `claim_node_for_task`, but only if that
    /// task still holds it.
    pub fn release_task_node(&mut self, id: NodeId, task_id: &str) -> Result<(), PoolError> {
        let node = self.node_mut(id)?;
        if !node.allocated || node.task_id.as_deref() != Some(task_id) {
            return Err(PoolError::NodeNotAllocated(id));
        }
        node.release();
        Ok(())
    }

    /// Add an on-demand node, already allocated to `tenant`.
    pub fn add_virtual_node(&mut self, tenant: &str, memory: usize, cores: usize) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;

        let mut node = ComputeNode {
            id,
            memory_size: memory,
            compute_capacity: cores,
            is_virtual: true,
            creator: Some(tenant.to_string()),
            ..Default::default()
        };
        node.claim(tenant, None);
        self.nodes.push(node);
        id
    }

    /// Remove every virtual node `tenant` created, whether or not it still
    /// holds it. Returns how many went.
    pub fn remove_virtual_nodes(&mut self, tenant: &str) -> usize {
        let before = self.nodes.len();
        self.nodes
            .retain(|n| !(n.is_virtual && n.creator.as_deref() == Some(tenant)));
        before - self.nodes.len()
    }

    pub fn allocated_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.allocated).count()
    }

    pub fn total_nodes(&self) -> usize {
        self.nodes.len()
    }

    // ---- memory partitions --------------------------------------------

    pub fn partitions(&self) -> &[MemoryPartition] {
        &self.partitions
    }

    pub fn partition(&self, id: PartitionId) -> Option<&MemoryPartition> {
        self.partitions.iter().find(|p| p.id == id)
    }

    fn partition_mut(&mut self, id: PartitionId) -> Result<&mut MemoryPartition, PoolError> {
        self.partitions
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(PoolError::PartitionNotFound(id))
    }

    /// Record a freshly allocated partition under the next sequential id.
    pub fn insert_partition(
        &mut self,
        size: usize,
        kind: MemoryKind,
        tenant: &str,
        device_ptr: DevicePtr,
    ) -> PartitionId {
        let id = PartitionId(self.next_partition_id);
        self.next_partition_id += 1;

        let offset = self
            .partitions
            .last()
            .map(|p| p.offset + p.size)
            .unwrap_or(0);
        let mut partition = MemoryPartition {
            id,
            kind,
            size,
            offset,
            device_ptr: Some(device_ptr),
            ..Default::default()
        };
        partition.claim(tenant);
        self.partitions.push(partition);
        id
    }

    /// Device memory behind an allocated partition, checked before the
    /// entry is removed.
    pub fn partition_for_removal(&self, id: PartitionId) -> Result<Option<DevicePtr>, PoolError> {
        let partition = self.partition(id).ok_or(PoolError::PartitionNotFound(id))?;
        if !partition.allocated {
            return Err(PoolError::PartitionNotAllocated(id));
        }
        Ok(partition.device_ptr)
    }

    /// Drop a partition entry. Its id is never handed out again.
    pub fn remove_partition(&mut self, id: PartitionId) -> Result<MemoryPartition, PoolError> {
        let idx = self
            .partitions
            .iter()
            .position(|p| p.id == id)
            .ok_or(PoolError::PartitionNotFound(id))?;
        Ok(self.partitions.remove(idx))
    }

    /// Find a free partition of `kind` with at least `size` bytes.
    pub fn find_partition(
        &self,
        size: usize,
        kind: MemoryKind,
        policy: MatchPolicy,
    ) -> Option<PartitionId> {
        let mut candidates = self
            .partitions
            .iter()
            .filter(|p| !p.allocated && p.kind == kind && p.size >= size);

        match policy {
            MatchPolicy::FirstFit => candidates.next(),
            MatchPolicy::BestFit => candidates.min_by_key(|p| p.size),
        }
        .map(|p| p.id)
    }

    /// Claim an existing free partition for a tenant.
    pub fn claim_partition(
        &mut self,
        size: usize,
        kind: MemoryKind,
        tenant: &str,
        policy: MatchPolicy,
    ) -> Result<PartitionId, PoolError> {
        let id = self
            .find_partition(size, kind, policy)
            .ok_or(PoolError::NoPartitionAvailable { size, kind })?;
        self.partition_mut(id)?.claim(tenant);
        Ok(id)
    }

    /// Give a claimed partition back without destroying it.
    pub fn release_partition(&mut self, id: PartitionId) -> Result<(), PoolError> {
        let partition = self.partition_mut(id)?;
        if !partition.allocated {
            return Err(PoolError::PartitionNotAllocated(id));
        }
        partition.release();
        Ok(())
    }

    /// Device memory held by any partition, for teardown.
    pub fn partition_device_ptrs(&self) -> Vec<(PartitionId, DevicePtr)> {
        self.partitions
            .iter()
            .filter_map(|p| p.device_ptr.map(|ptr| (p.id, ptr)))
            .collect()
    }

    pub fn allocated_partitions(&self) -> usize {
        self.partitions.iter().filter(|p| p.allocated).count()
    }

    pub fn total_partitions(&self) -> usize {
        self.partitions.len()
    }
}
