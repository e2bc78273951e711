//! The kernel: one shared device, many tenants.
//!
//! `Kernel` is the context object everything else goes through. It owns the
//! resource pool, the per-tenant stream and allocation registries, the task
//! table and run queue, all behind a single lock, plus a background
//! scheduler thread and a worker pool that runs task jobs.
//!
//! ```ignore
//! let kernel = Kernel::new(KernelConfig::load()?, Arc::new(SimDevice::default()))?;
//! kernel.handlers().register_fn("echo", |ctx| Ok(ctx.param("msg")?.to_string()));
//! kernel.initialize()?;
//!
//! let task = ComputeTask::new("req-1", "llm-a", Job::new("echo").with_param("msg", "hi"))
//!     .with_memory(1024)
//!     .with_cores(1);
//! let id = kernel.schedule_task(task)?;
//! // ... later
//! let status = kernel.get_task_status(&id);
//! ```
//!
//! A scheduler pass claims nodes under the lock and hands the claimed tasks
//! to the workers; jobs run without the lock and re-take it only to record
//! their outcome and give the node back. A node stays allocated for the
//! whole run, so allocated + free always equals total.

use crate::config::{ConfigError, KernelConfig};
use crate::device::{DeviceBackend, DeviceError, DeviceInfo};
use crate::metrics::{self, ProfileStats, UsageSnapshot};
use crate::pool::allocations::{DirectAllocation, DirectAllocations, MemoryHandle};
use crate::pool::{
    ComputeNode, MatchPolicy, MemoryKind, MemoryPartition, NodeId, PartitionId, PoolError,
    ResourcePool,
};
use crate::scheduler::{
    self, ComputeTask, Dispatch, JobContext, JobError, JobHandlers, TaskId, TaskQueue, TaskState,
};
use crate::stream::{StreamHandle, StreamRegistry};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use validator::Validate;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel is not initialized")]
    NotInitialized,

    #[error("kernel is already initialized")]
    AlreadyInitialized,

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("task {id} is {state:?} and can no longer be cancelled")]
    TaskNotCancellable { id: TaskId, state: TaskState },

    #[error("unknown memory handle {0}")]
    UnknownMemory(MemoryHandle),

    #[error("unknown stream handle {0}")]
    UnknownStream(StreamHandle),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to start scheduler thread: {0}")]
    SchedulerSpawn(std::io::Error),
}

/// Log a failed operation and hand the error back.
fn logged<E: Into<KernelError>>(op: &'static str) -> impl FnOnce(E) -> KernelError {
    move |e| {
        let e = e.into();
        tracing::error!(op, error = %e, "kernel operation failed");
        e
    }
}

fn reject<T>(op: &'static str, err: KernelError) -> Result<T, KernelError> {
    Err(logged(op)(err))
}

/// Everything guarded by the kernel lock.
#[derive(Debug)]
struct KernelState {
    initialized: bool,
    /// Bumped by every initialize and shutdown; work dispatched under an
    /// older generation is not committed.
    generation: u64,
    selected_device: Option<usize>,
    current_device: Option<DeviceInfo>,
    pool: ResourcePool,
    tasks: BTreeMap<TaskId, ComputeTask>,
    queue: TaskQueue,
    streams: StreamRegistry,
    allocations: DirectAllocations,
    profile: ProfileStats,
}

impl KernelState {
    /// Match queued tasks to free nodes.
    ///
    /// Tasks that fit no node at all are dropped. Tasks that only fit nodes
    /// that are busy right now go back to the front of the queue.
    fn plan_pass(&mut self, policy: MatchPolicy) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        let mut deferred = Vec::new();

        for (id, priority) in self.queue.drain() {
            // Cancelled since it was queued.
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if task.state != TaskState::Queued {
                continue;
            }

            let (memory, cores) = (task.required_memory, task.required_cores);
            if !self.pool.can_satisfy(memory, cores) {
                task.state = TaskState::Dropped;
                task.result = format!(
                    "no compute node offers {memory} bytes and {cores} cores"
                );
                tracing::warn!(task_id = %id, memory, cores, "dropping unsatisfiable task");
                continue;
            }

            let claimed =
                self.pool
                    .claim_node_for_task(memory, cores, &task.tenant_id, id.as_str(), policy);
            match claimed {
                Some(node) => {
                    task.state = TaskState::Running;
                    task.assigned_node = Some(node);
                    dispatches.push(Dispatch {
                        task_id: id.clone(),
                        tenant_id: task.tenant_id.clone(),
                        job: task.job.clone().unwrap_or_default(),
                        node,
                        generation: self.generation,
                    });
                }
                None => deferred.push((id, priority)),
            }
        }

        if !deferred.is_empty() {
            tracing::debug!(deferred = deferred.len(), "no free node, tasks stay queued");
            self.queue.requeue_front(deferred);
        }
        dispatches
    }

    fn usage(&self) -> UsageSnapshot {
        UsageSnapshot {
            active_tasks: self.tasks.len(),
            queued_tasks: self.queue.len(),
            allocated_nodes: self.pool.allocated_nodes(),
            total_nodes: self.pool.total_nodes(),
            allocated_partitions: self.pool.allocated_partitions(),
            total_partitions: self.pool.total_partitions(),
            streams: self.streams.len(),
            direct_allocations: self.allocations.len(),
            direct_bytes: self.allocations.total_bytes(),
        }
    }
}

/// State shared with the scheduler thread and the workers.
struct Shared {
    config: KernelConfig,
    device: Arc<dyn DeviceBackend>,
    handlers: JobHandlers,
    state: Mutex<KernelState>,
    shutdown: AtomicBool,
    profiling: AtomicBool,
    workers: rayon::ThreadPool,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl Shared {
    /// One scheduler pass. Returns how many tasks were handed to workers.
    fn run_pass(self: &Arc<Self>) -> usize {
        let dispatches = {
            let mut state = self.state.lock();
            if !state.initialized {
                return 0;
            }
            state.plan_pass(self.config.match_policy)
        };

        let count = dispatches.len();
        if count > 0 {
            tracing::debug!(dispatched = count, "scheduler pass");
        }
        for dispatch in dispatches {
            *self.in_flight.lock() += 1;
            let shared = Arc::clone(self);
            self.workers.spawn(move || shared.execute(dispatch));
        }
        count
    }

    fn execute(&self, dispatch: Dispatch) {
        let started = Instant::now();
        let outcome = match self.handlers.get(&dispatch.job.kind) {
            None => Err(JobError::UnknownKind(dispatch.job.kind.clone())),
            Some(handler) => {
                let ctx = JobContext {
                    task_id: &dispatch.task_id,
                    tenant_id: &dispatch.tenant_id,
                    node: dispatch.node,
                    job: &dispatch.job,
                };
                panic::catch_unwind(AssertUnwindSafe(|| handler.run(&ctx)))
                    .unwrap_or_else(|payload| Err(JobError::Panicked(panic_message(&*payload))))
            }
        };
        self.commit(&dispatch, outcome, started.elapsed());

        let mut in_flight = self.in_flight.lock();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }

    /// Record a finished job and give its node back.
    fn commit(&self, dispatch: &Dispatch, outcome: Result<String, JobError>, elapsed: Duration) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.generation != dispatch.generation {
            tracing::debug!(task_id = %dispatch.task_id, "kernel restarted, discarding result");
            return;
        }
        if let Err(e) = state
            .pool
            .release_task_node(dispatch.node, dispatch.task_id.as_str())
        {
            tracing::warn!(task_id = %dispatch.task_id, error = %e, "task node already released");
        }

        let Some(task) = state.tasks.get_mut(&dispatch.task_id) else {
            tracing::info!(task_id = %dispatch.task_id, "cancelled task finished, result discarded");
            return;
        };

        if self.profiling.load(Ordering::Relaxed) {
            state.profile.record(elapsed, outcome.is_ok());
        }

        task.completed = true;
        task.completed_at = Some(SystemTime::now());
        task.assigned_node = None;
        match outcome {
            Ok(output) => {
                task.state = TaskState::Completed;
                task.result = output;
                tracing::info!(
                    task_id = %task.id,
                    tenant = %task.tenant_id,
                    node = %dispatch.node,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "task completed"
                );
            }
            Err(e) => {
                task.state = TaskState::Failed;
                task.result = e.to_string();
                tracing::error!(task_id = %task.id, tenant = %task.tenant_id, error = %e, "task failed");
            }
        }
    }

    /// Wait until no job is running, or `timeout` passes. Returns whether
    /// the workers went idle.
    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.in_flight.lock();
        while *in_flight > 0 {
            if self.idle.wait_until(&mut in_flight, deadline).timed_out() {
                return *in_flight == 0;
            }
        }
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn scheduler_loop(shared: Arc<Shared>) {
    let interval = shared.config.poll_interval();
    tracing::debug!(interval_ms = interval.as_millis() as u64, "scheduler started");

    loop {
        let deadline = Instant::now() + interval;
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                tracing::debug!("scheduler stopped");
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
        shared.run_pass();
    }
}

/// Multi-tenant resource kernel for one device backend.
pub struct Kernel {
    shared: Arc<Shared>,
    /// Scheduler thread while initialized. Also serializes initialize and
    /// shutdown against each other.
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl Kernel {
    /// Create an uninitialized kernel. Nothing touches the device until
    /// [`Kernel::initialize`].
    pub fn new(config: KernelConfig, device: Arc<dyn DeviceBackend>) -> Result<Self, KernelError> {
        config
            .validate()
            .map_err(|e| logged("new")(ConfigError::from(e)))?;
        let workers = config.build_worker_pool().map_err(logged("new"))?;

        let state = KernelState {
            initialized: false,
            generation: 0,
            selected_device: None,
            current_device: None,
            pool: ResourcePool::default(),
            tasks: BTreeMap::new(),
            queue: TaskQueue::new(config.queue_policy),
            streams: StreamRegistry::default(),
            allocations: DirectAllocations::default(),
            profile: ProfileStats::default(),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                device,
                handlers: JobHandlers::default(),
                state: Mutex::new(state),
                shutdown: AtomicBool::new(false),
                profiling: AtomicBool::new(false),
                workers,
                in_flight: Mutex::new(0),
                idle: Condvar::new(),
            }),
            scheduler: Mutex::new(None),
        })
    }

    /// The validated configuration this kernel was built with.
    pub fn config(&self) -> &KernelConfig {
        &self.shared.config
    }

    /// Job kinds this kernel can run. Register handlers before scheduling
    /// tasks that name them.
    pub fn handlers(&self) -> &JobHandlers {
        &self.shared.handlers
    }

    fn lock_initialized(
        &self,
        op: &'static str,
    ) -> Result<MutexGuard<'_, KernelState>, KernelError> {
        let state = self.shared.state.lock();
        if !state.initialized {
            return reject(op, KernelError::NotInitialized);
        }
        Ok(state)
    }

    // ---- lifecycle ------------------------------------------------------

    /// Bring the kernel up on the selected device (or `device_ordinal`):
    /// build the pool and start the scheduler. A second call is a no-op.
    pub fn initialize(&self) -> Result<(), KernelError> {
        const OP: &str = "initialize";
        let mut lifecycle = self.scheduler.lock();
        let device = &self.shared.device;
        let config = &self.shared.config;

        {
            let mut state = self.shared.state.lock();
            if state.initialized {
                tracing::warn!("kernel already initialized");
                return Ok(());
            }

            let count = device.device_count().map_err(logged(OP))?;
            if count == 0 {
                return reject(OP, DeviceError::NoDevices.into());
            }
            let ordinal = state.selected_device.unwrap_or(config.device_ordinal);
            device.set_device(ordinal).map_err(logged(OP))?;
            let info = device.device_info(ordinal).map_err(logged(OP))?;

            state.pool = ResourcePool::from_device(&info, config.memory_partitions);
            state.tasks.clear();
            state.queue.clear();
            state.profile = ProfileStats::default();
            state.generation += 1;
            state.initialized = true;
            tracing::info!(
                device = ordinal,
                name = %info.name,
                multiprocessors = info.multiprocessor_count,
                total_memory = info.total_memory,
                "kernel initialized"
            );
            state.current_device = Some(info);
        }

        self.shared.shutdown.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("gpu-tenant-scheduler".to_string())
            .spawn(move || scheduler_loop(shared));

        match spawned {
            Ok(handle) => {
                *lifecycle = Some(handle);
                Ok(())
            }
            Err(e) => {
                let mut state = self.shared.state.lock();
                state.initialized = false;
                state.generation += 1;
                state.pool = ResourcePool::default();
                reject(OP, KernelError::SchedulerSpawn(e))
            }
        }
    }

    /// Stop the scheduler, wait for running jobs (up to the grace period),
    /// then release every device resource and reset the device. Errors are
    /// logged and teardown carries on. No-op when not initialized.
    pub fn shutdown(&self) {
        let mut lifecycle = self.scheduler.lock();
        if !self.shared.state.lock().initialized {
            return;
        }

        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = lifecycle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::error!("scheduler thread panicked");
            }
        }

        let grace = self.shared.config.shutdown_grace();
        if !self.shared.wait_idle(grace) {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "jobs still running after grace period, their results will be discarded"
            );
        }

        let device = &self.shared.device;
        let mut state = self.shared.state.lock();
        state.initialized = false;
        state.generation += 1;

        for (id, ptr) in state.pool.partition_device_ptrs() {
            if let Err(e) = device.free(ptr) {
                tracing::error!(partition = %id, error = %e, "failed to free partition memory");
            }
        }
        for alloc in state.allocations.drain() {
            if let Err(e) = device.free(alloc.ptr) {
                tracing::error!(handle = %alloc.handle, tenant = %alloc.tenant, error = %e, "failed to free tenant memory");
            }
        }
        for (handle, stream) in state.streams.drain() {
            if let Err(e) = device.destroy_stream(stream) {
                tracing::error!(stream = %handle, error = %e, "failed to destroy stream");
            }
        }

        state.tasks.clear();
        state.queue.clear();
        state.pool = ResourcePool::default();

        if let Err(e) = device.reset() {
            tracing::error!(error = %e, "device reset failed");
        }
        tracing::info!("kernel shut down");
    }

    /// Whether the pool is built and the scheduler is running.
    pub fn is_initialized(&self) -> bool {
        self.shared.state.lock().initialized
    }

    // ---- devices --------------------------------------------------------

    /// Every device the backend can see. Empty if enumeration fails.
    pub fn get_available_devices(&self) -> Vec<DeviceInfo> {
        let device = &self.shared.device;
        let listed: Result<Vec<DeviceInfo>, DeviceError> = device
            .device_count()
            .and_then(|count| (0..count).map(|i| device.device_info(i)).collect());
        match listed {
            Ok(devices) => devices,
            Err(e) => {
                tracing::error!(error = %e, "device enumeration failed");
                Vec::new()
            }
        }
    }

    /// Choose the device the next `initialize` uses.
    pub fn select_device(&self, ordinal: usize) -> Result<(), KernelError> {
        const OP: &str = "select_device";
        let mut state = self.shared.state.lock();
        if state.initialized {
            return reject(OP, KernelError::AlreadyInitialized);
        }

        let device = &self.shared.device;
        device.set_device(ordinal).map_err(logged(OP))?;
        let info = device.device_info(ordinal).map_err(logged(OP))?;
        tracing::info!(device = ordinal, name = %info.name, "selected device");

        state.selected_device = Some(ordinal);
        state.current_device = Some(info);
        Ok(())
    }

    /// The device in use, or the one chosen for the next `initialize`.
    pub fn current_device(&self) -> Option<DeviceInfo> {
        self.shared.state.lock().current_device.clone()
    }

    // ---- compute nodes --------------------------------------------------

    /// Snapshot of every compute node, allocated or not.
    pub fn get_available_compute_nodes(&self) -> Vec<ComputeNode> {
        self.shared.state.lock().pool.nodes().to_vec()
    }

    /// Snapshot of one node, `None` if no such node exists.
    pub fn get_compute_node(&self, id: NodeId) -> Option<ComputeNode> {
        self.shared.state.lock().pool.node(id).cloned()
    }

    /// Hand node `id` to `tenant`. Fails if the node is already held.
    pub fn allocate_compute_node(&self, id: NodeId, tenant: &str) -> Result<(), KernelError> {
        const OP: &str = "allocate_compute_node";
        let mut state = self.lock_initialized(OP)?;
        state.pool.allocate_node(id, tenant).map_err(logged(OP))?;
        tracing::info!(node = %id, tenant, "allocated compute node");
        Ok(())
    }

    /// Return node `id` to the pool. Fails if it is not allocated.
    pub fn deallocate_compute_node(&self, id: NodeId) -> Result<(), KernelError> {
        const OP: &str = "deallocate_compute_node";
        let mut state = self.lock_initialized(OP)?;
        state.pool.deallocate_node(id).map_err(logged(OP))?;
        tracing::info!(node = %id, "deallocated compute node");
        Ok(())
    }

    /// Add a node outside the device layout, allocated to `tenant`.
    pub fn create_virtual_compute_node(
        &self,
        tenant: &str,
        memory: usize,
        cores: usize,
    ) -> Result<NodeId, KernelError> {
        const OP: &str = "create_virtual_compute_node";
        if tenant.is_empty() || memory == 0 || cores == 0 {
            return reject(
                OP,
                KernelError::InvalidArgument(
                    "virtual node needs a tenant, memory, and cores".to_string(),
                ),
            );
        }
        let mut state = self.lock_initialized(OP)?;
        let id = state.pool.add_virtual_node(tenant, memory, cores);
        tracing::info!(node = %id, tenant, memory, cores, "created virtual compute node");
        Ok(id)
    }

    /// Remove the virtual nodes `tenant` created, held or not. Returns how
    /// many were removed.
    pub fn destroy_virtual_compute_nodes(&self, tenant: &str) -> usize {
        let removed = self.shared.state.lock().pool.remove_virtual_nodes(tenant);
        if removed > 0 {
            tracing::info!(tenant, removed, "destroyed virtual compute nodes");
        }
        removed
    }

    // ---- memory partitions ----------------------------------------------

    /// Snapshot of every partition, layout and created alike.
    pub fn get_memory_partitions(&self) -> Vec<MemoryPartition> {
        self.shared.state.lock().pool.partitions().to_vec()
    }

    /// Snapshot of one partition, `None` if no such partition exists.
    pub fn get_memory_partition(&self, id: PartitionId) -> Option<MemoryPartition> {
        self.shared.state.lock().pool.partition(id).cloned()
    }

    /// Allocate device memory as a new partition owned by `tenant`.
    pub fn create_memory_partition(
        &self,
        size: usize,
        kind: MemoryKind,
        tenant: &str,
    ) -> Result<PartitionId, KernelError> {
        const OP: &str = "create_memory_partition";
        if size == 0 || tenant.is_empty() {
            return reject(
                OP,
                KernelError::InvalidArgument("partition needs a size and a tenant".to_string()),
            );
        }
        let mut state = self.lock_initialized(OP)?;
        let ptr = self.shared.device.malloc(size).map_err(logged(OP))?;
        let id = state.pool.insert_partition(size, kind, tenant, ptr);
        tracing::info!(partition = %id, size, ?kind, tenant, "created memory partition");
        Ok(id)
    }

    /// Free an allocated partition's device memory and forget it.
    pub fn destroy_memory_partition(&self, id: PartitionId) -> Result<(), KernelError> {
        const OP: &str = "destroy_memory_partition";
        let mut state = self.lock_initialized(OP)?;
        if let Some(ptr) = state.pool.partition_for_removal(id).map_err(logged(OP))? {
            self.shared.device.free(ptr).map_err(logged(OP))?;
        }
        state.pool.remove_partition(id).map_err(logged(OP))?;
        tracing::info!(partition = %id, "destroyed memory partition");
        Ok(())
    }

    /// Claim an existing free partition through the matching policy.
    pub fn acquire_memory_partition(
        &self,
        size: usize,
        kind: MemoryKind,
        tenant: &str,
    ) -> Result<PartitionId, KernelError> {
        const OP: &str = "acquire_memory_partition";
        let mut state = self.lock_initialized(OP)?;
        let id = state
            .pool
            .claim_partition(size, kind, tenant, self.shared.config.match_policy)
            .map_err(logged(OP))?;
        tracing::info!(partition = %id, size, tenant, "acquired memory partition");
        Ok(id)
    }

    /// Give a claimed partition back to the pool.
    pub fn release_memory_partition(&self, id: PartitionId) -> Result<(), KernelError> {
        const OP: &str = "release_memory_partition";
        let mut state = self.lock_initialized(OP)?;
        state.pool.release_partition(id).map_err(logged(OP))?;
        tracing::info!(partition = %id, "released memory partition");
        Ok(())
    }

    // ---- direct memory --------------------------------------------------

    /// Allocate `size` bytes of device memory for `tenant`. The returned
    /// handle is never reused, even across restarts.
    pub fn allocate_memory(&self, size: usize, tenant: &str) -> Result<MemoryHandle, KernelError> {
        const OP: &str = "allocate_memory";
        if size == 0 || tenant.is_empty() {
            return reject(
                OP,
                KernelError::InvalidArgument("allocation needs a size and a tenant".to_string()),
            );
        }
        let mut state = self.lock_initialized(OP)?;
        let ptr = self.shared.device.malloc(size).map_err(logged(OP))?;
        let handle = state.allocations.insert(tenant, size, ptr);
        tracing::info!(%handle, size, tenant, "allocated tenant memory");
        Ok(handle)
    }

    /// Free the device memory behind `handle`.
    pub fn deallocate_memory(&self, handle: MemoryHandle) -> Result<(), KernelError> {
        const OP: &str = "deallocate_memory";
        let mut state = self.shared.state.lock();
        let Some(ptr) = state.allocations.get(handle).map(|a| a.ptr) else {
            return reject(OP, KernelError::UnknownMemory(handle));
        };
        self.shared.device.free(ptr).map_err(logged(OP))?;
        state.allocations.remove(handle);
        tracing::info!(%handle, "deallocated tenant memory");
        Ok(())
    }

    /// Live allocations of `tenant`, oldest first.
    pub fn tenant_allocations(&self, tenant: &str) -> Vec<DirectAllocation> {
        self.shared.state.lock().allocations.for_tenant(tenant)
    }

    /// Copy host bytes into the start of an allocation.
    pub fn write_memory(&self, handle: MemoryHandle, data: &[u8]) -> Result<(), KernelError> {
        const OP: &str = "write_memory";
        let state = self.shared.state.lock();
        let Some(alloc) = state.allocations.get(handle) else {
            return reject(OP, KernelError::UnknownMemory(handle));
        };
        if data.len() > alloc.size {
            return reject(
                OP,
                DeviceError::OutOfBounds {
                    requested: data.len(),
                    capacity: alloc.size,
                }
                .into(),
            );
        }
        self.shared
            .device
            .memcpy_htod(alloc.ptr, data)
            .map_err(logged(OP))
    }

    /// Copy the first `len` bytes of an allocation to the host. `len` may
    /// not exceed the allocation's size.
    pub fn read_memory(&self, handle: MemoryHandle, len: usize) -> Result<Vec<u8>, KernelError> {
        const OP: &str = "read_memory";
        let state = self.shared.state.lock();
        let Some(alloc) = state.allocations.get(handle) else {
            return reject(OP, KernelError::UnknownMemory(handle));
        };
        if len > alloc.size {
            return reject(
                OP,
                DeviceError::OutOfBounds {
                    requested: len,
                    capacity: alloc.size,
                }
                .into(),
            );
        }
        let mut out = vec![0u8; len];
        self.shared
            .device
            .memcpy_dtoh(&mut out, alloc.ptr)
            .map_err(logged(OP))?;
        Ok(out)
    }

    /// Copy `bytes` from `src` to `dst` on the device, synchronously.
    pub fn copy_memory(
        &self,
        dst: MemoryHandle,
        src: MemoryHandle,
        bytes: usize,
    ) -> Result<(), KernelError> {
        const OP: &str = "copy_memory";
        let state = self.shared.state.lock();
        let (dst_ptr, src_ptr) = match (state.allocations.get(dst), state.allocations.get(src)) {
            (Some(d), Some(s)) => (d.ptr, s.ptr),
            (None, _) => return reject(OP, KernelError::UnknownMemory(dst)),
            (_, None) => return reject(OP, KernelError::UnknownMemory(src)),
        };
        self.shared
            .device
            .memcpy_dtod(dst_ptr, src_ptr, bytes)
            .map_err(logged(OP))
    }

    /// Queue a device-to-device copy on a tenant stream. It is complete
    /// once [`Kernel::synchronize_stream`] returns.
    pub fn copy_memory_async(
        &self,
        dst: MemoryHandle,
        src: MemoryHandle,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<(), KernelError> {
        const OP: &str = "copy_memory_async";
        let state = self.shared.state.lock();
        let (dst_ptr, src_ptr) = match (state.allocations.get(dst), state.allocations.get(src)) {
            (Some(d), Some(s)) => (d.ptr, s.ptr),
            (None, _) => return reject(OP, KernelError::UnknownMemory(dst)),
            (_, None) => return reject(OP, KernelError::UnknownMemory(src)),
        };
        let Some(device_stream) = state.streams.resolve(stream) else {
            return reject(OP, KernelError::UnknownStream(stream));
        };
        self.shared
            .device
            .memcpy_dtod_async(dst_ptr, src_ptr, bytes, device_stream)
            .map_err(logged(OP))
    }

    // ---- tasks ----------------------------------------------------------

    /// Validate and queue a task. Returns the generated id that replaces
    /// the one the caller supplied.
    pub fn schedule_task(&self, mut task: ComputeTask) -> Result<TaskId, KernelError> {
        const OP: &str = "schedule_task";
        if let Err(reason) = scheduler::validate(&task, &self.shared.handlers) {
            return reject(OP, KernelError::InvalidTask(reason));
        }

        let mut state = self.lock_initialized(OP)?;
        let id = loop {
            let id = scheduler::generate_task_id();
            if !state.tasks.contains_key(&id) {
                break id;
            }
        };

        let now = SystemTime::now();
        task.id = id.clone();
        task.created_at = Some(now);
        task.scheduled_at = Some(now);
        task.completed_at = None;
        task.completed = false;
        task.state = TaskState::Queued;
        task.result.clear();
        task.assigned_node = None;

        tracing::info!(
            task_id = %id,
            tenant = %task.tenant_id,
            priority = ?task.priority,
            memory = task.required_memory,
            cores = task.required_cores,
            "scheduled task"
        );
        state.queue.push(id.clone(), task.priority);
        state.tasks.insert(id.clone(), task);
        Ok(id)
    }

    /// Remove a queued or running task. A running job is not interrupted;
    /// its node is released when it returns and its result is dropped.
    pub fn cancel_task(&self, id: &TaskId) -> Result<(), KernelError> {
        const OP: &str = "cancel_task";
        let mut state = self.shared.state.lock();
        let task_state = match state.tasks.get(id) {
            None => return reject(OP, KernelError::TaskNotFound(id.clone())),
            Some(task) => task.state,
        };
        if task_state.is_terminal() {
            return reject(
                OP,
                KernelError::TaskNotCancellable {
                    id: id.clone(),
                    state: task_state,
                },
            );
        }

        state.tasks.remove(id);
        state.queue.remove(id);
        tracing::info!(task_id = %id, was = ?task_state, "cancelled task");
        Ok(())
    }

    /// Snapshot of a tracked task. Cancelled tasks are gone.
    pub fn get_task_status(&self, id: &TaskId) -> Option<ComputeTask> {
        self.shared.state.lock().tasks.get(id).cloned()
    }

    /// Snapshot of every tracked task, finished ones included.
    pub fn get_active_tasks(&self) -> Vec<ComputeTask> {
        self.shared.state.lock().tasks.values().cloned().collect()
    }

    /// Attach a non-negative weight to a tracked task.
    pub fn set_task_weightage(&self, id: &TaskId, weight: f32) -> Result<(), KernelError> {
        const OP: &str = "set_task_weightage";
        if !weight.is_finite() || weight < 0.0 {
            return reject(
                OP,
                KernelError::InvalidArgument(format!("weightage {weight} must be finite and >= 0")),
            );
        }
        let mut state = self.shared.state.lock();
        let Some(task) = state.tasks.get_mut(id) else {
            return reject(OP, KernelError::TaskNotFound(id.clone()));
        };
        task.weightage = Some(weight);
        tracing::info!(task_id = %id, weight, "set task weightage");
        Ok(())
    }

    /// Run a scheduler pass now instead of waiting for the next tick.
    /// Returns how many tasks were handed to workers.
    pub fn run_scheduler_pass(&self) -> usize {
        self.shared.run_pass()
    }

    // ---- streams --------------------------------------------------------

    /// Create a device stream owned by `tenant`.
    pub fn create_stream(&self, tenant: &str) -> Result<StreamHandle, KernelError> {
        const OP: &str = "create_stream";
        if tenant.is_empty() {
            return reject(
                OP,
                KernelError::InvalidArgument("stream needs a tenant".to_string()),
            );
        }
        let mut state = self.lock_initialized(OP)?;
        let device_stream = self.shared.device.create_stream().map_err(logged(OP))?;
        let handle = state.streams.register(tenant, device_stream);
        tracing::info!(stream = %handle, tenant, "created stream");
        Ok(handle)
    }

    /// Destroy a stream and drop it from its tenant's list.
    pub fn destroy_stream(&self, handle: StreamHandle) -> Result<(), KernelError> {
        const OP: &str = "destroy_stream";
        let mut state = self.shared.state.lock();
        let Some(device_stream) = state.streams.resolve(handle) else {
            return reject(OP, KernelError::UnknownStream(handle));
        };
        self.shared
            .device
            .destroy_stream(device_stream)
            .map_err(logged(OP))?;
        if let Some((tenant, _)) = state.streams.unregister(handle) {
            tracing::info!(stream = %handle, tenant = %tenant, "destroyed stream");
        }
        Ok(())
    }

    /// Block until everything queued on the stream has finished. The kernel
    /// lock is not held while waiting.
    pub fn synchronize_stream(&self, handle: StreamHandle) -> Result<(), KernelError> {
        const OP: &str = "synchronize_stream";
        let device_stream = self.shared.state.lock().streams.resolve(handle);
        let Some(device_stream) = device_stream else {
            return reject(OP, KernelError::UnknownStream(handle));
        };
        self.shared
            .device
            .synchronize_stream(device_stream)
            .map_err(logged(OP))
    }

    /// Streams `tenant` owns, in creation order.
    pub fn get_streams_for_tenant(&self, tenant: &str) -> Vec<StreamHandle> {
        self.shared.state.lock().streams.streams_for(tenant)
    }

    /// Tenants currently owning at least one stream.
    pub fn active_tenants(&self) -> Vec<String> {
        self.shared.state.lock().streams.tenants()
    }

    // ---- metrics --------------------------------------------------------

    /// Device properties, memory figures, and task/resource counts. Empty
    /// while uninitialized.
    pub fn get_performance_metrics(&self) -> BTreeMap<String, f64> {
        let state = self.shared.state.lock();
        let Some(device) = state.current_device.as_ref().filter(|_| state.initialized) else {
            return BTreeMap::new();
        };

        let mem_info = match self.shared.device.mem_info() {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::error!(error = %e, "failed to query device memory");
                None
            }
        };
        let profile = self
            .is_profiling()
            .then_some(&state.profile);
        metrics::performance_metrics(device, mem_info, &state.usage(), profile)
    }

    /// Allocated and total counts per resource. Empty while uninitialized.
    pub fn get_resource_usage(&self) -> BTreeMap<String, usize> {
        let state = self.shared.state.lock();
        if !state.initialized {
            return BTreeMap::new();
        }
        metrics::resource_usage(&state.usage())
    }

    /// Start collecting task timings for the performance metrics.
    pub fn enable_profiling(&self) {
        self.shared.profiling.store(true, Ordering::Relaxed);
        tracing::info!("profiling enabled");
    }

    /// Stop collecting task timings. Collected ones are kept until the
    /// next `initialize`.
    pub fn disable_profiling(&self) {
        self.shared.profiling.store(false, Ordering::Relaxed);
        tracing::info!("profiling disabled");
    }

    /// Whether task timings are being collected.
    pub fn is_profiling(&self) -> bool {
        self.shared.profiling.load(Ordering::Relaxed)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.shared.config)
            .field("initialized", &self.is_initialized())
            .field("handlers", &self.shared.handlers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimDevice, SimDeviceSpec};
    use crate::metrics::keys;
    use crate::scheduler::{Job, QueuePolicy, TaskPriority};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    const GIB: usize = 1 << 30;

    fn fast() -> KernelConfig {
        KernelConfig {
            poll_interval_ms: 10,
            ..Default::default()
        }
    }

    /// Scheduler never ticks on its own; tests drive passes by hand.
    fn manual() -> KernelConfig {
        KernelConfig {
            poll_interval_ms: 3_600_000,
            ..Default::default()
        }
    }

    fn kernel_on(config: KernelConfig, device: Arc<SimDevice>) -> Kernel {
        let kernel = Kernel::new(config, device).expect("kernel builds");
        let handlers = kernel.handlers();
        handlers.register_fn("noop", |_| Ok(String::new()));
        handlers.register_fn("echo", |ctx| Ok(ctx.param("msg")?.to_string()));
        handlers.register_fn("fail", |_| Err(JobError::Failed("boom".to_string())));
        handlers.register_fn("explode", |_| panic!("job exploded"));
        kernel
    }

    fn started(config: KernelConfig) -> (Kernel, Arc<SimDevice>) {
        let device = Arc::new(SimDevice::single(4, GIB));
        let kernel = kernel_on(config, device.clone());
        kernel.initialize().expect("initialize");
        (kernel, device)
    }

    fn task(kind: &str) -> ComputeTask {
        ComputeTask::new("req", "llm-a", Job::new(kind))
            .with_memory(1024)
            .with_cores(1)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn state_of(kernel: &Kernel, id: &TaskId) -> Option<TaskState> {
        kernel.get_task_status(id).map(|t| t.state)
    }

    #[test]
    fn initialize_twice_keeps_one_layout() {
        let (kernel, _) = started(manual());
        assert!(kernel.initialize().is_ok());
        assert!(kernel.is_initialized());
        assert_eq!(kernel.get_available_compute_nodes().len(), 4);
        assert_eq!(kernel.get_memory_partitions().len(), 10);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let device = Arc::new(SimDevice::single(4, GIB));
        let kernel = kernel_on(manual(), device);
        kernel.shutdown();
        assert!(!kernel.is_initialized());

        kernel.initialize().expect("initialize");
        kernel.shutdown();
        kernel.shutdown();
        assert!(!kernel.is_initialized());
        assert!(kernel.get_available_compute_nodes().is_empty());
    }

    #[test]
    fn initialize_without_devices_fails() {
        let kernel = kernel_on(manual(), Arc::new(SimDevice::new(Vec::new())));
        assert!(matches!(
            kernel.initialize(),
            Err(KernelError::Device(DeviceError::NoDevices))
        ));
        assert!(!kernel.is_initialized());
        assert!(kernel.get_available_devices().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = KernelConfig {
            worker_threads: 0,
            ..Default::default()
        };
        assert!(matches!(
            Kernel::new(config, Arc::new(SimDevice::default())),
            Err(KernelError::Config(_))
        ));
    }

    #[test]
    fn node_allocation_is_exclusive() {
        let (kernel, _) = started(manual());
        kernel.allocate_compute_node(NodeId(0), "llm-a").unwrap();
        assert!(matches!(
            kernel.allocate_compute_node(NodeId(0), "llm-b"),
            Err(KernelError::Pool(PoolError::NodeAlreadyAllocated(_)))
        ));

        let node = kernel.get_compute_node(NodeId(0)).unwrap();
        assert!(node.allocated);
        assert_eq!(node.owner.as_deref(), Some("llm-a"));
    }

    #[test]
    fn node_operations_need_initialization() {
        let kernel = kernel_on(manual(), Arc::new(SimDevice::default()));
        assert!(matches!(
            kernel.allocate_compute_node(NodeId(0), "llm-a"),
            Err(KernelError::NotInitialized)
        ));
        assert!(kernel.get_available_compute_nodes().is_empty());
        assert!(kernel.get_memory_partitions().is_empty());
    }

    #[test]
    fn counts_are_conserved() {
        let (kernel, _) = started(manual());
        let check = |k: &Kernel| {
            let usage = k.get_resource_usage();
            let nodes = k.get_available_compute_nodes();
            let free = nodes.iter().filter(|n| !n.allocated).count();
            assert_eq!(usage[keys::ALLOCATED_COMPUTE_NODES] + free, usage[keys::TOTAL_COMPUTE_NODES]);

            let partitions = k.get_memory_partitions();
            let free = partitions.iter().filter(|p| !p.allocated).count();
            assert_eq!(
                usage[keys::ALLOCATED_MEMORY_PARTITIONS] + free,
                usage[keys::TOTAL_MEMORY_PARTITIONS]
            );
        };

        check(&kernel);
        kernel.allocate_compute_node(NodeId(1), "a").unwrap();
        kernel.allocate_compute_node(NodeId(3), "b").unwrap();
        check(&kernel);
        assert!(kernel.deallocate_compute_node(NodeId(2)).is_err());
        kernel.deallocate_compute_node(NodeId(1)).unwrap();
        check(&kernel);

        let p = kernel
            .create_memory_partition(4096, MemoryKind::Global, "a")
            .unwrap();
        kernel
            .acquire_memory_partition(1024, MemoryKind::Global, "b")
            .unwrap();
        check(&kernel);
        kernel.destroy_memory_partition(p).unwrap();
        check(&kernel);
    }

    #[test]
    fn concurrent_submissions_get_distinct_ids() {
        let (kernel, _) = started(manual());

        let ids: Vec<TaskId> = thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        (0..125)
                            .map(|_| kernel.schedule_task(task("noop")).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });

        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| !id.is_empty()));
        let unique: HashSet<&TaskId> = ids.iter().collect();
        assert_eq!(unique.len(), 1000);
        assert_eq!(kernel.get_active_tasks().len(), 1000);
    }

    #[test]
    fn invalid_tasks_never_enter_the_table() {
        let (kernel, _) = started(manual());
        let bad = [
            ComputeTask {
                id: TaskId::default(),
                ..task("noop")
            },
            ComputeTask {
                tenant_id: String::new(),
                ..task("noop")
            },
            task("noop").with_memory(0),
            task("noop").with_cores(0),
            ComputeTask {
                job: None,
                ..task("noop")
            },
            task("not-registered"),
        ];
        for t in bad {
            assert!(matches!(
                kernel.schedule_task(t),
                Err(KernelError::InvalidTask(_))
            ));
        }
        assert!(kernel.get_active_tasks().is_empty());
    }

    #[test]
    fn unknown_ids_are_absent() {
        let (kernel, _) = started(manual());
        assert!(kernel.get_task_status(&"nonexistent".into()).is_none());
        assert!(kernel.get_compute_node(NodeId(u32::MAX)).is_none());
        assert!(kernel.get_memory_partition(PartitionId(999)).is_none());
        assert!(matches!(
            kernel.cancel_task(&"nonexistent".into()),
            Err(KernelError::TaskNotFound(_))
        ));
    }

    #[test]
    fn task_runs_end_to_end() {
        let (kernel, _) = started(fast());
        assert_eq!(kernel.get_available_compute_nodes().len(), 4);
        let partitions = kernel.get_memory_partitions();
        assert_eq!(partitions.len(), 10);
        assert!(partitions.iter().all(|p| p.size == GIB / 10));

        let before = kernel.get_resource_usage()[keys::ALLOCATED_COMPUTE_NODES];
        let job = Job::new("echo").with_param("msg", "hello");
        let id = kernel
            .schedule_task(ComputeTask::new("req-1", "llm-a", job).with_memory(1024).with_cores(1))
            .unwrap();
        assert!(id.as_str().starts_with("task_"));

        assert!(wait_for(|| state_of(&kernel, &id) == Some(TaskState::Completed)));
        let done = kernel.get_task_status(&id).unwrap();
        assert!(done.completed);
        assert_eq!(done.result, "hello");
        assert!(done.completed_at.is_some());
        assert!(done.assigned_node.is_none());

        assert_eq!(kernel.get_resource_usage()[keys::ALLOCATED_COMPUTE_NODES], before);
        assert!(kernel.get_active_tasks().iter().any(|t| t.id == id));
    }

    #[test]
    fn job_errors_and_panics_are_recorded() {
        let (kernel, _) = started(fast());
        let failed = kernel.schedule_task(task("fail")).unwrap();
        let exploded = kernel.schedule_task(task("explode")).unwrap();

        assert!(wait_for(|| state_of(&kernel, &failed) == Some(TaskState::Failed)));
        assert!(wait_for(|| state_of(&kernel, &exploded) == Some(TaskState::Failed)));
        assert_eq!(kernel.get_task_status(&failed).unwrap().result, "boom");

        let exploded = kernel.get_task_status(&exploded).unwrap();
        assert!(exploded.completed);
        assert!(exploded.result.contains("job exploded"));
        assert!(wait_for(|| kernel.get_resource_usage()[keys::ALLOCATED_COMPUTE_NODES] == 0));
    }

    #[test]
    fn cancelled_before_pass_never_runs() {
        let (kernel, _) = started(manual());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        kernel.handlers().register_fn("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(String::new())
        });

        let id = kernel.schedule_task(task("count")).unwrap();
        kernel.cancel_task(&id).unwrap();
        assert_eq!(kernel.run_scheduler_pass(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(kernel.get_active_tasks().is_empty());

        let id = kernel.schedule_task(task("count")).unwrap();
        assert_eq!(kernel.run_scheduler_pass(), 1);
        assert!(wait_for(|| state_of(&kernel, &id) == Some(TaskState::Completed)));
        assert!(matches!(
            kernel.cancel_task(&id),
            Err(KernelError::TaskNotCancellable { .. })
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelling_a_running_task_frees_its_node_after_the_job() {
        let (kernel, _) = started(manual());
        let gate = Arc::new(AtomicBool::new(false));
        let open = gate.clone();
        kernel.handlers().register_fn("wait", move |_| {
            while !open.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            Ok("finished".to_string())
        });

        let id = kernel.schedule_task(task("wait")).unwrap();
        assert_eq!(kernel.run_scheduler_pass(), 1);
        assert_eq!(state_of(&kernel, &id), Some(TaskState::Running));

        kernel.cancel_task(&id).unwrap();
        assert!(kernel.get_task_status(&id).is_none());
        assert_eq!(kernel.get_resource_usage()[keys::ALLOCATED_COMPUTE_NODES], 1);

        gate.store(true, Ordering::SeqCst);
        assert!(wait_for(|| kernel.get_resource_usage()[keys::ALLOCATED_COMPUTE_NODES] == 0));
        assert!(kernel.get_active_tasks().is_empty());
    }

    #[test]
    fn unsatisfiable_task_is_dropped() {
        let (kernel, _) = started(manual());
        let id = kernel
            .schedule_task(task("noop").with_memory(2 * GIB))
            .unwrap();
        assert_eq!(kernel.run_scheduler_pass(), 0);

        let dropped = kernel.get_task_status(&id).unwrap();
        assert_eq!(dropped.state, TaskState::Dropped);
        assert!(!dropped.completed);
        assert!(!dropped.result.is_empty());
    }

    #[test]
    fn busy_pool_defers_instead_of_dropping() {
        let (kernel, _) = started(manual());
        for i in 0..4 {
            kernel.allocate_compute_node(NodeId(i), "hog").unwrap();
        }

        let id = kernel.schedule_task(task("noop")).unwrap();
        assert_eq!(kernel.run_scheduler_pass(), 0);
        assert_eq!(state_of(&kernel, &id), Some(TaskState::Queued));

        kernel.deallocate_compute_node(NodeId(2)).unwrap();
        assert_eq!(kernel.run_scheduler_pass(), 1);
        assert!(wait_for(|| state_of(&kernel, &id) == Some(TaskState::Completed)));
    }

    #[test]
    fn priority_policy_runs_urgent_work_first() {
        let device = Arc::new(SimDevice::single(1, GIB));
        let kernel = kernel_on(
            KernelConfig {
                queue_policy: QueuePolicy::Priority,
                ..manual()
            },
            device,
        );
        kernel.initialize().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        kernel.handlers().register_fn("record", move |ctx| {
            seen.lock().push(ctx.param("name")?.to_string());
            Ok(String::new())
        });
        let named = |name: &str, priority| {
            ComputeTask::new("req", "llm-a", Job::new("record").with_param("name", name))
                .with_memory(1024)
                .with_cores(1)
                .with_priority(priority)
        };

        let low = kernel.schedule_task(named("low", TaskPriority::Low)).unwrap();
        let urgent = kernel.schedule_task(named("urgent", TaskPriority::Critical)).unwrap();

        assert_eq!(kernel.run_scheduler_pass(), 1);
        assert!(wait_for(|| state_of(&kernel, &urgent) == Some(TaskState::Completed)));
        assert_eq!(state_of(&kernel, &low), Some(TaskState::Queued));

        assert_eq!(kernel.run_scheduler_pass(), 1);
        assert!(wait_for(|| state_of(&kernel, &low) == Some(TaskState::Completed)));
        assert_eq!(*order.lock(), vec!["urgent".to_string(), "low".to_string()]);
    }

    #[test]
    fn weightage_is_recorded() {
        let (kernel, _) = started(manual());
        let id = kernel.schedule_task(task("noop")).unwrap();
        kernel.set_task_weightage(&id, 0.75).unwrap();
        assert_eq!(kernel.get_task_status(&id).unwrap().weightage, Some(0.75));
        assert!(kernel.set_task_weightage(&id, f32::NAN).is_err());
        assert!(kernel.set_task_weightage(&"nope".into(), 1.0).is_err());
    }

    #[test]
    fn partitions_are_created_and_destroyed() {
        let (kernel, device) = started(manual());
        let a = kernel
            .create_memory_partition(4096, MemoryKind::Global, "llm-a")
            .unwrap();
        let b = kernel
            .create_memory_partition(8192, MemoryKind::Shared, "llm-b")
            .unwrap();
        assert_eq!((a, b), (PartitionId(10), PartitionId(11)));
        assert_eq!(device.allocated_bytes(0), 4096 + 8192);

        kernel.destroy_memory_partition(a).unwrap();
        assert_eq!(device.allocated_bytes(0), 8192);
        assert!(kernel.get_memory_partition(a).is_none());
        assert!(kernel.destroy_memory_partition(a).is_err());

        // Layout partitions only go away once claimed.
        assert!(matches!(
            kernel.destroy_memory_partition(PartitionId(0)),
            Err(KernelError::Pool(PoolError::PartitionNotAllocated(_)))
        ));
        let c = kernel
            .create_memory_partition(16, MemoryKind::Global, "llm-a")
            .unwrap();
        assert_eq!(c, PartitionId(12));
    }

    #[test]
    fn layout_partitions_are_acquired_and_released() {
        let (kernel, _) = started(manual());
        let id = kernel
            .acquire_memory_partition(1024, MemoryKind::Global, "llm-a")
            .unwrap();
        assert_eq!(id, PartitionId(0));
        assert_eq!(
            kernel.get_memory_partition(id).unwrap().owner.as_deref(),
            Some("llm-a")
        );
        assert!(kernel
            .acquire_memory_partition(GIB, MemoryKind::Global, "llm-a")
            .is_err());

        kernel.release_memory_partition(id).unwrap();
        assert!(kernel.release_memory_partition(id).is_err());
    }

    #[test]
    fn memory_moves_through_handles() {
        let (kernel, _) = started(manual());
        let src = kernel.allocate_memory(64, "llm-a").unwrap();
        let dst = kernel.allocate_memory(64, "llm-a").unwrap();
        assert_ne!(src, dst);

        kernel.write_memory(src, b"tenant bytes").unwrap();
        kernel.copy_memory(dst, src, 12).unwrap();
        assert_eq!(kernel.read_memory(dst, 12).unwrap(), b"tenant bytes");

        assert!(matches!(
            kernel.write_memory(src, &[0u8; 65]),
            Err(KernelError::Device(DeviceError::OutOfBounds { .. }))
        ));
        assert_eq!(kernel.tenant_allocations("llm-a").len(), 2);

        kernel.deallocate_memory(src).unwrap();
        assert!(matches!(
            kernel.deallocate_memory(src),
            Err(KernelError::UnknownMemory(_))
        ));
        assert!(kernel.read_memory(src, 1).is_err());
    }

    #[test]
    fn oversized_read_is_rejected_before_allocating() {
        let (kernel, _) = started(manual());
        let h = kernel.allocate_memory(64, "llm-a").unwrap();

        assert!(matches!(
            kernel.read_memory(h, usize::MAX),
            Err(KernelError::Device(DeviceError::OutOfBounds { requested: usize::MAX, capacity: 64 }))
        ));
        assert!(matches!(
            kernel.read_memory(h, 65),
            Err(KernelError::Device(DeviceError::OutOfBounds { .. }))
        ));
        assert_eq!(kernel.read_memory(h, 64).unwrap().len(), 64);
    }

    #[test]
    fn out_of_memory_is_an_error_not_a_crash() {
        let (kernel, _) = started(manual());
        assert!(matches!(
            kernel.allocate_memory(2 * GIB, "llm-a"),
            Err(KernelError::Device(DeviceError::OutOfMemory { .. }))
        ));
        assert!(kernel.tenant_allocations("llm-a").is_empty());
    }

    #[test]
    fn async_copy_completes_on_synchronize() {
        let (kernel, _) = started(manual());
        let stream = kernel.create_stream("llm-a").unwrap();
        let src = kernel.allocate_memory(8, "llm-a").unwrap();
        let dst = kernel.allocate_memory(8, "llm-a").unwrap();

        kernel.write_memory(src, &[7u8; 8]).unwrap();
        kernel.copy_memory_async(dst, src, 8, stream).unwrap();
        kernel.synchronize_stream(stream).unwrap();
        assert_eq!(kernel.read_memory(dst, 8).unwrap(), vec![7u8; 8]);
    }

    #[test]
    fn streams_belong_to_their_tenant() {
        let (kernel, device) = started(manual());
        let a1 = kernel.create_stream("llm-a").unwrap();
        let b1 = kernel.create_stream("llm-b").unwrap();
        let a2 = kernel.create_stream("llm-a").unwrap();

        assert_eq!(kernel.get_streams_for_tenant("llm-a"), vec![a1, a2]);
        assert_eq!(kernel.get_streams_for_tenant("llm-b"), vec![b1]);
        assert_eq!(kernel.active_tenants(), vec!["llm-a", "llm-b"]);
        assert_eq!(device.stream_count(), 3);

        kernel.destroy_stream(b1).unwrap();
        assert!(kernel.get_streams_for_tenant("llm-b").is_empty());
        assert!(matches!(
            kernel.synchronize_stream(b1),
            Err(KernelError::UnknownStream(_))
        ));
        assert_eq!(device.stream_count(), 2);
    }

    #[test]
    fn stream_creation_failure_is_reported() {
        let device = Arc::new(SimDevice::single(4, GIB).with_max_streams(1));
        let kernel = kernel_on(manual(), device);
        kernel.initialize().unwrap();

        kernel.create_stream("llm-a").unwrap();
        assert!(matches!(
            kernel.create_stream("llm-b"),
            Err(KernelError::Device(DeviceError::Driver(_)))
        ));
        assert!(kernel.get_streams_for_tenant("llm-b").is_empty());
    }

    #[test]
    fn shutdown_releases_every_tenant_resource() {
        let (kernel, device) = started(manual());
        let tenants = ["llm-a", "llm-b", "llm-c"];
        for tenant in tenants {
            kernel.create_stream(tenant).unwrap();
            kernel.create_stream(tenant).unwrap();
            kernel.allocate_memory(1 << 20, tenant).unwrap();
        }
        kernel
            .create_memory_partition(1 << 20, MemoryKind::Global, "llm-a")
            .unwrap();
        kernel.schedule_task(task("noop")).unwrap();
        assert!(device.allocated_bytes(0) > 0);

        kernel.shutdown();
        for tenant in tenants {
            assert!(kernel.get_streams_for_tenant(tenant).is_empty());
            assert!(kernel.tenant_allocations(tenant).is_empty());
        }
        assert!(kernel.get_active_tasks().is_empty());
        assert_eq!(device.allocated_bytes(0), 0);
        assert_eq!(device.stream_count(), 0);
    }

    #[test]
    fn handles_are_not_reused_after_restart() {
        let (kernel, _) = started(manual());
        let first = kernel.allocate_memory(16, "llm-a").unwrap();
        kernel.shutdown();
        kernel.initialize().unwrap();
        let second = kernel.allocate_memory(16, "llm-a").unwrap();
        assert!(second > first);
    }

    #[test]
    fn job_outliving_shutdown_grace_commits_nothing_after_restart() {
        let (kernel, _) = started(KernelConfig {
            shutdown_grace_ms: 20,
            ..manual()
        });
        let gate = Arc::new(AtomicBool::new(false));
        let open = gate.clone();
        kernel.handlers().register_fn("wait", move |_| {
            while !open.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            Ok("late".to_string())
        });

        let old = kernel.schedule_task(task("wait")).unwrap();
        assert_eq!(kernel.run_scheduler_pass(), 1);
        assert_eq!(
            kernel.get_task_status(&old).unwrap().assigned_node,
            Some(NodeId(0))
        );

        kernel.shutdown();
        assert!(!kernel.is_initialized());
        assert_eq!(*kernel.shared.in_flight.lock(), 1);

        kernel.initialize().unwrap();
        kernel.allocate_compute_node(NodeId(0), "llm-b").unwrap();

        gate.store(true, Ordering::SeqCst);
        assert!(wait_for(|| *kernel.shared.in_flight.lock() == 0));

        let node = kernel.get_compute_node(NodeId(0)).unwrap();
        assert!(node.allocated);
        assert_eq!(node.owner.as_deref(), Some("llm-b"));
        assert!(kernel.get_task_status(&old).is_none());
        assert!(kernel.get_active_tasks().is_empty());
    }

    #[test]
    fn released_virtual_node_is_destroyed_by_its_creator() {
        let (kernel, _) = started(manual());
        let v = kernel.create_virtual_compute_node("llm-a", 1 << 20, 4).unwrap();
        kernel.deallocate_compute_node(v).unwrap();
        assert!(kernel.get_compute_node(v).unwrap().owner.is_none());

        assert_eq!(kernel.destroy_virtual_compute_nodes("llm-a"), 1);
        assert!(kernel.get_compute_node(v).is_none());
    }

    #[test]
    fn select_device_only_between_cycles() {
        let specs = vec![
            SimDeviceSpec::default(),
            SimDeviceSpec {
                name: "Second GPU".to_string(),
                multiprocessor_count: 2,
                ..Default::default()
            },
        ];
        let device = Arc::new(SimDevice::new(specs));
        let kernel = kernel_on(manual(), device);

        assert_eq!(kernel.get_available_devices().len(), 2);
        assert!(matches!(
            kernel.select_device(7),
            Err(KernelError::Device(DeviceError::InvalidDevice(7)))
        ));
        kernel.select_device(1).unwrap();
        assert_eq!(kernel.current_device().unwrap().name, "Second GPU");

        kernel.initialize().unwrap();
        assert_eq!(kernel.get_available_compute_nodes().len(), 2);
        assert!(matches!(
            kernel.select_device(0),
            Err(KernelError::AlreadyInitialized)
        ));
    }

    #[test]
    fn virtual_nodes_are_per_tenant() {
        let (kernel, _) = started(manual());
        let v = kernel.create_virtual_compute_node("llm-a", 1 << 20, 4).unwrap();
        kernel.create_virtual_compute_node("llm-b", 1 << 20, 4).unwrap();

        let node = kernel.get_compute_node(v).unwrap();
        assert!(node.is_virtual && node.allocated);
        assert_eq!(kernel.get_available_compute_nodes().len(), 6);

        assert_eq!(kernel.destroy_virtual_compute_nodes("llm-a"), 1);
        assert_eq!(kernel.destroy_virtual_compute_nodes("llm-a"), 0);
        assert_eq!(kernel.get_available_compute_nodes().len(), 5);
    }

    #[test]
    fn metrics_are_empty_until_initialized() {
        let device = Arc::new(SimDevice::single(4, GIB));
        let kernel = kernel_on(manual(), device);
        assert!(kernel.get_performance_metrics().is_empty());
        assert!(kernel.get_resource_usage().is_empty());

        kernel.initialize().unwrap();
        let perf = kernel.get_performance_metrics();
        assert_eq!(perf[keys::MULTI_PROCESSOR_COUNT], 4.0);
        assert_eq!(perf[keys::TOTAL_MEMORY_GB], 1.0);
        assert_eq!(perf[keys::MEMORY_UTILIZATION], 0.0);
        assert!(!perf.contains_key(keys::TASKS_COMPLETED));

        let usage = kernel.get_resource_usage();
        assert_eq!(usage[keys::TOTAL_COMPUTE_NODES], 4);
        assert_eq!(usage[keys::TOTAL_MEMORY_PARTITIONS], 10);
        assert_eq!(usage[keys::ACTIVE_TASKS], 0);
    }

    #[test]
    fn profiling_adds_task_timings() {
        let (kernel, _) = started(fast());
        kernel.enable_profiling();
        assert!(kernel.is_profiling());

        let ok = kernel.schedule_task(task("noop")).unwrap();
        let bad = kernel.schedule_task(task("fail")).unwrap();
        assert!(wait_for(|| state_of(&kernel, &ok) == Some(TaskState::Completed)));
        assert!(wait_for(|| state_of(&kernel, &bad) == Some(TaskState::Failed)));

        let perf = kernel.get_performance_metrics();
        assert_eq!(perf[keys::TASKS_COMPLETED], 1.0);
        assert_eq!(perf[keys::TASKS_FAILED], 1.0);
        assert!(perf.contains_key(keys::AVG_TASK_MS));

        kernel.disable_profiling();
        assert!(!kernel.get_performance_metrics().contains_key(keys::TASKS_COMPLETED));
    }

    #[test]
    fn dropping_the_kernel_shuts_it_down() {
        let device = Arc::new(SimDevice::single(4, GIB));
        {
            let kernel = kernel_on(manual(), device.clone());
            kernel.initialize().unwrap();
            kernel.create_stream("llm-a").unwrap();
            kernel.allocate_memory(1024, "llm-a").unwrap();
        }
        assert_eq!(device.stream_count(), 0);
        assert_eq!(device.allocated_bytes(0), 0);
    }
}
