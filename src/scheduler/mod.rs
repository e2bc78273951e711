//! Task scheduling: validation, id generation, and the run queue.
//!
//! The scheduler pieces here are plain data structures. The kernel drives
//! them from its background loop:
//!
//! 1. `schedule_task` validates a task, gives it a fresh id, and queues it.
//! 2. Each pass drains the queue in order, claiming a compute node per task.
//! 3. Claimed tasks become `Dispatch`es handed to the worker pool, which
//!    runs the job off the kernel lock and reports back.

pub mod handlers;
pub mod task;

pub use handlers::{JobContext, JobError, JobHandler, JobHandlers};
pub use task::{ComputeTask, Job, TaskId, TaskPriority, TaskState};

use crate::pool::NodeId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Order in which queued tasks are offered to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Submission order; priority is recorded but not acted on.
    #[default]
    Fifo,
    /// Most urgent priority first, submission order within a priority.
    Priority,
}

/// Why a submitted task was turned away.
pub fn validate(task: &ComputeTask, handlers: &JobHandlers) -> Result<(), String> {
    if task.id.is_empty() {
        return Err("task id is empty".to_string());
    }
    if task.tenant_id.is_empty() {
        return Err("tenant id is empty".to_string());
    }
    if task.required_memory == 0 {
        return Err("required memory must be greater than zero".to_string());
    }
    if task.required_cores == 0 {
        return Err("required cores must be greater than zero".to_string());
    }
    match &task.job {
        None => Err("task has no job".to_string()),
        Some(job) if job.kind.is_empty() => Err("job kind is empty".to_string()),
        Some(job) if !handlers.contains(&job.kind) => {
            Err(format!("no handler registered for job kind '{}'", job.kind))
        }
        Some(_) => Ok(()),
    }
}

/// Fresh id of the form `task_<unix-ms>_<6 random digits>`.
pub fn generate_task_id() -> TaskId {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let suffix: u32 = rand::rng().random_range(100_000..=999_999);
    TaskId(format!("task_{millis}_{suffix}"))
}

#[derive(Debug, Clone)]
struct QueueEntry {
    id: TaskId,
    priority: TaskPriority,
}

/// Run queue of task ids. The task records themselves live in the kernel's
/// task table; a cancelled task simply vanishes from there and is skipped
/// when its id comes up.
#[derive(Debug, Default)]
pub struct TaskQueue {
    policy: QueuePolicy,
    entries: VecDeque<QueueEntry>,
}

impl TaskQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            entries: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    pub fn push(&mut self, id: TaskId, priority: TaskPriority) {
        let entry = QueueEntry { id, priority };
        match self.policy {
            QueuePolicy::Fifo => self.entries.push_back(entry),
            QueuePolicy::Priority => {
                // After every entry at least as urgent: stable within a priority.
                let at = self
                    .entries
                    .iter()
                    .position(|e| e.priority > priority)
                    .unwrap_or(self.entries.len());
                self.entries.insert(at, entry);
            }
        }
    }

    /// Take everything currently queued, in dispatch order.
    pub fn drain(&mut self) -> Vec<(TaskId, TaskPriority)> {
        self.entries.drain(..).map(|e| (e.id, e.priority)).collect()
    }

    /// Put back tasks that could not be placed this pass, ahead of anything
    /// queued since, keeping their relative order.
    pub fn requeue_front(&mut self, deferred: Vec<(TaskId, TaskPriority)>) {
        for (id, priority) in deferred.into_iter().rev() {
            self.entries.push_front(QueueEntry { id, priority });
        }
        if self.policy == QueuePolicy::Priority {
            self.entries
                .make_contiguous()
                .sort_by_key(|e| e.priority);
        }
    }

    pub fn remove(&mut self, id: &TaskId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.id != id);
        before != self.entries.len()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A task that holds a node and is on its way to a worker.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub task_id: TaskId,
    pub tenant_id: String,
    pub job: Job,
    pub node: NodeId,
    /// Kernel lifecycle generation the node was claimed in.
    pub generation: u64,
}
