//! Compute tasks and the jobs they carry.

use crate::pool::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// Task identifier. Callers propose one, the scheduler replaces it with a
/// generated `task_<ms>_<rand6>` id on submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        TaskId(s)
    }
}

/// Urgency of a task; `Critical` sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the queue for a compute node.
    #[default]
    Queued,
    /// Holding a node, job executing on a worker.
    Running,
    /// Job returned successfully.
    Completed,
    /// Job returned an error or panicked.
    Failed,
    /// No node in the pool can ever satisfy the requirements.
    Dropped,
}

impl TaskState {
    /// Finished one way or another; the task will not run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Dropped)
    }
}

/// A unit of work, described rather than captured: a kind that selects a
/// registered handler, and string parameters for it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Job {
    pub kind: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Job {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// A schedulable unit of work for one tenant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputeTask {
    pub id: TaskId,
    pub tenant_id: String,
    pub priority: TaskPriority,
    /// Bytes of node memory the job needs.
    pub required_memory: usize,
    /// Compute capacity the job needs.
    pub required_cores: usize,
    pub job: Option<Job>,
    pub created_at: Option<SystemTime>,
    pub scheduled_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    /// Set once the job has run, whether it succeeded or not.
    pub completed: bool,
    pub state: TaskState,
    /// Job output on success, error text on failure.
    pub result: String,
    /// Node held while `Running`.
    pub assigned_node: Option<NodeId>,
    pub weightage: Option<f32>,
}

impl ComputeTask {
    pub fn new(id: impl Into<TaskId>, tenant_id: impl Into<String>, job: Job) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            job: Some(job),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_memory(mut self, bytes: usize) -> Self {
        self.required_memory = bytes;
        self
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.required_cores = cores;
        self
    }
}
