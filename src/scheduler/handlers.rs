//! Job handler table.
//!
//! Tasks name their work by `Job::kind`; the kernel looks the kind up here
//! when a worker picks the task up. Handlers are registered once, up front,
//! and shared by every tenant.

use super::task::{Job, TaskId};
use crate::pool::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors a job can finish with.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("no handler registered for job kind '{0}'")]
    UnknownKind(String),

    #[error("missing job parameter '{0}'")]
    MissingParam(String),

    #[error("invalid job parameter '{name}': {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}

/// Everything a handler gets to see about the task it runs.
#[derive(Debug)]
pub struct JobContext<'a> {
    pub task_id: &'a TaskId,
    pub tenant_id: &'a str,
    pub node: NodeId,
    pub job: &'a Job,
}

impl JobContext<'_> {
    pub fn param(&self, name: &str) -> Result<&str, JobError> {
        self.job
            .params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| JobError::MissingParam(name.to_string()))
    }

    /// Parse a parameter with `FromStr`.
    pub fn parsed<T>(&self, name: &str) -> Result<T, JobError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.param(name)?
            .parse()
            .map_err(|e: T::Err| JobError::InvalidParam {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Executes one kind of job. The returned string becomes the task result.
pub trait JobHandler: Send + Sync {
    fn run(&self, ctx: &JobContext<'_>) -> Result<String, JobError>;
}

impl<F> JobHandler for F
where
    F: Fn(&JobContext<'_>) -> Result<String, JobError> + Send + Sync,
{
    fn run(&self, ctx: &JobContext<'_>) -> Result<String, JobError> {
        self(ctx)
    }
}

/// Shared kind → handler table. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct JobHandlers {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
}

impl JobHandlers {
    /// Register (or replace) the handler for `kind`.
    pub fn register<H>(&self, kind: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        let kind = kind.into();
        tracing::debug!(kind = %kind, "registered job handler");
        self.handlers.write().insert(kind, Arc::new(handler));
    }

    /// Register a closure as the handler for `kind`.
    pub fn register_fn<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(&JobContext<'_>) -> Result<String, JobError> + Send + Sync + 'static,
    {
        self.register(kind, handler);
    }

    pub fn unregister(&self, kind: &str) -> bool {
        self.handlers.write().remove(kind).is_some()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.read().contains_key(kind)
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for JobHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandlers")
            .field("kinds", &self.kinds())
            .finish()
    }
}
