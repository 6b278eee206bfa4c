use std::sync::Arc;

use thiserror::Error;

use crate::core::Key;

/// A single task's creation failure.
///
/// The underlying error is reference-counted so the same failure can be
/// recorded in the task outcome, listed in the batch result, and propagated
/// through the strict creation path without copying.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct TaskError(#[from] pub(crate) Arc<anyhow::Error>);

impl TaskError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError(Arc::new(e))
    }
}

/// Configuration errors in the task graph or misuse of the pull protocol.
///
/// Every variant is detectable before or independently of task execution.
/// A cyclic graph in particular is rejected when the graph is built or
/// linked, never discovered as a hang at run time.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Dependency cycle detected at task '{0}'")]
    Cycle(Box<str>),

    #[error("Task '{0}' cannot be ordered after itself")]
    SelfLink(Box<str>),

    #[error("No task with key {0} in this group")]
    UnknownKey(Key),

    #[error("Task '{0}' has no recorded outcome to report")]
    NotCompleted(Box<str>),
}

/// Errors surfaced by the strict creation path.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Task '{name}' ({key}):\n{source}")]
    Task {
        name: Box<str>,
        key: Key,
        source: TaskError,
    },
}
