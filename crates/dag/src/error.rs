//! Error types for the job runtime

use crate::fin::FinError;
use meridian_common::{JobId, TaskId};
use thiserror::Error;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, DagError>;

/// Errors raised by job, task and graph management
#[derive(Error, Debug, Clone)]
pub enum DagError {
    #[error("Task {0} is already running")]
    AlreadyRunning(TaskId),

    #[error("Task {0} was never initialized")]
    NotInitialized(TaskId),

    #[error("Task {0} is cancelled")]
    Cancelled(TaskId),

    #[error("Task {task} failed to initialize: {source}")]
    InitFailed { task: TaskId, source: FinError },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {0} has no root vertex")]
    NoRoot(JobId),

    #[error("Results of job {0} were already consumed")]
    IteratorTaken(JobId),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),
}
