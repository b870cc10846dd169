//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {task} has no replica {replica}")]
    InstanceNotFound { task: String, replica: u32 },

    #[error("resources not free yet: {0}")]
    NotFree(String),

    #[error("resources never fit this node: {0}")]
    NeverFits(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
