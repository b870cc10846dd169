use thiserror::Error;
use trialgrid_executor::ExecutorError;
use trialgrid_scheduler::SchedulerError;
use trialgrid_sync::{RemoteError, SyncError};

#[derive(Debug, Error)]
pub enum AgentError {
    /// The authority refused our credentials. The process should exit.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error(transparent)]
    Remote(RemoteError),

    #[error(transparent)]
    Sync(SyncError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("no start policy loaded yet")]
    NoStartPolicy,

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("job {job} can not start: {reason}")]
    NotStartable { job: String, reason: String },

    #[error("invalid job file {path}: {reason}")]
    JobFile { path: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RemoteError> for AgentError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Authentication(msg) => AgentError::Authentication(msg),
            other => AgentError::Remote(other),
        }
    }
}

impl From<SyncError> for AgentError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Authentication(msg) => AgentError::Authentication(msg),
            other => AgentError::Sync(other),
        }
    }
}

impl AgentError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Authentication(_))
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
