use thiserror::Error;

/// Failure of a call to the authority.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The access token was refused. Never retried.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("authority unreachable: {0}")]
    Offline(String),

    #[error("call rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RemoteError::Authentication(_))
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("job storage already stopped")]
    AlreadyStopped,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error(transparent)]
    Remote(RemoteError),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("instance {replica} of task {task} not found")]
    InstanceNotFound { task: String, replica: u32 },

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("ops journal error: {0}")]
    Journal(String),

    #[error("invalid file pattern: {0}")]
    Pattern(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Authentication(msg) => SyncError::Authentication(msg),
            other => SyncError::Remote(other),
        }
    }
}

impl SyncError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Authentication(_))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
