//! Resource ledger errors.

use thiserror::Error;

/// Result type alias for ledger operations.
pub type ResourceResult<T> = Result<T, ResourceError>;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Could not reserve {kind} {requested}, since only {free} free.")]
    Insufficient {
        kind: &'static str,
        requested: u32,
        free: u32,
    },

    #[error("Task instance already reserved: {0}")]
    AlreadyReserved(String),
}
