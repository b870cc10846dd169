use thiserror::Error;
use trialgrid_sync::SyncError;

use crate::template::TemplateError;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("task '{task}' replica {replica} was already started")]
    AlreadyStarted { task: String, replica: u32 },

    #[error("No command defined for task '{0}'.")]
    NoCommand(String),

    #[error("No docker image defined for task '{0}'.")]
    NoImage(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

impl ExecutorError {
    /// Exit code carried in a runtime message such as
    /// `returned a non-zero code: 137`, else 1.
    pub fn exit_code(&self) -> i32 {
        let message = self.to_string();
        message
            .find("non-zero code: ")
            .and_then(|pos| {
                let digits: String = message[pos + "non-zero code: ".len()..]
                    .chars()
                    .take_while(char::is_ascii_digit)
                    .collect();
                digits.parse::<i32>().ok()
            })
            .filter(|code| *code != 0)
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_from_message() {
        let e = ExecutorError::Runtime("The command '/bin/sh -c make' returned a non-zero code: 2".into());
        assert_eq!(e.exit_code(), 2);
        assert_eq!(ExecutorError::Runtime("boom".into()).exit_code(), 1);
        assert_eq!(ExecutorError::Runtime("non-zero code: 0".into()).exit_code(), 1);
    }
}
