//! Configuration error types.

use thiserror::Error;

/// Result type alias for configuration resolution.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while resolving a job configuration.
///
/// All of these are fixable by editing the configuration files and are
/// never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config at {file} in {root} not found")]
    NotFound { file: String, root: String },

    #[error("failed to read {file}: {message}")]
    Read { file: String, message: String },

    #[error("invalid YAML in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("Task '{task}' depends on missing '{dependency}'")]
    MissingDependency { task: String, dependency: String },

    #[error("Circular dependency in task dependencies: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// True for errors in the task graph rather than in file access.
    pub fn is_dependency_error(&self) -> bool {
        matches!(
            self,
            ConfigError::MissingDependency { .. } | ConfigError::CircularDependency { .. }
        )
    }
}
