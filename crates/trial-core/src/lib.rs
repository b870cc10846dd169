//! trial-core: shared data model and configuration resolver for trialgrid.
//!
//! # Architecture
//!
//! ```text
//!   trialgrid.yml ──► resolver ──► JobConfig ──► Job::new
//!        │  import         │                        │
//!        ▼                 ▼                        ▼
//!   imported files    tasks + defaults       JobTask / JobTaskInstance
//! ```
//!
//! The resolver turns layered, importable YAML files into an immutable
//! [`JobConfig`]. A [`Job`] is the mutable runtime record built from it;
//! every later change to a job flows through the sync layer as a patch.

pub mod config;
pub mod error;
pub mod job;
pub mod node;
pub mod paths;
pub mod resolver;
pub mod resources;
pub mod status;

pub use config::{ConfigOverrides, DockerOptions, JobConfig, JobTaskConfig, TaskCommand, TaskSettings};
pub use error::{ConfigError, ConfigResult};
pub use job::*;
pub use node::*;
pub use paths::{JobDirs, home_dir, instance_dir, trialgrid_home};
pub use resolver::{ConfigSource, DirSource, MapSource, resolve, resolve_from};
pub use resources::*;
pub use status::*;

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Seconds since the Unix epoch with sub-second precision.
pub fn epoch_secs_f64() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
