//! trialgrid-sync: keeps a job's local state and the authority's copy in
//! step.
//!
//! # Architecture
//!
//! ```text
//!   executor / runner
//!        │ typed patches, logs, channel values, output commits
//!        ▼
//!   JobStorage ──► PatchQueue (collapsed by path) ──► OpsJournal (redb)
//!        │     └─► CallQueue (ordered, at-least-once)
//!        ▼
//!   JobController / Connection (remote or LoopbackAuthority)
//! ```
//!
//! The agent side talks to the authority through [`NodeController`]; the
//! authority calls back through [`NodePeer`] and [`JobPeer`].

pub mod backoff;
pub mod calls;
pub mod controller;
pub mod error;
pub mod files;
pub mod journal;
pub mod loopback;
pub mod mutation;
pub mod patch;
pub mod progress;
pub mod storage;

pub use backoff::ReconnectBackoff;
pub use calls::{BufferedCall, CallQueue};
pub use controller::{Connection, JobConnector, JobController, JobPeer, JobSession, NodeController, NodePeer};
pub use error::{RemoteError, RemoteResult, SyncError, SyncResult};
pub use files::{FileMatcher, copy_files, find_files};
pub use journal::OpsJournal;
pub use loopback::LoopbackAuthority;
pub use mutation::{InstanceChange, InstancePatch, JobPatch, Patch, TaskChange, TaskPatch};
pub use patch::{Enqueued, PatchOperation, PatchQueue, SendBatch, set_path};
pub use progress::ProgressTracker;
pub use storage::{BoxFuture, Cleanup, JobStorage, QueuedCommit, SPEED_METRIC_FILE, StorageConfig};
