//! trialgrid-agent: the node side of trialgrid.
//!
//! # Architecture
//!
//! ```text
//!   NodeAgent ──► NodeController (authority)
//!      │  ├─ stats stream, resources, docker/nvidia info
//!      │  └─ PeerProber ──► set_peer_connection
//!      └─► start_task_instance ──► JobConnector ──► JobStorage
//!                                      └─► TaskExecutor
//!
//!   JobRunner (local) ──► Scheduler + ledger ──► TaskExecutor × replicas
//! ```

pub mod agent;
pub mod error;
pub mod instance;
pub mod peers;
pub mod runner;

pub use agent::{AgentConfig, NodeAgent, host_capacity};
pub use error::{AgentError, AgentResult};
pub use instance::{InstanceContext, download_job_files, start_task_instance};
pub use peers::{PeerProber, SERVER_PEER_ID, measure_latency};
pub use runner::{JobRunner, RunnerConfig};
