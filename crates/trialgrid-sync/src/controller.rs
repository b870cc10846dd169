//! Remote authority abstraction.
//!
//! The transport behind these traits is out of scope for this crate; the
//! agent and the job storage only see `RemoteResult`s and a connected
//! watch. [`LoopbackAuthority`](crate::LoopbackAuthority) implements the
//! job side in-process.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::watch;
use trial_core::{
    AssignedTaskInstance, ContainerSummary, ImageSummary, Job, JobFile, Peer, RuntimeInfo, StartPolicy,
};
use trialgrid_metrics::{HardwareInformation, HardwareStats, NvidiaVersions};
use trialgrid_resources::NodeResources;

use crate::error::RemoteResult;

/// Connection state of a session with the authority.
#[async_trait]
pub trait Connection: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn connect(&self) -> RemoteResult<()>;
    async fn disconnect(&self);
    /// Watch of the connected flag.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Calls a job session makes against the authority.
#[async_trait]
pub trait JobController: Send + Sync {
    async fn job(&self) -> RemoteResult<Option<Job>>;
    async fn project_name(&self) -> RemoteResult<String>;

    /// Apply a set of dot-path writes to the job document.
    async fn patch_job(&self, patches: Map<String, Value>) -> RemoteResult<()>;

    async fn task_instance_started(&self, task: &str, replica: u32) -> RemoteResult<()>;
    async fn task_instance_ended(&self, task: &str, replica: u32) -> RemoteResult<()>;

    // ── Files ─────────────────────────────────────────────────────

    async fn job_files(&self) -> RemoteResult<Vec<JobFile>>;
    /// Base64 content of a checked-in job file.
    async fn job_file_content(&self, path: &str) -> RemoteResult<Option<String>>;
    /// Store a file at the job level; `content` is base64.
    async fn upload_job_file(&self, path: &str, content: &str) -> RemoteResult<()>;
    /// Which of the given content hashes the authority does not have.
    async fn missing_files(&self, hashes: Vec<String>) -> RemoteResult<Vec<String>>;
    async fn upload_output_file(
        &self,
        task: &str,
        replica: u32,
        path: &str,
        hash: &str,
        content: &str,
    ) -> RemoteResult<()>;
    /// Attach already-known content to an instance output path.
    async fn register_output_file(&self, task: &str, replica: u32, path: &str, hash: &str) -> RemoteResult<()>;

    // ── Streams ───────────────────────────────────────────────────

    async fn log(&self, name: &str, content: &str) -> RemoteResult<()>;
    async fn channel_data(&self, channel: &str, rows: &[u8]) -> RemoteResult<()>;
    async fn stream_internal_file(&self, path: &str, rows: &[u8]) -> RemoteResult<()>;

    async fn register_peer(&self, peer: Arc<dyn JobPeer>) -> RemoteResult<()>;
}

/// Requests the authority can make of a running job.
#[async_trait]
pub trait JobPeer: Send + Sync {
    async fn stop(&self);
}

/// An open session for one job.
#[derive(Clone)]
pub struct JobSession {
    pub connection: Arc<dyn Connection>,
    pub controller: Arc<dyn JobController>,
}

#[async_trait]
pub trait JobConnector: Send + Sync {
    async fn open(&self, job_id: &str, access_token: &str) -> RemoteResult<JobSession>;
}

/// Calls a node makes against the authority.
#[async_trait]
pub trait NodeController: Send + Sync {
    /// Announce the node; returns its id.
    async fn connected(&self, resources: NodeResources) -> RemoteResult<String>;
    async fn start_policy(&self) -> RemoteResult<StartPolicy>;
    async fn set_resources(&self, resources: NodeResources) -> RemoteResult<()>;
    async fn set_docker_info(&self, info: RuntimeInfo) -> RemoteResult<()>;
    async fn set_nvidia_info(&self, info: Option<NvidiaVersions>) -> RemoteResult<()>;
    async fn set_hardware_information(&self, info: HardwareInformation) -> RemoteResult<()>;
    async fn stream_stats(&self, stats: HardwareStats) -> RemoteResult<()>;
    async fn put_stdout(&self, content: &str) -> RemoteResult<()>;
    async fn ready(&self) -> RemoteResult<()>;

    async fn assigned_task_instances(&self) -> RemoteResult<Vec<AssignedTaskInstance>>;
    /// Atomically check that the instance may start and mark it started.
    async fn is_task_instance_allowed_to_start_then_start(
        &self,
        job_id: &str,
        task: &str,
        replica: u32,
    ) -> RemoteResult<bool>;
    async fn job_task_instance_done(&self, job_id: &str, task: &str, replica: u32) -> RemoteResult<()>;

    async fn peers(&self) -> RemoteResult<Vec<Peer>>;
    /// Latency to a peer in milliseconds, `None` when unreachable.
    async fn set_peer_connection(&self, peer_id: &str, latency_ms: Option<f64>) -> RemoteResult<()>;

    async fn register_peer(&self, node_id: &str, peer: Arc<dyn NodePeer>) -> RemoteResult<()>;
}

/// Requests the authority can make of a node.
#[async_trait]
pub trait NodePeer: Send + Sync {
    async fn reload_start_policy(&self) -> RemoteResult<()>;
    async fn check_docker(&self) -> RemoteResult<RuntimeInfo>;
    async fn check_nvidia(&self) -> RemoteResult<Option<NvidiaVersions>>;
    async fn load_jobs_to_start(&self) -> RemoteResult<()>;

    async fn list_images(&self) -> RemoteResult<Vec<ImageSummary>>;
    async fn remove_image(&self, id: &str) -> RemoteResult<()>;
    async fn prune_images(&self) -> RemoteResult<()>;
    async fn list_containers(&self) -> RemoteResult<Vec<ContainerSummary>>;
    async fn prune_containers(&self) -> RemoteResult<()>;

    async fn stop(&self);
}
