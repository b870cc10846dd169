//! Container runtime abstraction.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use trial_core::{ContainerSummary, ImageSummary, RuntimeInfo};

use crate::error::ExecutorResult;

/// Metadata of a local image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub size: u64,
    pub os: String,
    pub arch: String,
    pub created: String,
    pub docker_version: String,
}

/// One progress event of an image pull, per layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PullEvent {
    Downloading { layer: String, current: u64, total: u64 },
    Extracting { layer: String, current: u64, total: u64 },
    Verifying { layer: String },
    Complete { layer: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildSpec {
    pub context: PathBuf,
    /// Relative to `context`.
    pub dockerfile: String,
    pub tag: String,
    pub memory_bytes: u64,
    pub cpu_quota: u64,
    pub cpu_period: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    /// `host:container` bind strings.
    pub binds: Vec<String>,
    /// `(host path, container path)` bind mounts.
    pub mounts: Vec<(PathBuf, String)>,
    pub working_dir: String,
    pub memory_bytes: u64,
    pub cpu_quota: u64,
    pub cpu_period: u64,
    /// GPUs exposed through the nvidia device driver.
    pub gpu_uuids: Vec<String>,
}

/// One stats sample of a running container.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerStats {
    pub cpu_total_usage: u64,
    pub system_cpu_usage: u64,
    pub online_cpus: u32,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn info(&self) -> ExecutorResult<RuntimeInfo>;
    async fn image_exists(&self, image: &str) -> ExecutorResult<bool>;
    async fn inspect_image(&self, image: &str) -> ExecutorResult<ImageInfo>;
    async fn pull(&self, image: &str, progress: UnboundedSender<PullEvent>) -> ExecutorResult<()>;
    /// Build output is sent line by line.
    async fn build(&self, spec: &BuildSpec, output: UnboundedSender<String>) -> ExecutorResult<()>;
    /// Create, start and wait for a container; returns its exit code.
    /// Combined stdout/stderr is sent as it arrives.
    async fn run(&self, spec: &ContainerSpec, output: UnboundedSender<Vec<u8>>) -> ExecutorResult<i64>;
    async fn stop(&self, name: &str, grace: Duration) -> ExecutorResult<()>;
    async fn remove(&self, name: &str) -> ExecutorResult<()>;
    /// `None` when the container does not exist (yet).
    async fn stats(&self, name: &str) -> ExecutorResult<Option<ContainerStats>>;

    async fn list_images(&self) -> ExecutorResult<Vec<ImageSummary>>;
    async fn remove_image(&self, id: &str) -> ExecutorResult<()>;
    async fn prune_images(&self) -> ExecutorResult<()>;
    async fn list_containers(&self) -> ExecutorResult<Vec<ContainerSummary>>;
    async fn prune_containers(&self) -> ExecutorResult<()>;
}
