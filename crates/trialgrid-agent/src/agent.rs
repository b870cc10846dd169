//! Node agent: the long-running loop on a worker machine.
//!
//! ```text
//!   disconnected ──connect──► report docker info (readiness gate)
//!        ▲                    ─► nvidia info ─► connected(resources) → node id
//!        │                    ─► start policy ─► register node peer
//!        │                    ─► hardware information
//!        │                    ─► ready() + assigned instances   (docker ready only)
//!        │                    ─► peer prober (once)
//!        └──── disconnect ◄── stream hardware stats every tick
//! ```
//!
//! The active-instance map is the only source of reservations: a node's
//! resources are recomputed from it on every report.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use trial_core::{AssignedTaskInstance, ContainerSummary, ImageSummary, RuntimeInfo, StartPolicy};
use trialgrid_executor::{ContainerRuntime, ExecutorConfig};
use trialgrid_metrics::{GpuInfo, GpuReader, HostProbe, NvidiaVersions};
use trialgrid_resources::{GpuCapacity, HostCapacity, NodeResources, compute_resources};
use trialgrid_sync::{Connection, JobConnector, NodeController, NodePeer, RemoteError, RemoteResult, StorageConfig};

use crate::error::{AgentError, AgentResult};
use crate::instance::{InstanceContext, start_task_instance};
use crate::peers::PeerProber;

const GB: f64 = 1_000_000_000.0;

macro_rules! lock {
    ($m:expr) => {
        $m.lock().unwrap_or_else(|e| e.into_inner())
    };
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Job dirs live under `<work_root>/jobs/<job>`.
    pub work_root: PathBuf,
    /// `host:port` of the authority, probed for latency.
    pub server_address: Option<String>,
    pub retry_delay: Duration,
    pub stats_interval: Duration,
    pub probe_interval: Duration,
    /// How long `stop` waits for running instances.
    pub stop_timeout: Duration,
    /// CPU cores to offer instead of the detected count.
    pub cpu: Option<u32>,
    /// Memory in GB to offer instead of the detected amount.
    pub memory: Option<u32>,
    pub gpus: GpuReader,
    pub executor: ExecutorConfig,
    pub storage: StorageConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            work_root: trial_core::trialgrid_home(),
            server_address: None,
            retry_delay: Duration::from_secs(5),
            stats_interval: Duration::from_secs(1),
            probe_interval: Duration::from_secs(20),
            stop_timeout: Duration::from_secs(30),
            cpu: None,
            memory: None,
            gpus: GpuReader::new(),
            executor: ExecutorConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Hardware this node offers.
///
/// CPU and memory come from the container runtime when it is ready and
/// from the OS otherwise; either can be overridden.
pub fn host_capacity(
    runtime: Option<&RuntimeInfo>,
    probe: &dyn HostProbe,
    gpus: &[GpuInfo],
    cpu: Option<u32>,
    memory: Option<u32>,
) -> HostCapacity {
    let ready = runtime.filter(|info| info.ready);
    let detected_cpu = match ready {
        Some(info) if info.cpus > 0 => info.cpus,
        _ => probe.cpu_count(),
    };
    let detected_memory = match ready {
        Some(info) if info.memory_bytes > 0 => (info.memory_bytes as f64 / GB).floor() as u32,
        _ => probe.total_memory_gb(),
    };
    HostCapacity {
        cpu: cpu.unwrap_or(detected_cpu),
        memory: memory.unwrap_or(detected_memory),
        gpus: gpus
            .iter()
            .map(|g| GpuCapacity {
                index: g.index,
                name: g.name.clone(),
                memory: g.memory_total,
            })
            .collect(),
    }
}

struct ActiveInstance {
    assigned: AssignedTaskInstance,
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

pub struct NodeAgent {
    me: Weak<NodeAgent>,
    config: AgentConfig,
    connection: Arc<dyn Connection>,
    controller: Arc<dyn NodeController>,
    connector: Arc<dyn JobConnector>,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HostProbe>,

    node_id: Mutex<Option<String>>,
    policy: Mutex<Option<StartPolicy>>,
    docker: Mutex<Option<RuntimeInfo>>,
    active: Mutex<BTreeMap<String, ActiveInstance>>,

    prober_started: AtomicBool,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    /// Set once `stop` has finished.
    stop_done: watch::Sender<bool>,
    /// Set when an instance hit an authentication failure.
    fatal_tx: watch::Sender<Option<String>>,
}

impl NodeAgent {
    pub fn new(
        config: AgentConfig,
        connection: Arc<dyn Connection>,
        controller: Arc<dyn NodeController>,
        connector: Arc<dyn JobConnector>,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HostProbe>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let (stop_done, _) = watch::channel(false);
        let (fatal_tx, _) = watch::channel(None);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            connection,
            controller,
            connector,
            runtime,
            probe,
            node_id: Mutex::new(None),
            policy: Mutex::new(None),
            docker: Mutex::new(None),
            active: Mutex::new(BTreeMap::new()),
            prober_started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            stop_done,
            fatal_tx,
        })
    }

    pub fn node_id(&self) -> Option<String> {
        lock!(self.node_id).clone()
    }

    pub fn start_policy(&self) -> Option<StartPolicy> {
        lock!(self.policy).clone()
    }

    /// Keys of the instances currently running here.
    pub fn active_instances(&self) -> Vec<String> {
        lock!(self.active).keys().cloned().collect()
    }

    // ── Main loop ────────────────────────────────────────────────────

    /// Run until `shutdown` fires, the authority stops the node or an
    /// authentication failure.
    ///
    /// Other failures are logged and retried after `retry_delay`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> AgentResult<()> {
        let mut fatal = self.fatal_tx.subscribe();
        let mut stopping = self.shutdown_tx.subscribe();
        let result = 'outer: loop {
            if *shutdown.borrow() || self.stopped.load(Ordering::SeqCst) {
                break Ok(());
            }

            if !self.connection.is_connected() {
                match self.connection.connect().await {
                    Ok(()) => info!("connected to authority"),
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "authority refused the node");
                        break Err(e.into());
                    }
                    Err(e) => {
                        warn!(error = %e, retry_secs = self.config.retry_delay.as_secs(), "connect failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.retry_delay) => continue,
                            _ = shutdown.changed() => break Ok(()),
                            _ = stopping.changed() => break Ok(()),
                        }
                    }
                }
            }

            if let Err(e) = self.on_connected().await {
                if e.is_fatal() {
                    error!(error = %e, "authority refused the node");
                    break Err(e);
                }
                warn!(error = %e, "node registration failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.retry_delay) => continue,
                    _ = shutdown.changed() => break Ok(()),
                    _ = stopping.changed() => break Ok(()),
                }
            }

            let mut connected = self.connection.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.stats_interval) => {
                        if let Err(e) = self.stream_stats().await {
                            if e.is_fatal() {
                                break 'outer Err(e);
                            }
                            debug!(error = %e, "hardware stats not sent");
                        }
                    }
                    changed = connected.changed() => {
                        if changed.is_err() || !*connected.borrow() {
                            warn!("disconnected from authority");
                            break;
                        }
                    }
                    _ = fatal.changed() => {
                        let message = fatal.borrow().clone().unwrap_or_default();
                        error!(error = %message, "instance hit an authentication failure");
                        break 'outer Err(AgentError::Authentication(message));
                    }
                    _ = shutdown.changed() => break 'outer Ok(()),
                    _ = stopping.changed() => {
                        info!("node stopped by the authority");
                        break 'outer Ok(());
                    }
                }
            }
        };
        self.stop().await;
        result
    }

    async fn on_connected(&self) -> AgentResult<()> {
        let docker = self.check_docker().await?;
        self.check_nvidia().await?;

        let node_id = self.controller.connected(self.resources().await).await?;
        info!(%node_id, "node registered");
        *lock!(self.node_id) = Some(node_id.clone());

        self.reload_start_policy().await?;
        let peer = Arc::new(AgentPeer { agent: self.me.clone() });
        self.controller.register_peer(&node_id, peer).await?;

        let gpus = self.config.gpus.read().await;
        self.controller
            .set_hardware_information(self.probe.hardware_information(&gpus))
            .await?;

        if docker.ready {
            self.controller.ready().await?;
            self.load_jobs_to_start().await?;
        } else {
            warn!(error = ?docker.error, "container runtime not ready, node stays unready");
        }

        if !self.prober_started.swap(true, Ordering::SeqCst) {
            let prober = PeerProber::new(
                self.controller.clone(),
                self.config.server_address.clone(),
                self.config.probe_interval,
            );
            tokio::spawn(prober.run(self.shutdown_tx.subscribe()));
        }
        Ok(())
    }

    async fn stream_stats(&self) -> AgentResult<()> {
        let gpus = self.config.gpus.read().await;
        self.controller.stream_stats(self.probe.stats(&gpus)).await?;
        Ok(())
    }

    // ── Reports ──────────────────────────────────────────────────────

    /// Ask the container runtime for its state and report it.
    pub async fn check_docker(&self) -> AgentResult<RuntimeInfo> {
        let info = match self.runtime.info().await {
            Ok(info) => info,
            Err(e) => RuntimeInfo::unavailable(e.to_string()),
        };
        *lock!(self.docker) = Some(info.clone());
        self.controller.set_docker_info(info.clone()).await?;
        Ok(info)
    }

    pub async fn check_nvidia(&self) -> AgentResult<Option<NvidiaVersions>> {
        let versions = self.config.gpus.versions().await;
        self.controller.set_nvidia_info(versions.clone()).await?;
        Ok(versions)
    }

    pub async fn reload_start_policy(&self) -> AgentResult<()> {
        let policy = self.controller.start_policy().await?;
        debug!(host_execution = policy.host_execution_allowed, "start policy loaded");
        *lock!(self.policy) = Some(policy);
        Ok(())
    }

    /// Current resources, reservations recomputed from the active map.
    pub async fn resources(&self) -> NodeResources {
        let gpus = self.config.gpus.read().await;
        let docker = lock!(self.docker).clone();
        let capacity = host_capacity(
            docker.as_ref(),
            self.probe.as_ref(),
            &gpus,
            self.config.cpu,
            self.config.memory,
        );
        let active: Vec<AssignedTaskInstance> = lock!(self.active).values().map(|a| a.assigned.clone()).collect();
        compute_resources(&capacity, &active)
    }

    async fn report_resources(&self) {
        let resources = self.resources().await;
        if let Err(e) = self.controller.set_resources(resources).await {
            debug!(error = %e, "resources not reported");
        }
    }

    // ── Instances ────────────────────────────────────────────────────

    pub async fn load_jobs_to_start(&self) -> AgentResult<()> {
        let assigned = self.controller.assigned_task_instances().await?;
        debug!(count = assigned.len(), "assigned task instances");
        for instance in assigned {
            self.start_task_instance(instance);
        }
        Ok(())
    }

    /// Start an assigned instance unless it is already active or the agent
    /// is stopping. Returns whether a new instance flow was spawned.
    pub fn start_task_instance(&self, assigned: AssignedTaskInstance) -> bool {
        let Some(policy) = self.start_policy() else {
            warn!(key = %assigned.key(), "no start policy, instance not started");
            return false;
        };
        let key = assigned.key();
        let cancel = {
            let mut active = lock!(self.active);
            if self.stopped.load(Ordering::SeqCst) {
                warn!(%key, "agent stopping, instance not started");
                return false;
            }
            if active.contains_key(&key) {
                debug!(%key, "instance already active");
                return false;
            }
            let (cancel_tx, cancel_rx) = watch::channel(false);
            active.insert(
                key.clone(),
                ActiveInstance {
                    assigned: assigned.clone(),
                    cancel: cancel_tx,
                    handle: None,
                },
            );
            cancel_rx
        };

        let ctx = self.instance_context();
        let agent = self.me.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            match start_task_instance(&ctx, &assigned, policy, cancel).await {
                Ok(Some(code)) => info!(key = %task_key, code, "instance finished"),
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    error!(key = %task_key, error = %e, "instance stopped on authentication failure");
                    if let Some(agent) = agent.upgrade() {
                        agent.fatal_tx.send_replace(Some(e.to_string()));
                    }
                }
                Err(e) => warn!(key = %task_key, error = %e, "instance failed"),
            }
            if let Some(agent) = agent.upgrade() {
                agent.end_task_instance(&task_key).await;
            }
        });
        if let Some(entry) = lock!(self.active).get_mut(&key) {
            entry.handle = Some(handle);
        }

        if let Some(agent) = self.me.upgrade() {
            tokio::spawn(async move { agent.report_resources().await });
        }
        true
    }

    async fn end_task_instance(&self, key: &str) {
        lock!(self.active).remove(key);
        self.report_resources().await;
    }

    fn instance_context(&self) -> InstanceContext {
        InstanceContext {
            controller: self.controller.clone(),
            connector: self.connector.clone(),
            runtime: self.runtime.clone(),
            probe: self.probe.clone(),
            gpus: self.config.gpus.clone(),
            node_id: self.node_id().unwrap_or_default(),
            work_root: self.config.work_root.clone(),
            executor: self.config.executor.clone(),
            storage: self.config.storage.clone(),
        }
    }

    /// Abort every running instance, wait up to `stop_timeout` for them,
    /// then disconnect. Runs once; later calls wait for the first to finish.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            let mut done = self.stop_done.subscribe();
            let _ = done.wait_for(|done| *done).await;
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut active = lock!(self.active);
            active
                .values_mut()
                .filter_map(|a| {
                    let _ = a.cancel.send(true);
                    a.handle.take()
                })
                .collect()
        };
        if !handles.is_empty() {
            info!(count = handles.len(), "stopping running instances");
            let wait = async {
                for handle in handles {
                    let _ = handle.await;
                }
            };
            if tokio::time::timeout(self.config.stop_timeout, wait).await.is_err() {
                warn!("instances did not stop in time");
            }
        }
        self.connection.disconnect().await;
        self.stop_done.send_replace(true);
        info!("node agent stopped");
    }
}

// ── Node peer ────────────────────────────────────────────────────────

/// What the authority may call on this node.
struct AgentPeer {
    agent: Weak<NodeAgent>,
}

impl AgentPeer {
    fn agent(&self) -> RemoteResult<Arc<NodeAgent>> {
        self.agent
            .upgrade()
            .ok_or_else(|| RemoteError::Offline("node agent stopped".into()))
    }
}

fn rejected<E: std::fmt::Display>(e: E) -> RemoteError {
    RemoteError::Rejected(e.to_string())
}

fn remote(e: AgentError) -> RemoteError {
    match e {
        AgentError::Remote(e) => e,
        AgentError::Authentication(msg) => RemoteError::Authentication(msg),
        other => rejected(other),
    }
}

#[async_trait]
impl NodePeer for AgentPeer {
    async fn reload_start_policy(&self) -> RemoteResult<()> {
        self.agent()?.reload_start_policy().await.map_err(remote)
    }

    async fn check_docker(&self) -> RemoteResult<RuntimeInfo> {
        self.agent()?.check_docker().await.map_err(remote)
    }

    async fn check_nvidia(&self) -> RemoteResult<Option<NvidiaVersions>> {
        self.agent()?.check_nvidia().await.map_err(remote)
    }

    async fn load_jobs_to_start(&self) -> RemoteResult<()> {
        self.agent()?.load_jobs_to_start().await.map_err(remote)
    }

    async fn list_images(&self) -> RemoteResult<Vec<ImageSummary>> {
        self.agent()?.runtime.list_images().await.map_err(rejected)
    }

    async fn remove_image(&self, id: &str) -> RemoteResult<()> {
        self.agent()?.runtime.remove_image(id).await.map_err(rejected)
    }

    async fn prune_images(&self) -> RemoteResult<()> {
        self.agent()?.runtime.prune_images().await.map_err(rejected)
    }

    async fn list_containers(&self) -> RemoteResult<Vec<ContainerSummary>> {
        self.agent()?.runtime.list_containers().await.map_err(rejected)
    }

    async fn prune_containers(&self) -> RemoteResult<()> {
        self.agent()?.runtime.prune_containers().await.map_err(rejected)
    }

    async fn stop(&self) {
        if let Ok(agent) = self.agent() {
            agent.stop().await;
        }
    }
}
