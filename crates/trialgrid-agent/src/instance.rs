//! Running one assigned task instance on this node.
//!
//! ```text
//!   allowed to start? ──no──► instance done
//!        │ yes
//!   open job session ─► fetch job ─► instance started ─► checkout files
//!        ─► executor (output queued) ─► drain storage ─► instance ended
//!        ─► instance done (always)
//! ```

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use trial_core::{
    AssignedTaskInstance, EXIT_CRASHED, InstanceStatus, Job, JobDirs, JobStatus, JobTaskConfig, StartPolicy,
    epoch_secs,
};
use trialgrid_executor::{ContainerRuntime, ExecutorConfig, TaskExecutor, cancelled};
use trialgrid_metrics::{GpuReader, HostProbe};
use trialgrid_sync::{
    InstanceChange, JobConnector, JobController, JobPeer, JobStorage, NodeController, OpsJournal, StorageConfig,
};

use crate::error::{AgentError, AgentResult};

/// What an instance flow needs from the agent.
#[derive(Clone)]
pub struct InstanceContext {
    pub controller: Arc<dyn NodeController>,
    pub connector: Arc<dyn JobConnector>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub probe: Arc<dyn HostProbe>,
    pub gpus: GpuReader,
    pub node_id: String,
    /// Job dirs live under `<work_root>/jobs/<job>`.
    pub work_root: PathBuf,
    pub executor: ExecutorConfig,
    pub storage: StorageConfig,
}

/// Stops the executor when the authority stops the job.
struct JobStopper {
    cancel: watch::Sender<bool>,
}

#[async_trait]
impl JobPeer for JobStopper {
    async fn stop(&self) {
        info!("job stop requested");
        let _ = self.cancel.send(true);
    }
}

fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Only plain relative paths may be written below the files dir.
fn checked_relative(path: &str) -> AgentResult<&Path> {
    let relative = Path::new(path);
    let plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if path.is_empty() || !plain {
        return Err(AgentError::JobFile {
            path: path.to_string(),
            reason: "not a relative path".into(),
        });
    }
    Ok(relative)
}

/// Bring `dir` in line with the job's checked-in files. Files already
/// present with the right content are left alone. Returns how many
/// files were written.
pub async fn download_job_files(controller: &dyn JobController, dir: &Path) -> AgentResult<usize> {
    let mut written = 0;
    for file in controller.job_files().await? {
        let target = dir.join(checked_relative(&file.path)?);
        if let Ok(existing) = tokio::fs::read(&target).await
            && sha256_hex(&existing) == file.hash
        {
            continue;
        }
        let content = controller
            .job_file_content(&file.path)
            .await?
            .ok_or_else(|| AgentError::JobFile {
                path: file.path.clone(),
                reason: "no content on the server".into(),
            })?;
        let bytes = BASE64.decode(content).map_err(|e| AgentError::JobFile {
            path: file.path.clone(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        written += 1;
    }
    debug!(dir = %dir.display(), written, "job files checked out");
    Ok(written)
}

/// Why a fetched job can not run the given instance, if it can't.
fn not_startable(job: &Job, task: &str, replica: u32) -> Option<String> {
    if job.status == JobStatus::Creating {
        return Some("job is still being created".into());
    }
    let Some(record) = job.task(task) else {
        return Some(format!("task {task} not found"));
    };
    if record.is_ended() {
        return Some(format!("task {task} already ended"));
    }
    match record.instance(replica) {
        None => Some(format!("instance {replica} of task {task} not found")),
        Some(instance) if instance.is_ended() => Some(format!("instance {replica} of task {task} already ended")),
        Some(_) => None,
    }
}

/// Run an assigned instance to its end.
///
/// Returns `None` when the authority did not allow it to start. The
/// authority is told the instance is done in every case.
pub async fn start_task_instance(
    ctx: &InstanceContext,
    assigned: &AssignedTaskInstance,
    policy: StartPolicy,
    cancel: watch::Receiver<bool>,
) -> AgentResult<Option<i32>> {
    let (job_id, task, replica) = (&assigned.job_id, &assigned.task_name, assigned.instance);
    info!(%job_id, %task, replica, "start task instance");

    let allowed = ctx
        .controller
        .is_task_instance_allowed_to_start_then_start(job_id, task, replica)
        .await?;
    let result = if allowed {
        run_allowed(ctx, assigned, policy, cancel).await.map(Some)
    } else {
        warn!(%job_id, %task, replica, "instance already started or deleted");
        Ok(None)
    };

    if let Err(e) = ctx.controller.job_task_instance_done(job_id, task, replica).await {
        warn!(%job_id, %task, replica, error = %e, "failed to report instance done");
    }
    result
}

async fn run_allowed(
    ctx: &InstanceContext,
    assigned: &AssignedTaskInstance,
    policy: StartPolicy,
    cancel: watch::Receiver<bool>,
) -> AgentResult<i32> {
    let (job_id, task, replica) = (&assigned.job_id, &assigned.task_name, assigned.instance);
    let session = ctx.connector.open(job_id, &assigned.job_access_token).await?;
    let job = session
        .controller
        .job()
        .await?
        .ok_or_else(|| AgentError::JobNotFound(job_id.clone()))?;
    if let Some(reason) = not_startable(&job, task, replica) {
        return Err(AgentError::NotStartable {
            job: job_id.clone(),
            reason,
        });
    }
    let task_config = job
        .config
        .task(task)
        .cloned()
        .ok_or_else(|| AgentError::NotStartable {
            job: job_id.clone(),
            reason: format!("task {task} has no configuration"),
        })?;
    let project = session.controller.project_name().await?;

    let dirs = JobDirs::new(&ctx.work_root, job_id);
    tokio::fs::create_dir_all(dirs.files()).await?;
    let journal = OpsJournal::open(&dirs.journal())?;
    let storage = JobStorage::new(session.clone(), &project, job, &dirs.files(), Some(journal), ctx.storage.clone())?;
    storage.spawn();
    let (stop_tx, stop_rx) = watch::channel(false);
    storage.register_peer_on_connect(Arc::new(JobStopper { cancel: stop_tx }));

    let outcome = execute(ctx, &storage, assigned, task_config, policy, cancel, stop_rx).await;
    let code = match outcome {
        Ok(code) => code,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            error!(%job_id, %task, replica, error = %e, "instance crashed before it ran");
            for change in [
                InstanceChange::Error(e.to_string()),
                InstanceChange::Status(InstanceStatus::Crashed),
                InstanceChange::ExitCode(EXIT_CRASHED),
                InstanceChange::Ended(epoch_secs()),
            ] {
                if let Err(e) = storage.patch_instance(task, replica, change) {
                    warn!(%task, replica, error = %e, "instance patch failed");
                }
            }
            EXIT_CRASHED
        }
    };

    storage.stop().await?;
    session.controller.task_instance_ended(task, replica).await?;
    info!(%job_id, %task, replica, code, "task instance ended");
    Ok(code)
}

async fn execute(
    ctx: &InstanceContext,
    storage: &Arc<JobStorage>,
    assigned: &AssignedTaskInstance,
    task_config: JobTaskConfig,
    policy: StartPolicy,
    mut cancel: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
) -> AgentResult<i32> {
    let (task, replica) = (&assigned.task_name, assigned.instance);
    let controller = storage.session().controller.clone();
    let dirs = JobDirs::new(&ctx.work_root, &assigned.job_id);
    controller.task_instance_started(task, replica).await?;
    storage.patch_instance(task, replica, InstanceChange::Node(ctx.node_id.clone()))?;
    storage.patch_instance(
        task,
        replica,
        InstanceChange::AssignedResources(assigned.assigned_resources.clone()),
    )?;
    storage.patch_instance(task, replica, InstanceChange::Status(InstanceStatus::CheckoutFiles))?;
    download_job_files(controller.as_ref(), &dirs.files()).await?;

    let config = ExecutorConfig {
        instances_root: dirs.instances(),
        ..ctx.executor.clone()
    };
    let executor = TaskExecutor::new(
        storage.clone(),
        ctx.runtime.clone(),
        ctx.probe.clone(),
        policy,
        task_config,
        replica,
        config,
    )
    .with_gpu_reader(ctx.gpus.clone());

    // Either the agent or the authority may stop the instance.
    let (abort_tx, abort_rx) = watch::channel(false);
    let forward = tokio::spawn(async move {
        tokio::select! {
            _ = cancelled(&mut cancel) => {}
            _ = cancelled(&mut stop) => {}
        }
        let _ = abort_tx.send(true);
    });
    let code = executor.start(true, abort_rx).await;
    forward.abort();
    Ok(code?)
}
