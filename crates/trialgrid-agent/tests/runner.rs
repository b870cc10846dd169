//! Local job runner end to end, with host-executed tasks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use trial_core::{
    ContainerSummary, EXIT_ABORTED, EXIT_CRASHED, ImageSummary, Job, JobConfig, JobStatus, JobTaskConfig,
    RuntimeInfo, TaskCommand, TaskStatus,
};
use trialgrid_agent::{JobRunner, RunnerConfig};
use trialgrid_executor::{
    BuildSpec, ContainerRuntime, ContainerSpec, ContainerStats, ExecutorConfig, ExecutorError, ExecutorResult,
    ImageInfo, PullEvent,
};
use trialgrid_metrics::{GpuReader, SysinfoProbe};
use trialgrid_resources::HostCapacity;
use trialgrid_sync::{JobStorage, LoopbackAuthority, StorageConfig};

/// Host tasks never reach the container runtime.
struct NoContainers;

fn refused<T>() -> ExecutorResult<T> {
    Err(ExecutorError::Runtime("no container runtime in this test".into()))
}

#[async_trait]
impl ContainerRuntime for NoContainers {
    async fn info(&self) -> ExecutorResult<RuntimeInfo> {
        Ok(RuntimeInfo::unavailable("no container runtime"))
    }
    async fn image_exists(&self, _image: &str) -> ExecutorResult<bool> {
        refused()
    }
    async fn inspect_image(&self, _image: &str) -> ExecutorResult<ImageInfo> {
        refused()
    }
    async fn pull(&self, _image: &str, _progress: UnboundedSender<PullEvent>) -> ExecutorResult<()> {
        refused()
    }
    async fn build(&self, _spec: &BuildSpec, _output: UnboundedSender<String>) -> ExecutorResult<()> {
        refused()
    }
    async fn run(&self, _spec: &ContainerSpec, _output: UnboundedSender<Vec<u8>>) -> ExecutorResult<i64> {
        refused()
    }
    async fn stop(&self, _name: &str, _grace: Duration) -> ExecutorResult<()> {
        refused()
    }
    async fn remove(&self, _name: &str) -> ExecutorResult<()> {
        refused()
    }
    async fn stats(&self, _name: &str) -> ExecutorResult<Option<ContainerStats>> {
        Ok(None)
    }
    async fn list_images(&self) -> ExecutorResult<Vec<ImageSummary>> {
        Ok(Vec::new())
    }
    async fn remove_image(&self, _id: &str) -> ExecutorResult<()> {
        refused()
    }
    async fn prune_images(&self) -> ExecutorResult<()> {
        refused()
    }
    async fn list_containers(&self) -> ExecutorResult<Vec<ContainerSummary>> {
        Ok(Vec::new())
    }
    async fn prune_containers(&self) -> ExecutorResult<()> {
        refused()
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    authority: Arc<LoopbackAuthority>,
    storage: Arc<JobStorage>,
    runner: JobRunner,
    _work: TempDir,
    _files: TempDir,
}

fn host_task(name: &str, depends_on: &[&str], commands: &[&str]) -> JobTaskConfig {
    let mut task = JobTaskConfig::named(name);
    task.depends_on = depends_on.iter().map(|d| d.to_string()).collect();
    task.settings.commands = commands
        .iter()
        .map(|c| TaskCommand {
            name: String::new(),
            command: c.to_string(),
        })
        .collect();
    task
}

fn harness(tasks: Vec<JobTaskConfig>, capacity: HostCapacity) -> Harness {
    let files = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();

    let mut config = JobConfig::default();
    config.tasks = tasks;
    let job = Job::new("job-1", "secret", config);
    let authority = LoopbackAuthority::new(&job);
    let storage_config = StorageConfig {
        persist_interval: Duration::from_millis(10),
        flush_interval: Duration::from_millis(10),
        reconnect_base: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
    };
    let storage = JobStorage::new(authority.session(), "demo", job, files.path(), None, storage_config).unwrap();

    let runner_config = RunnerConfig {
        executor: ExecutorConfig {
            instances_root: work.path().to_path_buf(),
            monitor_interval: Duration::from_millis(10),
            stop_grace: Duration::from_secs(0),
            ..ExecutorConfig::default()
        },
        retry_interval: Duration::from_millis(10),
        gpus: GpuReader::new().with_binary("trialgrid-no-such-binary"),
        ..RunnerConfig::new(capacity)
    };
    let runner = JobRunner::new(
        storage.clone(),
        Arc::new(NoContainers),
        Arc::new(SysinfoProbe::new()),
        runner_config,
    );
    Harness {
        authority,
        storage,
        runner,
        _work: work,
        _files: files,
    }
}

fn roomy() -> HostCapacity {
    HostCapacity {
        cpu: 8,
        memory: 16,
        gpus: Vec::new(),
    }
}

fn never_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

impl Harness {
    fn job_status(&self) -> JobStatus {
        self.storage.with_job(|j| j.status)
    }

    fn task_status(&self, task: &str) -> TaskStatus {
        self.storage.with_job(|j| j.task(task).unwrap().status)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn dependent_tasks_run_in_order() {
    let h = harness(
        vec![
            host_task("prepare", &[], &["echo prepared"]),
            host_task("train", &["prepare"], &["echo trained"]),
        ],
        roomy(),
    );

    assert_eq!(h.runner.run(never_cancel()).await.unwrap(), 0);
    assert_eq!(h.job_status(), JobStatus::Done);
    assert_eq!(h.task_status("prepare"), TaskStatus::Done);
    assert_eq!(h.task_status("train"), TaskStatus::Done);
    let (prepared, trained) = h.storage.with_job(|j| {
        (
            j.task("prepare").unwrap().ended.unwrap(),
            j.task("train").unwrap().started.unwrap(),
        )
    });
    assert!(prepared <= trained);

    h.storage.stop().await.unwrap();
    assert_eq!(h.authority.document()["status"], "done");
    assert!(h.authority.log("train_0").contains("trained\n"));
}

#[tokio::test]
async fn failed_dependency_stops_the_job() {
    let h = harness(
        vec![
            host_task("prepare", &[], &["exit 3"]),
            host_task("train", &["prepare"], &["echo should-not-run"]),
        ],
        roomy(),
    );

    assert_eq!(h.runner.run(never_cancel()).await.unwrap(), 3);
    assert_eq!(h.job_status(), JobStatus::Failed);
    assert_eq!(h.task_status("prepare"), TaskStatus::Failed);
    assert_eq!(h.storage.with_job(|j| j.task("prepare").unwrap().exit_code), Some(3));
    assert_eq!(h.task_status("train"), TaskStatus::Pending);
}

#[tokio::test]
async fn failure_aborts_running_siblings() {
    let h = harness(
        vec![
            host_task("slow", &[], &["sleep 30"]),
            host_task("broken", &[], &["exit 2"]),
        ],
        roomy(),
    );

    let code = tokio::time::timeout(Duration::from_secs(10), h.runner.run(never_cancel()))
        .await
        .expect("siblings were not aborted")
        .unwrap();
    assert_eq!(code, 2);
    assert_eq!(h.job_status(), JobStatus::Failed);
    assert_eq!(h.task_status("slow"), TaskStatus::Aborted);
}

#[tokio::test]
async fn replica_that_never_fits_crashes_the_job() {
    let mut task = host_task("main", &[], &["echo hi"]);
    task.settings.resources.cpu = 64;
    let h = harness(vec![task], roomy());

    assert_eq!(h.runner.run(never_cancel()).await.unwrap(), EXIT_CRASHED);
    assert_eq!(h.job_status(), JobStatus::Crashed);
    assert_eq!(h.task_status("main"), TaskStatus::Crashed);
    let error = h.storage.with_job(|j| j.instance("main", 0).unwrap().error.clone());
    assert!(error.contains("never fit"));
}

#[tokio::test]
async fn replicas_wait_for_free_resources() {
    let trace = tempfile::tempdir().unwrap();
    let trace_file = trace.path().join("trace");
    let line = format!(
        "echo start >> {path}; sleep 0.2; echo end >> {path}",
        path = trace_file.display()
    );
    let mut task = host_task("main", &[], &[&line]);
    task.replicas = 2;
    let single = HostCapacity {
        cpu: 1,
        memory: 1,
        gpus: Vec::new(),
    };
    let h = harness(vec![task], single);

    assert_eq!(h.runner.run(never_cancel()).await.unwrap(), 0);
    assert_eq!(h.task_status("main"), TaskStatus::Done);
    let trace = std::fs::read_to_string(&trace_file).unwrap();
    assert_eq!(trace, "start\nend\nstart\nend\n");
}

#[tokio::test]
async fn cancel_aborts_the_job() {
    let h = harness(vec![host_task("main", &[], &["sleep 30"])], roomy());
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel_tx.send(true).unwrap();
        // keep the sender alive until the runner has seen it
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let code = tokio::time::timeout(Duration::from_secs(10), h.runner.run(cancel_rx))
        .await
        .expect("job was not aborted")
        .unwrap();
    assert_eq!(code, EXIT_ABORTED);
    assert_eq!(h.job_status(), JobStatus::Aborted);
    assert_eq!(h.task_status("main"), TaskStatus::Aborted);
}
