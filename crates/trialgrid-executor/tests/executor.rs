//! Task executor against a scripted container runtime and the loopback
//! authority.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use trial_core::{
    ContainerSummary, EXIT_ABORTED, EXIT_CRASHED, EXIT_FAILED, ImageSummary, InstanceStatus, Job, JobConfig,
    JobTaskConfig, PullStatus, RuntimeInfo, StartPolicy, TaskCommand,
};
use trialgrid_executor::{
    BuildSpec, ContainerRuntime, ContainerSpec, ContainerStats, ExecutorConfig, ExecutorError, ExecutorResult,
    ImageInfo, PullEvent, StdoutReader, TaskExecutor, hardware_file,
};
use trialgrid_metrics::{GpuReader, SysinfoProbe};
use trialgrid_sync::{JobStorage, LoopbackAuthority, StorageConfig};

// ── Scripted runtime ─────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    cached: bool,
    output: Vec<u8>,
    exit_codes: Vec<i64>,
    build_error: Option<String>,
    hang: bool,
}

/// Records every call with the instance status at that moment.
#[derive(Default)]
struct FakeRuntime {
    script: Script,
    storage: Mutex<Option<Arc<JobStorage>>>,
    events: Mutex<Vec<(String, InstanceStatus)>>,
    runs: Mutex<Vec<ContainerSpec>>,
}

impl FakeRuntime {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Default::default()
        })
    }

    fn attach(&self, storage: Arc<JobStorage>) {
        *self.storage.lock().unwrap() = Some(storage);
    }

    fn note(&self, event: &str) {
        let status = self
            .storage
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|s| s.with_job(|j| j.instance("main", 0).map(|i| i.status)))
            .unwrap_or_default();
        self.events.lock().unwrap().push((event.to_string(), status));
    }

    fn events(&self) -> Vec<(String, InstanceStatus)> {
        self.events.lock().unwrap().clone()
    }

    fn event_names(&self) -> Vec<String> {
        self.events().into_iter().map(|(e, _)| e).collect()
    }

    fn status_at(&self, event: &str) -> InstanceStatus {
        self.events()
            .into_iter()
            .find(|(e, _)| e == event)
            .map(|(_, s)| s)
            .unwrap_or_else(|| panic!("no '{event}' call"))
    }

    fn runs(&self) -> Vec<ContainerSpec> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn info(&self) -> ExecutorResult<RuntimeInfo> {
        self.note("info");
        Ok(RuntimeInfo {
            ready: true,
            version: "24.0.7".into(),
            ..Default::default()
        })
    }

    async fn image_exists(&self, _image: &str) -> ExecutorResult<bool> {
        self.note("image_exists");
        Ok(self.script.cached)
    }

    async fn inspect_image(&self, image: &str) -> ExecutorResult<ImageInfo> {
        self.note("inspect");
        Ok(ImageInfo {
            id: format!("sha256:{image}"),
            size: 1024,
            os: "linux".into(),
            arch: "amd64".into(),
            ..Default::default()
        })
    }

    async fn pull(&self, _image: &str, progress: UnboundedSender<PullEvent>) -> ExecutorResult<()> {
        self.note("pull");
        let _ = progress.send(PullEvent::Downloading {
            layer: "l1".into(),
            current: 10,
            total: 20,
        });
        let _ = progress.send(PullEvent::Complete { layer: "l1".into() });
        Ok(())
    }

    async fn build(&self, spec: &BuildSpec, output: UnboundedSender<String>) -> ExecutorResult<()> {
        self.note("build");
        let _ = output.send(format!("Step 1/4 : FROM for {}", spec.tag));
        match &self.script.build_error {
            Some(message) => Err(ExecutorError::Runtime(message.clone())),
            None => Ok(()),
        }
    }

    async fn run(&self, spec: &ContainerSpec, output: UnboundedSender<Vec<u8>>) -> ExecutorResult<i64> {
        self.note(&format!("run:{}", spec.name));
        let index = {
            let mut runs = self.runs.lock().unwrap();
            runs.push(spec.clone());
            runs.len() - 1
        };
        if spec.name.ends_with("_cleanup") {
            return Ok(0);
        }
        let _ = output.send(self.script.output.clone());
        if self.script.hang {
            std::future::pending::<()>().await;
        }
        Ok(self.script.exit_codes.get(index).copied().unwrap_or(0))
    }

    async fn stop(&self, name: &str, _grace: Duration) -> ExecutorResult<()> {
        self.note(&format!("stop:{name}"));
        Ok(())
    }

    async fn remove(&self, name: &str) -> ExecutorResult<()> {
        self.note(&format!("remove:{name}"));
        Ok(())
    }

    async fn stats(&self, _name: &str) -> ExecutorResult<Option<ContainerStats>> {
        Ok(Some(ContainerStats {
            cpu_total_usage: 100,
            system_cpu_usage: 1000,
            online_cpus: 2,
            memory_usage: 50,
            memory_limit: 100,
            ..Default::default()
        }))
    }

    async fn list_images(&self) -> ExecutorResult<Vec<ImageSummary>> {
        Ok(Vec::new())
    }

    async fn remove_image(&self, _id: &str) -> ExecutorResult<()> {
        Ok(())
    }

    async fn prune_images(&self) -> ExecutorResult<()> {
        Ok(())
    }

    async fn list_containers(&self) -> ExecutorResult<Vec<ContainerSummary>> {
        Ok(Vec::new())
    }

    async fn prune_containers(&self) -> ExecutorResult<()> {
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    authority: Arc<LoopbackAuthority>,
    storage: Arc<JobStorage>,
    runtime: Arc<FakeRuntime>,
    work: TempDir,
    _files: TempDir,
}

fn test_task(image: &str, commands: &[&str]) -> JobTaskConfig {
    let mut task = JobTaskConfig::named("main");
    task.settings.image = image.to_string();
    task.settings.commands = commands
        .iter()
        .map(|c| TaskCommand {
            name: String::new(),
            command: c.to_string(),
        })
        .collect();
    task
}

fn harness(task: &JobTaskConfig, script: Script) -> Harness {
    let files = tempfile::tempdir().unwrap();
    std::fs::write(files.path().join("train.py"), "print('hi')\n").unwrap();

    let mut config = JobConfig::default();
    config.config = json!({"lr": 0.1}).as_object().cloned().unwrap();
    config.tasks.push(task.clone());
    let job = Job::new("job-1", "secret", config);

    let authority = LoopbackAuthority::new(&job);
    let storage_config = StorageConfig {
        persist_interval: Duration::from_millis(10),
        flush_interval: Duration::from_millis(10),
        reconnect_base: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
    };
    let storage = JobStorage::new(authority.session(), "demo", job, files.path(), None, storage_config).unwrap();
    let runtime = FakeRuntime::new(script);
    runtime.attach(storage.clone());
    Harness {
        authority,
        storage,
        runtime,
        work: tempfile::tempdir().unwrap(),
        _files: files,
    }
}

fn executor(h: &Harness, task: JobTaskConfig, policy: StartPolicy, strict: bool) -> TaskExecutor {
    let config = ExecutorConfig {
        instances_root: h.work.path().to_path_buf(),
        strict_templates: strict,
        echo_output: false,
        agent_version: "test".into(),
        monitor_interval: Duration::from_millis(10),
        stop_grace: Duration::from_secs(0),
        container_prefix: "tg".into(),
    };
    TaskExecutor::new(
        h.storage.clone(),
        h.runtime.clone(),
        Arc::new(SysinfoProbe::new()),
        policy,
        task,
        0,
        config,
    )
    .with_gpu_reader(GpuReader::new().with_binary("trialgrid-no-such-binary"))
}

/// A receiver whose sender is gone never cancels.
fn never_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

fn instance_status(h: &Harness) -> InstanceStatus {
    h.storage.with_job(|j| j.instance("main", 0).unwrap().status)
}

// ── Containers ───────────────────────────────────────────────────────

#[tokio::test]
async fn image_is_pulled_and_built_before_the_instance_starts() {
    let mut task = test_task("python:3.9", &["python train.py --lr {{lr}}"]);
    task.settings.build = vec!["pip install numpy".into()];
    let h = harness(
        &task,
        Script {
            output: b"hello\n{\"trialgrid\": \"info\", \"name\": \"acc\", \"value\": 1}\n".to_vec(),
            ..Default::default()
        },
    );
    let exec = executor(&h, task, StartPolicy::local(), false);

    assert_eq!(exec.start(true, never_cancel()).await.unwrap(), 0);

    assert_eq!(h.runtime.status_at("pull"), InstanceStatus::DockerPull);
    assert_eq!(h.runtime.status_at("info"), InstanceStatus::DockerBuildAwait);
    assert_eq!(h.runtime.status_at("build"), InstanceStatus::DockerBuild);
    assert_eq!(h.runtime.status_at("run:tg_job-1_main_0"), InstanceStatus::Started);

    let run = &h.runtime.runs()[0];
    assert_eq!(run.command, vec!["sh", "-c", "python train.py --lr '0.1'"]);
    assert!(run.image.starts_with("demo_"));
    assert_eq!(run.mounts[0], (exec.instance_dir().to_path_buf(), "/job".to_string()));
    assert!(run.env.contains(&"TRIALGRID_JOB_ID=job-1".to_string()));
    assert!(run.env.contains(&"TRIALGRID_JOB_CONFIG={\"lr\":0.1}".to_string()));

    assert!(exec.instance_dir().join("train.py").exists());
    assert!(exec.instance_dir().join(".trialgrid/job.json").exists());
    assert!(exec.instance_dir().join(".trialgrid/Dockerfile").exists());

    let job = h.storage.job();
    let instance = job.instance("main", 0).unwrap();
    assert_eq!(instance.status, InstanceStatus::Done);
    assert_eq!(instance.exit_code, Some(0));
    assert_eq!(instance.docker.run_on_version, "24.0.7");
    assert_eq!(instance.docker_image.name, run.image);
    assert_eq!(instance.docker_pull_stats["l1"].status, PullStatus::Done);
    assert_eq!(instance.environment.agent_version, "test");
    assert_eq!(job.infos["acc"], json!(1));

    h.storage.stop().await.unwrap();
    let log = h.authority.log("main_0");
    assert!(log.contains("hello\n"));
    assert!(log.contains("Step 1/4"));
    assert!(!log.contains("trialgrid\""));
    assert!(h.authority.job_file(".trialgrid/Dockerfile").is_some());
    assert_eq!(h.authority.document()["tasks"]["main"]["instances"][0]["status"], "done");

    // Cleanup ran in a throwaway container, then the dir was removed.
    assert!(h.runtime.event_names().contains(&"run:tg_job-1_main_0_cleanup".to_string()));
    assert!(!exec.instance_dir().exists());
}

#[tokio::test]
async fn cached_image_skips_pull_and_build() {
    let task = test_task("python:3.9", &["true"]);
    let h = harness(
        &task,
        Script {
            cached: true,
            ..Default::default()
        },
    );
    let exec = executor(&h, task, StartPolicy::local(), false);
    assert_eq!(exec.start(false, never_cancel()).await.unwrap(), 0);

    let events = h.runtime.event_names();
    assert!(!events.contains(&"pull".to_string()));
    assert!(!events.contains(&"build".to_string()));
    assert_eq!(h.runtime.runs()[0].image, "python:3.9");
}

#[tokio::test]
async fn first_failing_command_stops_the_instance() {
    let task = test_task("python:3.9", &["make data", "make train"]);
    let h = harness(
        &task,
        Script {
            cached: true,
            exit_codes: vec![3, 0],
            ..Default::default()
        },
    );
    let exec = executor(&h, task, StartPolicy::local(), false);

    assert_eq!(exec.start(false, never_cancel()).await.unwrap(), EXIT_FAILED);
    assert_eq!(h.runtime.runs().len(), 1);
    let instance = h.storage.with_job(|j| j.instance("main", 0).cloned().unwrap());
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.exit_code, Some(3));
    assert!(instance.ended.is_some());
}

#[tokio::test]
async fn build_error_crashes_with_parsed_exit_code() {
    let mut task = test_task("python:3.9", &["python train.py"]);
    task.settings.build = vec!["make".into()];
    let h = harness(
        &task,
        Script {
            cached: true,
            build_error: Some("The command '/bin/sh -c make' returned a non-zero code: 2".into()),
            ..Default::default()
        },
    );
    let exec = executor(&h, task, StartPolicy::local(), false);

    assert_eq!(exec.start(false, never_cancel()).await.unwrap(), EXIT_CRASHED);
    let instance = h.storage.with_job(|j| j.instance("main", 0).cloned().unwrap());
    assert_eq!(instance.status, InstanceStatus::Crashed);
    assert_eq!(instance.exit_code, Some(2));
    assert!(instance.error.contains("non-zero code: 2"));
    assert!(h.runtime.runs().is_empty());
}

#[tokio::test]
async fn cancel_stops_the_container_and_aborts() {
    let task = test_task("python:3.9", &["python train.py"]);
    let h = harness(
        &task,
        Script {
            cached: true,
            output: b"epoch 1\n".to_vec(),
            hang: true,
            ..Default::default()
        },
    );
    let exec = Arc::new(executor(&h, task, StartPolicy::local(), false));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let running = {
        let exec = exec.clone();
        tokio::spawn(async move { exec.start(true, cancel_rx).await })
    };

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(instance_status(&h), InstanceStatus::Started);
    cancel_tx.send(true).unwrap();

    assert_eq!(running.await.unwrap().unwrap(), EXIT_ABORTED);
    assert_eq!(instance_status(&h), InstanceStatus::Aborted);
    let events = h.runtime.event_names();
    assert!(events.contains(&"stop:tg_job-1_main_0".to_string()));
    assert!(events.contains(&"remove:tg_job-1_main_0".to_string()));

    h.storage.stop().await.unwrap();
    // Hardware rows were streamed while the container ran.
    assert!(!h.authority.internal_file(&hardware_file("main", 0)).is_empty());
    assert!(h.authority.log("main_0").contains("epoch 1\n"));
}

#[tokio::test]
async fn executor_runs_once() {
    let task = test_task("python:3.9", &["true"]);
    let h = harness(
        &task,
        Script {
            cached: true,
            ..Default::default()
        },
    );
    let exec = executor(&h, task, StartPolicy::local(), false);
    exec.start(false, never_cancel()).await.unwrap();
    assert!(matches!(
        exec.start(false, never_cancel()).await,
        Err(ExecutorError::AlreadyStarted { .. })
    ));
}

// ── Templates ────────────────────────────────────────────────────────

#[tokio::test]
async fn undefined_template_variable_depends_on_strictness() {
    let task = test_task("python:3.9", &["python train.py --seed {{seed}}"]);

    let h = harness(
        &task,
        Script {
            cached: true,
            ..Default::default()
        },
    );
    let exec = executor(&h, task.clone(), StartPolicy::local(), true);
    assert_eq!(exec.start(false, never_cancel()).await.unwrap(), EXIT_CRASHED);
    let error = h.storage.with_job(|j| j.instance("main", 0).unwrap().error.clone());
    assert!(error.contains("seed"));

    let h = harness(
        &task,
        Script {
            cached: true,
            ..Default::default()
        },
    );
    let exec = executor(&h, task, StartPolicy::local(), false);
    assert_eq!(exec.start(false, never_cancel()).await.unwrap(), 0);
    assert_eq!(h.runtime.runs()[0].command[2], "python train.py --seed ''");
}

// ── Host processes ───────────────────────────────────────────────────

#[tokio::test]
async fn host_commands_run_in_the_instance_dir() {
    let mut task = test_task("", &["echo out-$TRIALGRID_JOB_ID", "echo {{_name}} > name.txt"]);
    task.settings.output = vec!["*.txt".into()];
    let h = harness(&task, Script::default());
    let exec = executor(&h, task, StartPolicy::local(), false);

    assert_eq!(exec.start(true, never_cancel()).await.unwrap(), 0);
    assert!(h.runtime.runs().is_empty());
    assert_eq!(h.storage.queued_commits(), 1);

    h.storage.stop().await.unwrap();
    assert!(h.authority.log("main_0").contains("out-job-1\n"));
    let outputs = h.authority.output_files("main", 0);
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].0, "name.txt");
    assert_eq!(h.authority.blob(&outputs[0].1).unwrap(), b"main\n");
}

#[tokio::test]
async fn host_execution_refused_by_policy() {
    let task = test_task("", &["echo should-not-run"]);
    let h = harness(&task, Script::default());
    let policy = StartPolicy {
        host_execution_allowed: false,
        ..StartPolicy::local()
    };
    let exec = executor(&h, task, policy, false);

    assert_eq!(exec.start(false, never_cancel()).await.unwrap(), EXIT_FAILED);
    h.storage.stop().await.unwrap();
    let log = h.authority.log("main_0");
    assert!(log.contains("not allowed"));
    assert!(!log.contains("should-not-run\n"));
}

#[tokio::test]
async fn host_process_is_killed_on_cancel() {
    let task = test_task("", &["sleep 30"]);
    let h = harness(&task, Script::default());
    let exec = Arc::new(executor(&h, task, StartPolicy::local(), false));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let running = {
        let exec = exec.clone();
        tokio::spawn(async move { exec.start(false, cancel_rx).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel_tx.send(true).unwrap();

    let code = tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap().unwrap();
    assert_eq!(code, EXIT_ABORTED);
    assert_eq!(instance_status(&h), InstanceStatus::Aborted);
}

// ── Output directives ────────────────────────────────────────────────

#[tokio::test]
async fn directives_update_the_job() {
    let task = test_task("", &["true"]);
    let h = harness(&task, Script::default());
    let mut reader = StdoutReader::new(h.storage.clone(), "main_0", false);

    reader.feed(b"{trialgrid: iteration, total: 10}\n{\"trialgrid\": \"epoch\", \"epoch\": 3}\n");
    reader.feed(b"{trialgrid: create-channel, name: loss, traces: [train, val]}\n");
    reader.feed(b"step done {trialgrid: channel, name: loss, x: 3, y: [0.5, 0.7]}\n");
    reader.feed(b"{trialgrid: status, title: warming up}\n");
    reader.feed(b"{trialgrid: parameter, path: optimizer.lr, value: 0.01}\n");
    reader.feed(b"{trialgrid: batch, current: 4, total: 40, size: 16}\n");
    reader.feed(b"{trialgrid: channel, name: missing, x: 1, y: 1}\n");
    reader.feed(b"partial without newline");
    reader.finish();

    let job = h.storage.job();
    assert_eq!(job.iterations, 10);
    assert_eq!(job.iteration, 3);
    assert_eq!(job.channels["loss"].traces, vec!["train", "val"]);
    assert_eq!(job.channels["loss"].last_value, vec![0.5, 0.7]);
    assert_eq!(job.title, "warming up");
    assert_eq!(job.parameters["optimizer"], json!({"lr": 0.01}));
    assert_eq!(job.step_label, "batch");
    assert_eq!((job.step, job.steps), (4, 40));

    h.storage.stop().await.unwrap();
    assert_eq!(h.authority.log("main_0"), "step done partial without newline\n");
    assert!(!h.authority.channel_data("loss").is_empty());
}
