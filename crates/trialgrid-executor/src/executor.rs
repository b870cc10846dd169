//! Drives one task instance from checkout to exit.
//!
//! ```text
//!   started ─► checkout files ─► [docker_pull ─► docker_build_await ─► docker_build]
//!           ─► environment ─► joining_network ─► started ─► commands ─► done | failed
//!                                                                     └─► crashed | aborted
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use trial_core::{
    DockerImage, DockerRuntime, EXIT_ABORTED, EXIT_CRASHED, EXIT_FAILED, InstanceStatus, JobTaskConfig, PullStats,
    PullStatus, StartPolicy, epoch_secs, home_dir, instance_dir,
};
use trialgrid_metrics::{GpuReader, HostProbe};
use trialgrid_sync::{FileMatcher, InstanceChange, JobStorage, QueuedCommit, copy_files};

use crate::build::plan_build;
use crate::environment::{collect_environment, expand_bind, parse_env_vars};
use crate::error::{ExecutorError, ExecutorResult};
use crate::monitor::LiveMonitor;
use crate::runtime::{BuildSpec, ContainerRuntime, ContainerSpec, PullEvent};
use crate::stdout::StdoutReader;
use crate::template::{TemplateContext, render, render_lenient};

const GIB: u64 = 1024 * 1024 * 1024;
const PULL_STATS_INTERVAL: Duration = Duration::from_secs(1);

macro_rules! lock {
    ($m:expr) => {
        $m.lock().unwrap_or_else(|e| e.into_inner())
    };
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Instance dirs live at `<instances_root>/<task>/<replica>`.
    pub instances_root: PathBuf,
    /// Fail on undefined template variables instead of substituting `''`.
    pub strict_templates: bool,
    /// Mirror task output to this process's stdout.
    pub echo_output: bool,
    pub agent_version: String,
    pub monitor_interval: Duration,
    pub stop_grace: Duration,
    pub container_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            instances_root: trial_core::trialgrid_home().join("instances"),
            strict_templates: false,
            echo_output: false,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            monitor_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
            container_prefix: "trialgrid".to_string(),
        }
    }
}

/// Resolves once `cancel` reads true. A dropped sender never cancels.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn cpu_limits(cpu: u32) -> (u64, u64) {
    if cpu == 0 { (0, 0) } else { (cpu as u64 * 1000, 1000) }
}

fn apply_pull_event(stats: &mut BTreeMap<String, PullStats>, event: PullEvent) {
    let (layer, status, progress) = match event {
        PullEvent::Downloading { layer, current, total } => (layer, PullStatus::Downloading, Some((current, total))),
        PullEvent::Extracting { layer, current, total } => (layer, PullStatus::Extracting, Some((current, total))),
        PullEvent::Verifying { layer } => (layer, PullStatus::Verifying, None),
        PullEvent::Complete { layer } => (layer, PullStatus::Done, None),
    };
    let entry = stats.entry(layer).or_default();
    entry.status = status;
    if let Some((current, total)) = progress {
        entry.current = current;
        entry.total = total;
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
        }
    }
}

/// Clears an instance dir after the final drain. Files a container wrote
/// as root are removed from inside a throwaway container first.
async fn remove_instance_dir(
    runtime: Arc<dyn ContainerRuntime>,
    dir: PathBuf,
    image: Option<String>,
    container: String,
) -> Result<(), String> {
    if let Some(image) = image
        && dir.exists()
    {
        let spec = ContainerSpec {
            name: container,
            image,
            command: vec!["sh".into(), "-c".into(), "rm -rf /job/*".into()],
            mounts: vec![(dir.clone(), "/job".to_string())],
            working_dir: "/job".into(),
            ..Default::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        runtime.run(&spec, tx).await.map_err(|e| e.to_string())?;
    }
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(format!("{}: {e}", dir.display())),
    }
}

/// Runs one `(task, replica)` of a job.
pub struct TaskExecutor {
    storage: Arc<JobStorage>,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HostProbe>,
    gpus: GpuReader,
    policy: StartPolicy,
    task: JobTaskConfig,
    replica: u32,
    config: ExecutorConfig,
    instance_dir: PathBuf,
    output: Mutex<StdoutReader>,
    image: Mutex<Option<String>>,
    started: AtomicBool,
    ended: AtomicBool,
}

impl TaskExecutor {
    pub fn new(
        storage: Arc<JobStorage>,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HostProbe>,
        policy: StartPolicy,
        task: JobTaskConfig,
        replica: u32,
        config: ExecutorConfig,
    ) -> Self {
        let log_name = format!("{}_{replica}", task.name);
        let output = StdoutReader::new(storage.clone(), &log_name, config.echo_output);
        Self {
            instance_dir: instance_dir(&config.instances_root, &task.name, replica),
            output: Mutex::new(output),
            storage,
            runtime,
            probe,
            gpus: GpuReader::new(),
            policy,
            task,
            replica,
            config,
            image: Mutex::new(None),
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        }
    }

    pub fn with_gpu_reader(mut self, gpus: GpuReader) -> Self {
        self.gpus = gpus;
        self
    }

    pub fn task_name(&self) -> &str {
        &self.task.name
    }

    pub fn replica(&self) -> u32 {
        self.replica
    }

    pub fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    pub fn container_name(&self) -> String {
        let job_id = self.storage.with_job(|j| j.id.clone());
        format!("{}_{job_id}_{}_{}", self.config.container_prefix, self.task.name, self.replica)
    }

    /// Run the instance to its end and return its exit code: `0`, or one
    /// of the aborted/failed/crashed sentinels.
    ///
    /// An executor runs once; a second call is refused.
    pub async fn start(&self, queue_output: bool, mut cancel: watch::Receiver<bool>) -> ExecutorResult<i32> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ExecutorError::AlreadyStarted {
                task: self.task.name.clone(),
                replica: self.replica,
            });
        }
        self.say(&format!("Start task {} #{}", self.task.name, self.replica));

        let outcome = tokio::select! {
            result = self.execute() => Some(result),
            _ = cancelled(&mut cancel) => None,
        };
        lock!(self.output).finish();

        let code = match outcome {
            Some(Ok(0)) => {
                self.say(&format!("Ended task {} #{} exit code 0", self.task.name, self.replica));
                self.record(InstanceChange::ExitCode(0));
                self.record(InstanceChange::Status(InstanceStatus::Done));
                0
            }
            Some(Ok(code)) => {
                self.say(&format!("Ended task {} #{} exit code {code}", self.task.name, self.replica));
                self.record(InstanceChange::ExitCode(code));
                self.record(InstanceChange::Status(InstanceStatus::Failed));
                EXIT_FAILED
            }
            Some(Err(e)) => {
                self.say(&format!("Task crashed: {e}"));
                self.record(InstanceChange::ExitCode(e.exit_code()));
                self.record(InstanceChange::Error(e.to_string()));
                self.record(InstanceChange::Status(InstanceStatus::Crashed));
                EXIT_CRASHED
            }
            None => {
                self.abort_running().await;
                self.record(InstanceChange::Status(InstanceStatus::Aborted));
                EXIT_ABORTED
            }
        };
        self.record(InstanceChange::Ended(epoch_secs()));
        self.end(queue_output);
        Ok(code)
    }

    async fn execute(&self) -> ExecutorResult<i32> {
        self.patch(InstanceChange::Started(epoch_secs()))?;
        self.prepare_instance_dir()?;

        if self.task.settings.is_containerized() {
            self.patch(InstanceChange::Status(InstanceStatus::DockerPull))?;
            self.ensure_image().await?;
            self.patch(InstanceChange::Status(InstanceStatus::DockerBuildAwait))?;
            let image = self.build_image().await?;
            *lock!(self.image) = Some(image);
        }

        let variables = parse_env_vars(&self.task.settings.env);
        let environment = collect_environment(self.probe.as_ref(), &self.config.agent_version, variables).await;
        self.patch(InstanceChange::Environment(environment))?;

        self.patch(InstanceChange::Status(InstanceStatus::JoiningNetwork))?;
        self.patch(InstanceChange::Status(InstanceStatus::Started))?;
        self.run_commands().await
    }

    // ── Checkout ─────────────────────────────────────────────────────

    fn prepare_instance_dir(&self) -> ExecutorResult<()> {
        if self.instance_dir.exists() {
            std::fs::remove_dir_all(&self.instance_dir)?;
        }
        std::fs::create_dir_all(&self.instance_dir)?;
        let matcher = FileMatcher::new::<&str>(&[], &[])?;
        copy_files(self.storage.files_dir(), &self.instance_dir, &matcher)?;

        let meta = self.instance_dir.join(".trialgrid");
        std::fs::create_dir_all(&meta)?;
        let job = self.storage.job();
        std::fs::write(meta.join("job.json"), serde_json::to_vec_pretty(&job).map_err(std::io::Error::other)?)?;
        std::fs::write(
            meta.join("task.json"),
            serde_json::to_vec_pretty(&self.task).map_err(std::io::Error::other)?,
        )?;
        Ok(())
    }

    // ── Image ────────────────────────────────────────────────────────

    async fn ensure_image(&self) -> ExecutorResult<()> {
        let image = &self.task.settings.image;
        if self.runtime.image_exists(image).await? {
            return Ok(());
        }
        self.say(&format!("Docker pull {image}"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut stats = BTreeMap::new();
        let mut last_patch: Option<Instant> = None;
        let mut dirty = false;
        let result = {
            let pull = self.runtime.pull(image, tx);
            tokio::pin!(pull);
            loop {
                tokio::select! {
                    Some(event) = rx.recv() => {
                        apply_pull_event(&mut stats, event);
                        dirty = true;
                        if last_patch.is_none_or(|t| t.elapsed() >= PULL_STATS_INTERVAL) {
                            self.patch(InstanceChange::PullStats(stats.clone()))?;
                            last_patch = Some(Instant::now());
                            dirty = false;
                        }
                    }
                    result = &mut pull => break result,
                }
            }
        };
        while let Ok(event) = rx.try_recv() {
            apply_pull_event(&mut stats, event);
            dirty = true;
        }
        if dirty {
            self.patch(InstanceChange::PullStats(stats))?;
        }
        result
    }

    /// Build when the task asks for it; returns the image to run.
    async fn build_image(&self) -> ExecutorResult<String> {
        let info = self.runtime.info().await?;
        self.patch(InstanceChange::Docker(DockerRuntime {
            run_on_version: info.version,
        }))?;

        let settings = &self.task.settings;
        let mut image = settings.image.clone();
        let dirs = self.storage.with_job(|j| j.config.dirs.clone());
        if let Some(plan) = plan_build(self.storage.project(), settings, &dirs, &self.instance_dir) {
            if let Some(content) = &plan.generated {
                let path = self.instance_dir.join(&plan.dockerfile);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, content)?;
                self.storage.add_file(&plan.dockerfile, content.as_bytes())?;
            }
            self.patch(InstanceChange::Status(InstanceStatus::DockerBuild))?;

            let (cpu_quota, cpu_period) = cpu_limits(settings.resources.cpu);
            let spec = BuildSpec {
                context: self.instance_dir.clone(),
                dockerfile: plan.dockerfile.clone(),
                tag: plan.tag.clone(),
                memory_bytes: settings.resources.memory as u64 * GIB,
                cpu_quota,
                cpu_period,
            };
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let result = {
                let build = self.runtime.build(&spec, tx);
                tokio::pin!(build);
                loop {
                    tokio::select! {
                        Some(line) = rx.recv() => self.write_output(&format!("{line}\n")),
                        result = &mut build => break result,
                    }
                }
            };
            while let Ok(line) = rx.try_recv() {
                self.write_output(&format!("{line}\n"));
            }
            if let Err(e) = result {
                self.say(&format!("Docker build failed: {e}"));
                return Err(e);
            }
            image = plan.tag;
        }

        let info = self.runtime.inspect_image(&image).await?;
        self.patch(InstanceChange::DockerImage(DockerImage {
            name: image.clone(),
            id: info.id,
            size: info.size,
            os: info.os,
            arch: info.arch,
            created: info.created,
            built_with_docker_version: info.docker_version,
        }))?;
        Ok(image)
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Commands run in order until one exits non-zero.
    async fn run_commands(&self) -> ExecutorResult<i32> {
        let commands = &self.task.settings.commands;
        if commands.is_empty() {
            return Err(ExecutorError::NoCommand(self.task.name.clone()));
        }
        let job_config = self.storage.with_job(|j| j.config.config.clone());
        let ctx = TemplateContext::new(&job_config, &self.task.instance_name(self.replica));
        let image = lock!(self.image).clone();

        let mut code = 0;
        for command in commands {
            let rendered = if self.config.strict_templates {
                render(&command.command, &ctx)?
            } else {
                render_lenient(&command.command, &ctx)?
            };
            code = match &image {
                Some(image) => self.run_container(image, &rendered).await?,
                None => self.run_host(&rendered).await?,
            };
            if code != 0 {
                break;
            }
        }
        Ok(code)
    }

    async fn run_container(&self, image: &str, command: &str) -> ExecutorResult<i32> {
        let assigned = self
            .storage
            .with_job(|j| j.instance(&self.task.name, self.replica).map(|i| i.assigned_resources.clone()))
            .unwrap_or_default();
        let gpu_uuids = if assigned.gpus.is_empty() {
            Vec::new()
        } else {
            self.gpus.uuids_for_indexes(&assigned.gpu_indexes()).await
        };

        let mut raw_binds = self.policy.docker_binds.clone();
        if self.policy.custom_mounts_allowed {
            raw_binds.extend(self.task.settings.docker.binds.iter().cloned());
        }
        let home = home_dir();
        let binds = raw_binds
            .iter()
            .map(|b| expand_bind(b, &home, &self.instance_dir))
            .collect();

        let (job_id, access_token, job_config) =
            self.storage
                .with_job(|j| (j.id.clone(), j.access_token.clone(), serde_json::Value::Object(j.config.config.clone())));
        let mut env = vec![
            "PYTHONUNBUFFERED=1".to_string(),
            "TRIALGRID_ROOT_DIR=/job".to_string(),
            format!("TRIALGRID_JOB_ACCESSTOKEN={access_token}"),
            format!("TRIALGRID_JOB_ID={job_id}"),
            format!("TRIALGRID_JOB_CONFIG={job_config}"),
        ];
        env.extend(self.policy.env.iter().cloned());
        env.extend(self.task.settings.docker.env.iter().cloned());

        let (cpu_quota, cpu_period) = cpu_limits(assigned.cpu);
        let spec = ContainerSpec {
            name: self.container_name(),
            image: image.to_string(),
            command: vec!["sh".into(), "-c".into(), command.to_string()],
            env,
            binds,
            mounts: vec![(self.instance_dir.clone(), "/job".to_string())],
            working_dir: "/job".into(),
            memory_bytes: assigned.memory as u64 * GIB,
            cpu_quota,
            cpu_period,
            gpu_uuids,
        };
        self.say(&format!("start docker {image}: {command}"));

        let (stop_tx, stop_rx) = watch::channel(false);
        let monitor = LiveMonitor::new(
            self.runtime.clone(),
            self.gpus.clone(),
            self.storage.clone(),
            &spec.name,
            &self.task.name,
            self.replica,
            assigned.cpu,
            assigned.gpu_indexes(),
        );
        let monitor = tokio::spawn(monitor.run(self.config.monitor_interval, stop_rx));

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let result = {
            let run = self.runtime.run(&spec, tx);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    Some(chunk) = rx.recv() => self.feed(&chunk),
                    result = &mut run => break result,
                }
            }
        };
        while let Ok(chunk) = rx.try_recv() {
            self.feed(&chunk);
        }
        lock!(self.output).finish();
        let _ = stop_tx.send(true);
        let _ = monitor.await;

        Ok(result? as i32)
    }

    async fn run_host(&self, command: &str) -> ExecutorResult<i32> {
        if !self.policy.host_execution_allowed {
            self.say("Tasks without a container image are not allowed on this node.");
            return Ok(1);
        }

        let (job_id, access_token, job_config) =
            self.storage
                .with_job(|j| (j.id.clone(), j.access_token.clone(), serde_json::Value::Object(j.config.config.clone())));
        let mut env = BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())]);
        env.insert("TRIALGRID_JOB_CONFIG".into(), job_config.to_string());
        env.insert("TRIALGRID_JOB_ACCESSTOKEN".into(), access_token);
        env.insert("TRIALGRID_JOB_ID".into(), job_id);
        env.insert("TRIALGRID_ROOT_DIR".into(), self.instance_dir.to_string_lossy().into_owned());
        env.extend(parse_env_vars(&self.policy.env));
        env.extend(parse_env_vars(&self.task.settings.env));

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.instance_dir)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!(task = %self.task.name, replica = self.replica, %command, "host process started");

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx.clone()));
        }
        drop(tx);

        let status = loop {
            tokio::select! {
                Some(chunk) = rx.recv() => self.feed(&chunk),
                status = child.wait() => break status?,
            }
        };
        while let Some(chunk) = rx.recv().await {
            self.feed(&chunk);
        }
        lock!(self.output).finish();
        Ok(status.code().unwrap_or(1))
    }

    // ── End ──────────────────────────────────────────────────────────

    async fn abort_running(&self) {
        self.say(&format!("Stopping task {} #{}", self.task.name, self.replica));
        if !self.task.settings.is_containerized() {
            return;
        }
        let name = self.container_name();
        if let Err(e) = self.runtime.stop(&name, self.config.stop_grace).await {
            debug!(container = %name, error = %e, "stop failed");
        }
        if let Err(e) = self.runtime.remove(&name).await {
            debug!(container = %name, error = %e, "remove failed");
        }
    }

    /// Queue output commits and the instance-dir cleanup. Runs once.
    fn end(&self, queue_output: bool) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        if queue_output && !self.task.settings.output.is_empty() {
            self.storage.queue_commit(QueuedCommit {
                task: self.task.name.clone(),
                replica: self.replica,
                root: self.instance_dir.clone(),
                patterns: self.task.settings.output.clone(),
            });
        }
        let runtime = self.runtime.clone();
        let dir = self.instance_dir.clone();
        let image = lock!(self.image).clone();
        let container = format!("{}_cleanup", self.container_name());
        self.storage
            .add_cleanup(Box::new(move || Box::pin(remove_instance_dir(runtime, dir, image, container))));
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn patch(&self, change: InstanceChange) -> ExecutorResult<()> {
        self.storage.patch_instance(&self.task.name, self.replica, change)?;
        Ok(())
    }

    /// Patch on the way out, where a failure can only be logged.
    fn record(&self, change: InstanceChange) {
        if let Err(e) = self.storage.patch_instance(&self.task.name, self.replica, change) {
            warn!(task = %self.task.name, replica = self.replica, error = %e, "instance patch failed");
        }
    }

    fn feed(&self, chunk: &[u8]) {
        lock!(self.output).feed(chunk);
    }

    fn write_output(&self, text: &str) {
        lock!(self.output).write_raw(text);
    }

    fn say(&self, message: &str) {
        debug!(task = %self.task.name, replica = self.replica, "{message}");
        self.write_output(&format!("{message}\n"));
    }
}
