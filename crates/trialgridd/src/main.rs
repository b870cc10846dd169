//! trialgridd: the trialgrid daemon.
//!
//! # Usage
//!
//! ```text
//! trialgridd resolve trialgrid.yaml --root ./experiment
//! trialgridd run trialgrid.yaml --root ./experiment --config lr=0.01 --cpu 2
//! trialgridd hardware
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trial_core::{ConfigOverrides, Job, JobConfig, JobDirs, JobStatus, resolve, trialgrid_home};
use trialgrid_agent::{JobRunner, RunnerConfig, host_capacity};
use trialgrid_executor::{ContainerRuntime, DockerEngine, ExecutorConfig};
use trialgrid_metrics::{GpuReader, HostProbe, SysinfoProbe};
use trialgrid_resources::compute_resources;
use trialgrid_sync::{FileMatcher, JobStorage, LoopbackAuthority, OpsJournal, StorageConfig, copy_files};

const DEFAULT_FILTER: &str = "info,trialgridd=debug,trialgrid=debug";

/// Exit code for configuration errors.
const EXIT_CONFIG: i32 = 2;

#[derive(Parser)]
#[command(name = "trialgridd", about = "trialgrid daemon", version)]
struct Cli {
    /// Log as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Print the fully resolved job configuration.
    Resolve {
        /// Entry config file, relative to the root.
        #[arg(default_value = "trialgrid.yaml")]
        entry: String,

        /// Root directory imports are resolved against.
        #[arg(long, default_value = ".")]
        root: PathBuf,

        #[arg(long, value_enum, default_value = "yaml")]
        format: Format,
    },
    /// Run a job on this machine.
    Run {
        #[arg(default_value = "trialgrid.yaml")]
        entry: String,

        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Project the job belongs to.
        #[arg(long, default_value = "local")]
        project: String,

        /// Work directory (default: $TRIALGRID_HOME or ~/.trialgrid).
        #[arg(long)]
        work_root: Option<PathBuf>,

        /// CPU cores per replica.
        #[arg(long)]
        cpu: Option<u32>,

        /// Memory in GB per replica.
        #[arg(long)]
        memory: Option<u32>,

        /// GPUs per replica.
        #[arg(long)]
        gpu: Option<u32>,

        /// `path=value` entries for the config map (repeatable).
        #[arg(long = "config", value_name = "KEY=VALUE")]
        config: Vec<String>,

        /// Fail on undefined template variables.
        #[arg(long)]
        strict_templates: bool,
    },
    /// Print this node's resources and hardware information.
    Hardware,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Resolve { entry, root, format } => {
            let config = resolve_or_exit(&root, &entry, None);
            let output = match format {
                Format::Yaml => serde_yaml::to_string(&config)?,
                Format::Json => serde_json::to_string_pretty(&config)?,
            };
            println!("{output}");
            Ok(())
        }
        Command::Run {
            entry,
            root,
            project,
            work_root,
            cpu,
            memory,
            gpu,
            config,
            strict_templates,
        } => {
            let overrides = ConfigOverrides {
                cpu,
                memory,
                gpu,
                config,
                ..Default::default()
            };
            let job_config = resolve_or_exit(&root, &entry, Some(&overrides));
            let work_root = work_root.unwrap_or_else(trialgrid_home);
            let code = run_job(&root, &entry, &project, &work_root, job_config, strict_templates).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Command::Hardware => hardware().await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Config errors are the user's to fix: print them verbatim and exit.
fn resolve_or_exit(root: &Path, entry: &str, overrides: Option<&ConfigOverrides>) -> JobConfig {
    let resolved = resolve(root, entry).and_then(|mut config| {
        if let Some(overrides) = overrides {
            config.apply_overrides(overrides)?;
        }
        Ok(config)
    });
    match resolved {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EXIT_CONFIG);
        }
    }
}

/// Copy the job's files: the `files` patterns from the root, or the entry's
/// directory when none are given.
fn copy_job_files(root: &Path, entry: &str, config: &JobConfig, to: &Path) -> anyhow::Result<usize> {
    let (source, patterns) = if config.files.is_empty() {
        let dir = Path::new(entry).parent().map(|p| root.join(p)).unwrap_or_else(|| root.to_path_buf());
        (dir, Vec::new())
    } else {
        (root.to_path_buf(), config.files.clone())
    };
    let matcher = FileMatcher::new(&patterns, &config.ignore)?;
    Ok(copy_files(&source, to, &matcher)?.len())
}

async fn run_job(
    root: &Path,
    entry: &str,
    project: &str,
    work_root: &Path,
    config: JobConfig,
    strict_templates: bool,
) -> anyhow::Result<i32> {
    let job_id = uuid::Uuid::new_v4().to_string();
    let dirs = JobDirs::new(work_root, &job_id);
    std::fs::create_dir_all(dirs.files())?;
    let copied = copy_job_files(root, entry, &config, &dirs.files())?;
    info!(%job_id, files = copied, dir = %dirs.root().display(), "job created");

    let mut job = Job::new(&job_id, &uuid::Uuid::new_v4().to_string(), config);
    job.project = project.to_string();
    job.status = JobStatus::Created;

    let authority = LoopbackAuthority::new(&job);
    authority.set_project(project);
    let journal = OpsJournal::open(&dirs.journal())?;
    let storage = JobStorage::new(
        authority.session(),
        project,
        job,
        &dirs.files(),
        Some(journal),
        StorageConfig::default(),
    )?;
    storage.spawn();

    let runtime = Arc::new(DockerEngine::default());
    let probe = Arc::new(SysinfoProbe::new());
    let gpus = GpuReader::new();
    let docker = match runtime.info().await {
        Ok(info) => Some(info),
        Err(e) => {
            warn!(error = %e, "container runtime unavailable, only host tasks can run");
            None
        }
    };
    let capacity = host_capacity(docker.as_ref(), probe.as_ref(), &gpus.read().await, None, None);
    info!(cpu = capacity.cpu, memory = capacity.memory, gpus = capacity.gpus.len(), "node capacity");

    let runner_config = RunnerConfig {
        executor: ExecutorConfig {
            instances_root: dirs.instances(),
            strict_templates,
            echo_output: true,
            ..ExecutorConfig::default()
        },
        gpus,
        ..RunnerConfig::new(capacity)
    };
    let runner = JobRunner::new(storage.clone(), runtime, probe, runner_config);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("abort requested");
            let _ = cancel_tx.send(true);
            // keep the sender alive so the runner sees the abort
            std::future::pending::<()>().await;
        }
    });

    let code = runner.run(cancel_rx).await?;
    storage.stop().await?;
    info!(%job_id, code, "job finished");
    Ok(code)
}

async fn hardware() -> anyhow::Result<()> {
    let probe = SysinfoProbe::new();
    let gpus = GpuReader::new().read().await;
    let runtime = DockerEngine::default();
    let docker = match runtime.info().await {
        Ok(info) => info,
        Err(e) => trial_core::RuntimeInfo::unavailable(e.to_string()),
    };
    let capacity = host_capacity(Some(&docker), &probe, &gpus, None, None);
    let report = serde_json::json!({
        "resources": compute_resources(&capacity, std::iter::empty()),
        "hardware": probe.hardware_information(&gpus),
        "docker": docker,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
