//! JobStorage: the local copy of a job and everything still owed to the
//! authority about it.
//!
//! ```text
//!   patch_*() ──► Job (local) + PatchQueue ──┐ persist tick ──► OpsJournal
//!   log() / add_channel_value()              │
//!     └─► per-second batches ──┐             │
//!                              ▼             ▼
//!                  flush tick: batches ─► CallQueue, PatchQueue ─► patch_job
//!                                         CallQueue ─► log / channel_data / ...
//!   stop(): reconnect as needed, drain patches, calls and output
//!           commits until empty, then run cleanups
//! ```
//!
//! Flush ticks and the final drain share one async mutex and never overlap.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use trial_core::{Channel, Job, epoch_secs_f64};
use trialgrid_metrics::{encode_channel_row, encode_speed_row};

use crate::backoff::ReconnectBackoff;
use crate::calls::{BufferedCall, CallQueue};
use crate::controller::{JobPeer, JobSession};
use crate::error::{SyncError, SyncResult};
use crate::files::{FileMatcher, find_files};
use crate::journal::OpsJournal;
use crate::mutation::{InstanceChange, InstancePatch, JobPatch, Patch, TaskChange, TaskPatch};
use crate::patch::{Enqueued, PatchQueue};
use crate::progress::ProgressTracker;

/// Internal file the latest speed row is streamed to.
pub const SPEED_METRIC_FILE: &str = ".trialgrid/speed.metric";

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Work to run once everything has been sent, e.g. removing an instance
/// directory.
pub type Cleanup = Box<dyn FnOnce() -> BoxFuture<Result<(), String>> + Send>;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub persist_interval: Duration,
    pub flush_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_secs(1),
            flush_interval: Duration::from_secs(1),
            reconnect_base: Duration::from_secs(2),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

/// Output files of one instance to upload during the drain.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommit {
    pub task: String,
    pub replica: u32,
    pub root: PathBuf,
    pub patterns: Vec<String>,
}

#[derive(Debug, Default)]
struct Batches {
    logs: BTreeMap<String, String>,
    channels: BTreeMap<String, Vec<u8>>,
    speed: Option<Vec<u8>>,
}

impl Batches {
    fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.channels.is_empty() && self.speed.is_none()
    }
}

pub struct JobStorage {
    session: JobSession,
    project: String,
    files_dir: PathBuf,
    config: StorageConfig,
    journal: Option<OpsJournal>,

    job: Mutex<Job>,
    ops: Mutex<PatchQueue>,
    calls: CallQueue,
    batches: Mutex<Batches>,
    progress: Mutex<ProgressTracker>,
    commits: Mutex<Vec<QueuedCommit>>,
    cleanups: Mutex<Vec<Cleanup>>,

    flush_guard: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

macro_rules! lock {
    ($m:expr) => {
        $m.lock().unwrap_or_else(|e| e.into_inner())
    };
}

impl JobStorage {
    /// Create the storage and restore pending ops from the journal.
    ///
    /// Background loops are not running until [`JobStorage::spawn`].
    pub fn new(
        session: JobSession,
        project: &str,
        job: Job,
        files_dir: &Path,
        journal: Option<OpsJournal>,
        config: StorageConfig,
    ) -> SyncResult<Arc<Self>> {
        let mut ops = PatchQueue::new();
        if let Some(journal) = &journal {
            let restored = journal.load()?;
            if !restored.is_empty() {
                info!(job_id = %job.id, ops = restored.len(), "restored pending ops from journal");
            }
            ops.restore(restored);
        }
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            session,
            project: project.to_string(),
            files_dir: files_dir.to_path_buf(),
            config,
            journal,
            job: Mutex::new(job),
            ops: Mutex::new(ops),
            calls: CallQueue::new(),
            batches: Mutex::new(Batches::default()),
            progress: Mutex::new(ProgressTracker::new()),
            commits: Mutex::new(Vec::new()),
            cleanups: Mutex::new(Vec::new()),
            flush_guard: tokio::sync::Mutex::new(()),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
        }))
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    pub fn session(&self) -> &JobSession {
        &self.session
    }

    /// Snapshot of the local job.
    pub fn job(&self) -> Job {
        lock!(self.job).clone()
    }

    pub fn with_job<R>(&self, f: impl FnOnce(&Job) -> R) -> R {
        f(&lock!(self.job))
    }

    pub fn pending_ops(&self) -> usize {
        lock!(self.ops).len()
    }

    pub fn pending_calls(&self) -> Vec<BufferedCall> {
        self.calls.pending()
    }

    pub fn queued_commits(&self) -> usize {
        lock!(self.commits).len()
    }

    // ── Patches ───────────────────────────────────────────────────

    /// Apply a write locally and queue it for the authority.
    pub fn patch(&self, patch: impl Patch) -> SyncResult<Enqueued> {
        let mut job = lock!(self.job);
        patch.apply(&mut job)?;
        Ok(lock!(self.ops).enqueue(&patch.path(), patch.value()))
    }

    pub fn patch_job(&self, patch: JobPatch) -> SyncResult<Enqueued> {
        self.patch(patch)
    }

    pub fn patch_task(&self, task: &str, change: TaskChange) -> SyncResult<Enqueued> {
        self.patch(TaskPatch::new(task, change))
    }

    pub fn patch_instance(&self, task: &str, replica: u32, change: InstanceChange) -> SyncResult<Enqueued> {
        self.patch(InstancePatch::new(task, replica, change))
    }

    // ── Progress ──────────────────────────────────────────────────

    pub fn set_iterations(&self, iterations: u64) -> SyncResult<()> {
        self.patch_job(JobPatch::Iterations(iterations))?;
        Ok(())
    }

    pub fn set_iteration(&self, iteration: u64) -> SyncResult<()> {
        let iterations = self.with_job(|j| j.iterations);
        let progress = lock!(self.progress).iteration(epoch_secs_f64(), iteration, iterations);
        self.patch_job(JobPatch::Iteration(iteration))?;
        self.patch_job(JobPatch::SecondsPerIteration(progress.seconds_per_iteration))?;
        self.patch_job(JobPatch::Eta(progress.eta))?;
        Ok(())
    }

    pub fn set_batch(&self, current: f64, total: f64, size: f64) -> SyncResult<()> {
        let (iteration, iterations) = self.with_job(|j| (j.iteration, j.iterations));
        let now = epoch_secs_f64();
        let batch = lock!(self.progress).batch(now, iteration, iterations, current, total, size);
        self.patch_job(JobPatch::Speed(batch.speed))?;
        self.patch_job(JobPatch::SecondsPerIteration(batch.seconds_per_iteration))?;
        self.patch_job(JobPatch::Eta(batch.eta))?;
        self.report_speed(batch.x, now, batch.speed);
        Ok(())
    }

    /// Only the latest speed row of each second is sent.
    pub fn report_speed(&self, x: f64, time: f64, speed: f64) {
        lock!(self.batches).speed = Some(encode_speed_row(x, time, speed));
    }

    // ── Streams ───────────────────────────────────────────────────

    pub fn log(&self, name: &str, content: &str) {
        lock!(self.batches)
            .logs
            .entry(name.to_string())
            .or_default()
            .push_str(content);
    }

    pub fn create_channel(&self, name: &str, channel: Channel) -> SyncResult<()> {
        self.patch_job(JobPatch::Channel {
            name: name.to_string(),
            channel,
        })?;
        Ok(())
    }

    /// Record a point on an existing channel.
    pub fn add_channel_value(&self, name: &str, x: f64, values: Vec<f64>) -> SyncResult<()> {
        if !self.with_job(|j| j.channels.contains_key(name)) {
            return Err(SyncError::ChannelNotFound(name.to_string()));
        }
        let row = encode_channel_row(x, epoch_secs_f64(), &values);
        self.patch_job(JobPatch::ChannelLastValue {
            name: name.to_string(),
            values,
        })?;
        lock!(self.batches)
            .channels
            .entry(name.to_string())
            .or_default()
            .extend_from_slice(&row);
        Ok(())
    }

    pub fn stream_internal_file(&self, path: &str, rows: Vec<u8>) {
        self.calls.push(BufferedCall::StreamInternalFile {
            path: path.to_string(),
            rows,
        });
    }

    /// Write a file into the job's checked-out files and upload it.
    pub fn add_file(&self, path: &str, content: &[u8]) -> SyncResult<()> {
        let full = self.files_dir.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, content)?;
        self.calls.push(BufferedCall::UploadJobFile {
            path: path.to_string(),
            content: BASE64.encode(content),
        });
        Ok(())
    }

    fn pack_batches(&self) {
        let batches = std::mem::take(&mut *lock!(self.batches));
        if batches.is_empty() {
            return;
        }
        for (name, content) in batches.logs {
            self.calls.push(BufferedCall::Log { name, content });
        }
        for (channel, rows) in batches.channels {
            self.calls.push(BufferedCall::ChannelData { channel, rows });
        }
        if let Some(rows) = batches.speed {
            self.stream_internal_file(SPEED_METRIC_FILE, rows);
        }
    }

    // ── Output files ──────────────────────────────────────────────

    pub fn queue_commit(&self, commit: QueuedCommit) {
        lock!(self.commits).push(commit);
    }

    /// Upload files matching `patterns` under `root` as instance output.
    ///
    /// Content the authority already has is registered by hash instead of
    /// uploaded again.
    pub async fn commit_files(&self, task: &str, replica: u32, root: &Path, patterns: &[String]) -> SyncResult<usize> {
        let ignore = self.with_job(|j| j.config.ignore.clone());
        let matcher = FileMatcher::new(patterns, ignore.as_slice())?;
        let files = find_files(root, &matcher)?;
        if files.is_empty() {
            return Ok(0);
        }

        let mut hashed = Vec::with_capacity(files.len());
        for relative in files {
            let content = std::fs::read(root.join(&relative))?;
            let hash = hex::encode(Sha256::digest(&content));
            hashed.push((relative, hash, content));
        }

        let controller = &self.session.controller;
        let missing = controller
            .missing_files(hashed.iter().map(|(_, h, _)| h.clone()).collect())
            .await?;
        let mut missing: HashSet<String> = missing.into_iter().collect();
        let mut uploaded = 0;
        for (relative, hash, content) in &hashed {
            // content goes up once; later paths with the same hash are registered
            if missing.remove(hash) {
                controller
                    .upload_output_file(task, replica, relative, hash, &BASE64.encode(content))
                    .await?;
                uploaded += 1;
            } else {
                controller.register_output_file(task, replica, relative, hash).await?;
            }
        }
        debug!(%task, replica, files = hashed.len(), uploaded, "output files committed");
        Ok(hashed.len())
    }

    // ── Cleanups ──────────────────────────────────────────────────

    pub fn add_cleanup(&self, cleanup: Cleanup) {
        lock!(self.cleanups).push(cleanup);
    }

    async fn run_cleanups(&self) {
        let cleanups = std::mem::take(&mut *lock!(self.cleanups));
        for cleanup in cleanups {
            if let Err(e) = cleanup().await {
                warn!(error = %e, "cleanup failed");
            }
        }
    }

    // ── Sync ──────────────────────────────────────────────────────

    /// Write pending ops to the journal.
    pub fn persist_ops(&self) -> SyncResult<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let snapshot = lock!(self.ops).snapshot();
        journal.persist(&snapshot)
    }

    /// Send pending ops as one patch. `Ok(false)` when the authority could
    /// not take them; they stay queued.
    async fn sync_ops(&self) -> SyncResult<bool> {
        let batch = lock!(self.ops).begin_send();
        if batch.is_empty() {
            return Ok(true);
        }
        match self.session.controller.patch_job(batch.patches).await {
            Ok(()) => {
                lock!(self.ops).ack(&batch.ids);
                Ok(true)
            }
            Err(e) => {
                lock!(self.ops).nack(&batch.ids);
                if e.is_fatal() {
                    return Err(e.into());
                }
                debug!(error = %e, ops = batch.ids.len(), "patch not delivered, will retry");
                Ok(false)
            }
        }
    }

    async fn sync_calls(&self) -> SyncResult<bool> {
        match self.calls.sync(self.session.controller.as_ref()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(_) => Ok(false),
        }
    }

    /// One flush tick: pack batches, send ops, then buffered calls.
    pub async fn flush(&self) -> SyncResult<bool> {
        let _guard = self.flush_guard.lock().await;
        self.pack_batches();
        Ok(self.sync_ops().await? && self.sync_calls().await?)
    }

    async fn drain_once(&self) -> SyncResult<bool> {
        let _guard = self.flush_guard.lock().await;
        self.pack_batches();
        if !self.sync_ops().await? || !self.sync_calls().await? {
            return Ok(false);
        }

        let commits = lock!(self.commits).clone();
        for commit in commits {
            match self
                .commit_files(&commit.task, commit.replica, &commit.root, &commit.patterns)
                .await
            {
                Ok(_) => lock!(self.commits).retain(|c| c != &commit),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(task = %commit.task, replica = commit.replica, error = %e, "failed to send output files");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn reconnect(&self) -> SyncResult<()> {
        let connection = &self.session.connection;
        let mut backoff = ReconnectBackoff::new(self.config.reconnect_base, self.config.reconnect_max);
        warn!("not connected, waiting for a connection to sync job data");
        loop {
            match connection.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "job sync aborted");
                    return Err(e.into());
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, delay_secs = delay.as_secs_f64(), "reconnect failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Start the persist and flush loops.
    pub fn spawn(self: &Arc<Self>) {
        let persist = spawn_tick(
            Arc::downgrade(self),
            self.config.persist_interval,
            self.shutdown_tx.subscribe(),
            |storage| {
                Box::pin(async move {
                    if let Err(e) = storage.persist_ops() {
                        error!(error = %e, "failed to persist pending ops");
                    }
                })
            },
        );
        let flush = spawn_tick(
            Arc::downgrade(self),
            self.config.flush_interval,
            self.shutdown_tx.subscribe(),
            |storage| {
                Box::pin(async move {
                    if let Err(e) = storage.flush().await {
                        error!(error = %e, "job sync failed");
                    }
                })
            },
        );
        lock!(self.loops).extend([persist, flush]);
    }

    /// Register `peer` with the authority on every (re)connection.
    pub fn register_peer_on_connect(self: &Arc<Self>, peer: Arc<dyn JobPeer>) {
        let mut connected = self.session.connection.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        let controller = self.session.controller.clone();
        let handle = tokio::spawn(async move {
            loop {
                if *connected.borrow_and_update() {
                    if let Err(e) = controller.register_peer(peer.clone()).await {
                        warn!(error = %e, "failed to register job peer");
                    }
                }
                tokio::select! {
                    changed = connected.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        lock!(self.loops).push(handle);
    }

    /// Stop the loops and send everything still pending.
    ///
    /// Waits through disconnects indefinitely; only an authentication
    /// failure ends the drain early. Cleanups run once all data is sent.
    pub async fn stop(&self) -> SyncResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyStopped);
        }
        let _ = self.shutdown_tx.send(true);
        let loops = std::mem::take(&mut *lock!(self.loops));
        for handle in loops {
            let _ = handle.await;
        }

        loop {
            if !self.session.connection.is_connected() {
                self.reconnect().await?;
            }
            if self.drain_once().await? {
                break;
            }
            tokio::time::sleep(self.config.flush_interval).await;
        }

        self.persist_ops()?;
        self.run_cleanups().await;
        info!(job_id = %self.with_job(|j| j.id.clone()), "all job data sent");
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Run `tick` every `interval` until shutdown or the storage is dropped.
/// A tick finishes before the next sleep starts.
fn spawn_tick(
    storage: Weak<JobStorage>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: fn(Arc<JobStorage>) -> BoxFuture<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let Some(storage) = storage.upgrade() else {
                        break;
                    };
                    tick(storage).await;
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
