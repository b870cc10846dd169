//! In-process authority for local runs and tests.
//!
//! Keeps the job as a JSON document and applies dot-path patches to it
//! the way a remote authority would. Switches simulate going offline, a
//! revoked token, or calls being rejected after a budget.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::debug;
use trial_core::{Job, JobFile};

use crate::controller::{Connection, JobConnector, JobController, JobPeer, JobSession};
use crate::error::{RemoteError, RemoteResult};
use crate::patch::set_path;

#[derive(Default)]
struct LoopbackState {
    document: Value,
    project: String,
    logs: BTreeMap<String, String>,
    channels: BTreeMap<String, Vec<u8>>,
    internal_files: BTreeMap<String, Vec<u8>>,
    job_files: BTreeMap<String, Vec<u8>>,
    /// Content by sha256.
    blobs: BTreeMap<String, Vec<u8>>,
    /// `(task, replica)` → `(path, hash)`
    outputs: BTreeMap<(String, u32), Vec<(String, String)>>,
    /// Output content uploads received.
    uploads: usize,
    started: BTreeSet<(String, u32)>,
    ended: BTreeSet<(String, u32)>,
    peers: Vec<Arc<dyn JobPeer>>,
}

pub struct LoopbackAuthority {
    me: Weak<LoopbackAuthority>,
    state: Mutex<LoopbackState>,
    connected_tx: watch::Sender<bool>,
    online: AtomicBool,
    auth_failure: AtomicBool,
    /// Stream calls still accepted before rejecting; `None` is unlimited.
    call_budget: Mutex<Option<usize>>,
}

macro_rules! state {
    ($self:expr) => {
        $self.state.lock().unwrap_or_else(|e| e.into_inner())
    };
}

fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn decode(content: &str) -> RemoteResult<Vec<u8>> {
    BASE64
        .decode(content)
        .map_err(|e| RemoteError::Rejected(format!("invalid base64: {e}")))
}

impl LoopbackAuthority {
    /// A connected authority holding `job`.
    pub fn new(job: &Job) -> Arc<Self> {
        let document = serde_json::to_value(job).unwrap_or(Value::Null);
        let (connected_tx, _) = watch::channel(true);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(LoopbackState {
                document,
                project: "local".to_string(),
                ..Default::default()
            }),
            connected_tx,
            online: AtomicBool::new(true),
            auth_failure: AtomicBool::new(false),
            call_budget: Mutex::new(None),
        })
    }

    pub fn session(self: &Arc<Self>) -> JobSession {
        JobSession {
            connection: self.clone(),
            controller: self.clone(),
        }
    }

    pub fn set_project(&self, project: &str) {
        state!(self).project = project.to_string();
    }

    // ── Switches ──────────────────────────────────────────────────

    /// Going offline also drops the connection.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.connected_tx.send_replace(false);
        }
    }

    pub fn set_auth_failure(&self, failing: bool) {
        self.auth_failure.store(failing, Ordering::SeqCst);
    }

    /// Accept `budget` more stream calls, then reject until reset.
    pub fn set_call_budget(&self, budget: Option<usize>) {
        *self.call_budget.lock().unwrap_or_else(|e| e.into_inner()) = budget;
    }

    fn check(&self) -> RemoteResult<()> {
        if self.auth_failure.load(Ordering::SeqCst) {
            return Err(RemoteError::Authentication("access token revoked".into()));
        }
        if !self.online.load(Ordering::SeqCst) || !*self.connected_tx.borrow() {
            return Err(RemoteError::Offline("loopback authority offline".into()));
        }
        Ok(())
    }

    fn check_stream(&self) -> RemoteResult<()> {
        self.check()?;
        let mut budget = self.call_budget.lock().unwrap_or_else(|e| e.into_inner());
        match budget.as_mut() {
            Some(0) => Err(RemoteError::Rejected("call budget exhausted".into())),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    // ── Inspection ────────────────────────────────────────────────

    pub fn document(&self) -> Value {
        state!(self).document.clone()
    }

    pub fn log(&self, name: &str) -> String {
        state!(self).logs.get(name).cloned().unwrap_or_default()
    }

    pub fn channel_data(&self, channel: &str) -> Vec<u8> {
        state!(self).channels.get(channel).cloned().unwrap_or_default()
    }

    pub fn internal_file(&self, path: &str) -> Vec<u8> {
        state!(self).internal_files.get(path).cloned().unwrap_or_default()
    }

    pub fn job_file(&self, path: &str) -> Option<Vec<u8>> {
        state!(self).job_files.get(path).cloned()
    }

    pub fn output_files(&self, task: &str, replica: u32) -> Vec<(String, String)> {
        state!(self)
            .outputs
            .get(&(task.to_string(), replica))
            .cloned()
            .unwrap_or_default()
    }

    pub fn upload_count(&self) -> usize {
        state!(self).uploads
    }

    pub fn blob(&self, hash: &str) -> Option<Vec<u8>> {
        state!(self).blobs.get(hash).cloned()
    }

    pub fn instance_started(&self, task: &str, replica: u32) -> bool {
        state!(self).started.contains(&(task.to_string(), replica))
    }

    pub fn instance_ended(&self, task: &str, replica: u32) -> bool {
        state!(self).ended.contains(&(task.to_string(), replica))
    }

    pub fn peer_count(&self) -> usize {
        state!(self).peers.len()
    }

    /// Ask every registered job peer to stop.
    pub async fn stop_job(&self) {
        let peers = state!(self).peers.clone();
        for peer in peers {
            peer.stop().await;
        }
    }

    /// Check a file in with the job, as a client would before it starts.
    pub fn add_job_file(&self, path: &str, content: &[u8]) {
        state!(self).job_files.insert(path.to_string(), content.to_vec());
    }
}

#[async_trait]
impl Connection for LoopbackAuthority {
    fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    async fn connect(&self) -> RemoteResult<()> {
        if self.auth_failure.load(Ordering::SeqCst) {
            return Err(RemoteError::Authentication("access token revoked".into()));
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::Offline("connection refused".into()));
        }
        self.connected_tx.send_replace(true);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected_tx.send_replace(false);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }
}

#[async_trait]
impl JobController for LoopbackAuthority {
    async fn job(&self) -> RemoteResult<Option<Job>> {
        self.check()?;
        let document = state!(self).document.clone();
        Ok(serde_json::from_value(document).ok())
    }

    async fn project_name(&self) -> RemoteResult<String> {
        self.check()?;
        Ok(state!(self).project.clone())
    }

    async fn patch_job(&self, patches: Map<String, Value>) -> RemoteResult<()> {
        self.check()?;
        let mut state = state!(self);
        for (path, value) in patches {
            set_path(&mut state.document, &path, value);
        }
        Ok(())
    }

    async fn task_instance_started(&self, task: &str, replica: u32) -> RemoteResult<()> {
        self.check()?;
        state!(self).started.insert((task.to_string(), replica));
        Ok(())
    }

    async fn task_instance_ended(&self, task: &str, replica: u32) -> RemoteResult<()> {
        self.check()?;
        state!(self).ended.insert((task.to_string(), replica));
        Ok(())
    }

    async fn job_files(&self) -> RemoteResult<Vec<JobFile>> {
        self.check()?;
        Ok(state!(self)
            .job_files
            .iter()
            .map(|(path, content)| JobFile {
                path: path.clone(),
                hash: sha256_hex(content),
                size: content.len() as u64,
            })
            .collect())
    }

    async fn job_file_content(&self, path: &str) -> RemoteResult<Option<String>> {
        self.check()?;
        Ok(state!(self).job_files.get(path).map(|c| BASE64.encode(c)))
    }

    async fn upload_job_file(&self, path: &str, content: &str) -> RemoteResult<()> {
        self.check_stream()?;
        let bytes = decode(content)?;
        state!(self).job_files.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn missing_files(&self, hashes: Vec<String>) -> RemoteResult<Vec<String>> {
        self.check()?;
        let state = state!(self);
        let mut missing: Vec<String> = hashes.into_iter().filter(|h| !state.blobs.contains_key(h)).collect();
        missing.dedup();
        Ok(missing)
    }

    async fn upload_output_file(
        &self,
        task: &str,
        replica: u32,
        path: &str,
        hash: &str,
        content: &str,
    ) -> RemoteResult<()> {
        self.check()?;
        let bytes = decode(content)?;
        let mut state = state!(self);
        state.uploads += 1;
        state.blobs.insert(hash.to_string(), bytes);
        state
            .outputs
            .entry((task.to_string(), replica))
            .or_default()
            .push((path.to_string(), hash.to_string()));
        Ok(())
    }

    async fn register_output_file(&self, task: &str, replica: u32, path: &str, hash: &str) -> RemoteResult<()> {
        self.check()?;
        let mut state = state!(self);
        if !state.blobs.contains_key(hash) {
            return Err(RemoteError::Rejected(format!("unknown content {hash} for {path}")));
        }
        state
            .outputs
            .entry((task.to_string(), replica))
            .or_default()
            .push((path.to_string(), hash.to_string()));
        Ok(())
    }

    async fn log(&self, name: &str, content: &str) -> RemoteResult<()> {
        self.check_stream()?;
        state!(self).logs.entry(name.to_string()).or_default().push_str(content);
        Ok(())
    }

    async fn channel_data(&self, channel: &str, rows: &[u8]) -> RemoteResult<()> {
        self.check_stream()?;
        state!(self)
            .channels
            .entry(channel.to_string())
            .or_default()
            .extend_from_slice(rows);
        Ok(())
    }

    async fn stream_internal_file(&self, path: &str, rows: &[u8]) -> RemoteResult<()> {
        self.check_stream()?;
        state!(self)
            .internal_files
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(rows);
        Ok(())
    }

    async fn register_peer(&self, peer: Arc<dyn JobPeer>) -> RemoteResult<()> {
        self.check()?;
        state!(self).peers.push(peer);
        debug!("job peer registered");
        Ok(())
    }
}

#[async_trait]
impl JobConnector for LoopbackAuthority {
    async fn open(&self, job_id: &str, access_token: &str) -> RemoteResult<JobSession> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| RemoteError::Offline("loopback authority dropped".into()))?;
        let document = self.document();
        if document["id"] != job_id || document["access_token"] != access_token {
            return Err(RemoteError::Authentication(format!("invalid access token for job {job_id}")));
        }
        Ok(me.session())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trial_core::{JobConfig, JobStatus};

    fn test_job() -> Job {
        Job::new("job-1", "secret", JobConfig::default())
    }

    #[tokio::test]
    async fn patches_update_document_and_job() {
        let authority = LoopbackAuthority::new(&test_job());
        let mut patches = Map::new();
        patches.insert("status".into(), json!("running"));
        patches.insert("infos.gpu".into(), json!("A100"));
        authority.patch_job(patches).await.unwrap();

        let job = authority.job().await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.infos["gpu"], "A100");
    }

    #[tokio::test]
    async fn switches_gate_calls() {
        let authority = LoopbackAuthority::new(&test_job());
        authority.set_online(false);
        assert!(!authority.is_connected());
        assert!(matches!(JobController::log(&*authority, "x", "y").await, Err(RemoteError::Offline(_))));
        assert!(authority.connect().await.is_err());

        authority.set_online(true);
        authority.connect().await.unwrap();
        authority.set_call_budget(Some(1));
        JobController::log(&*authority, "x", "a").await.unwrap();
        assert!(matches!(JobController::log(&*authority, "x", "b").await, Err(RemoteError::Rejected(_))));

        authority.set_auth_failure(true);
        assert!(authority.connect().await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn connector_checks_token() {
        let authority = LoopbackAuthority::new(&test_job());
        assert!(authority.open("job-1", "secret").await.is_ok());
        assert!(matches!(
            authority.open("job-1", "wrong").await,
            Err(RemoteError::Authentication(_))
        ));
    }
}
