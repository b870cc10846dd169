//! [`ContainerRuntime`] over the Docker Engine API on its unix socket.
//!
//! Every request opens its own connection and drives it in the
//! background, the same way the health probes talk HTTP. Image builds go
//! through the `docker` CLI, which handles the build context upload.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use trial_core::{ContainerSummary, ImageSummary, RuntimeInfo};

use crate::error::{ExecutorError, ExecutorResult};
use crate::runtime::{BuildSpec, ContainerRuntime, ContainerSpec, ContainerStats, ImageInfo, PullEvent};

pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
const API_PREFIX: &str = "/v1.41";

fn runtime_err(e: impl std::fmt::Display) -> ExecutorError {
    ExecutorError::Runtime(e.to_string())
}

fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Split `repo[:tag]` into repo and tag; the tag defaults to `latest`.
pub fn split_image(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

// ── Stream decoding ──────────────────────────────────────────────────

/// Splits the multiplexed stdout/stderr stream of a non-TTY container.
///
/// Frames are `[stream, 0, 0, 0, len_be32]` followed by `len` bytes.
#[derive(Debug, Default)]
pub struct LogDemuxer {
    buf: Vec<u8>,
}

impl LogDemuxer {
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut payloads = Vec::new();
        loop {
            if self.buf.len() < 8 {
                break;
            }
            if self.buf[0] > 2 || self.buf[1..4] != [0, 0, 0] {
                // Not multiplexed (TTY): pass through as is.
                payloads.push(std::mem::take(&mut self.buf));
                break;
            }
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
            if self.buf.len() < 8 + len {
                break;
            }
            payloads.push(self.buf[8..8 + len].to_vec());
            self.buf.drain(..8 + len);
        }
        payloads
    }
}

/// Splits a byte stream into complete lines.
#[derive(Debug, Default)]
struct LineSplitter {
    buf: String,
}

impl LineSplitter {
    fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(data));
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    fn rest(self) -> Option<String> {
        let rest = self.buf.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// Translate one JSON progress line of `POST /images/create`.
pub fn parse_pull_line(line: &Value) -> ExecutorResult<Option<PullEvent>> {
    if let Some(error) = line.get("error").and_then(Value::as_str) {
        return Err(ExecutorError::Runtime(error.to_string()));
    }
    let Some(layer) = line.get("id").and_then(Value::as_str).map(str::to_string) else {
        return Ok(None);
    };
    let detail = |key: &str| line["progressDetail"][key].as_u64().unwrap_or(0);
    let event = match line.get("status").and_then(Value::as_str) {
        Some("Downloading") => PullEvent::Downloading {
            layer,
            current: detail("current"),
            total: detail("total"),
        },
        Some("Extracting") => PullEvent::Extracting {
            layer,
            current: detail("current"),
            total: detail("total"),
        },
        Some("Verifying Checksum") => PullEvent::Verifying { layer },
        Some("Pull complete") | Some("Already exists") => PullEvent::Complete { layer },
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Read one `GET /containers/{id}/stats?stream=false` sample.
pub fn parse_stats(sample: &Value) -> ContainerStats {
    let u = |v: &Value| v.as_u64().unwrap_or(0);
    let cpu = &sample["cpu_stats"];
    let online_cpus = cpu["online_cpus"]
        .as_u64()
        .or_else(|| cpu["cpu_usage"]["percpu_usage"].as_array().map(|a| a.len() as u64))
        .unwrap_or(1) as u32;

    let (mut network_rx, mut network_tx) = (0, 0);
    if let Some(networks) = sample["networks"].as_object() {
        for network in networks.values() {
            network_rx += u(&network["rx_bytes"]);
            network_tx += u(&network["tx_bytes"]);
        }
    }
    let (mut block_read, mut block_write) = (0, 0);
    if let Some(ops) = sample["blkio_stats"]["io_service_bytes_recursive"].as_array() {
        for op in ops {
            match op["op"].as_str().map(str::to_ascii_lowercase).as_deref() {
                Some("read") => block_read += u(&op["value"]),
                Some("write") => block_write += u(&op["value"]),
                _ => {}
            }
        }
    }

    ContainerStats {
        cpu_total_usage: u(&cpu["cpu_usage"]["total_usage"]),
        system_cpu_usage: u(&cpu["system_cpu_usage"]),
        online_cpus,
        memory_usage: u(&sample["memory_stats"]["usage"]),
        memory_limit: u(&sample["memory_stats"]["limit"]),
        network_rx,
        network_tx,
        block_read,
        block_write,
    }
}

fn create_body(spec: &ContainerSpec) -> Value {
    let mounts: Vec<Value> = spec
        .mounts
        .iter()
        .map(|(source, target)| json!({"Type": "bind", "Source": source.to_string_lossy(), "Target": target}))
        .collect();
    let mut host_config = json!({
        "Binds": spec.binds,
        "Mounts": mounts,
        "Memory": spec.memory_bytes,
        "CpuQuota": spec.cpu_quota,
        "CpuPeriod": spec.cpu_period,
    });
    if !spec.gpu_uuids.is_empty() {
        host_config["DeviceRequests"] = json!([{
            "Driver": "nvidia",
            "DeviceIDs": spec.gpu_uuids,
            "Capabilities": [["compute", "utility", "gpu"]],
        }]);
    }
    json!({
        "Image": spec.image,
        "Cmd": spec.command,
        "Env": spec.env,
        "WorkingDir": spec.working_dir,
        "Tty": false,
        "StopTimeout": 1,
        "HostConfig": host_config,
    })
}

// ── Engine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DockerEngine {
    socket: PathBuf,
    cli: String,
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self::new(Path::new(DEFAULT_SOCKET))
    }
}

impl DockerEngine {
    pub fn new(socket: &Path) -> Self {
        Self {
            socket: socket.to_path_buf(),
            cli: "docker".to_string(),
        }
    }

    pub fn with_cli(mut self, cli: &str) -> Self {
        self.cli = cli.to_string();
        self
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> ExecutorResult<http::Response<Incoming>> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|e| ExecutorError::Unavailable(format!("{}: {e}", self.socket.display())))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.map_err(runtime_err)?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "docker connection closed");
            }
        });

        let mut builder = http::Request::builder()
            .method(method)
            .uri(format!("{API_PREFIX}{path}"))
            .header("host", "docker")
            .header("user-agent", concat!("trialgrid/", env!("CARGO_PKG_VERSION")));
        let bytes = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Bytes::from(serde_json::to_vec(&value).map_err(runtime_err)?)
            }
            None => Bytes::new(),
        };
        let request = builder.body(Full::new(bytes)).map_err(runtime_err)?;
        sender.send_request(request).await.map_err(runtime_err)
    }

    async fn read_body(response: http::Response<Incoming>) -> ExecutorResult<Bytes> {
        Ok(response.into_body().collect().await.map_err(runtime_err)?.to_bytes())
    }

    /// Send and read the body, turning non-2xx into an error with the
    /// engine's message.
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> ExecutorResult<Bytes> {
        let response = self.send(method, path, body).await?;
        let status = response.status();
        let bytes = Self::read_body(response).await?;
        if !status.is_success() {
            return Err(Self::engine_error(status, &bytes));
        }
        Ok(bytes)
    }

    async fn call_json(&self, method: Method, path: &str, body: Option<Value>) -> ExecutorResult<Value> {
        let bytes = self.call(method, path, body).await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(runtime_err)
    }

    fn engine_error(status: StatusCode, body: &[u8]) -> ExecutorError {
        let message = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v["message"].as_str().map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
        ExecutorError::Runtime(format!("{status}: {message}"))
    }

    /// Feed every chunk of a streaming response to `f`.
    async fn stream(response: http::Response<Incoming>, mut f: impl FnMut(&[u8]) -> ExecutorResult<()>) -> ExecutorResult<()> {
        let mut body = response.into_body();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(runtime_err)?;
            if let Ok(data) = frame.into_data() {
                f(&data)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerEngine {
    async fn info(&self) -> ExecutorResult<RuntimeInfo> {
        let info = self.call_json(Method::GET, "/info", None).await?;
        Ok(RuntimeInfo {
            ready: true,
            version: info["ServerVersion"].as_str().unwrap_or_default().to_string(),
            os: info["OperatingSystem"].as_str().unwrap_or_default().to_string(),
            cpus: info["NCPU"].as_u64().unwrap_or(0) as u32,
            memory_bytes: info["MemTotal"].as_u64().unwrap_or(0),
            error: None,
        })
    }

    async fn image_exists(&self, image: &str) -> ExecutorResult<bool> {
        let response = self.send(Method::GET, &format!("/images/{image}/json"), None).await?;
        let status = response.status();
        let bytes = Self::read_body(response).await?;
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Self::engine_error(s, &bytes)),
        }
    }

    async fn inspect_image(&self, image: &str) -> ExecutorResult<ImageInfo> {
        let info = self.call_json(Method::GET, &format!("/images/{image}/json"), None).await?;
        let s = |key: &str| info[key].as_str().unwrap_or_default().to_string();
        Ok(ImageInfo {
            id: s("Id"),
            size: info["Size"].as_u64().unwrap_or(0),
            os: s("Os"),
            arch: s("Architecture"),
            created: s("Created"),
            docker_version: s("DockerVersion"),
        })
    }

    async fn pull(&self, image: &str, progress: UnboundedSender<PullEvent>) -> ExecutorResult<()> {
        let (repo, tag) = split_image(image);
        let path = format!("/images/create?fromImage={}&tag={}", encode_query(repo), encode_query(tag));
        let response = self.send(Method::POST, &path, None).await?;
        let status = response.status();
        if !status.is_success() {
            let bytes = Self::read_body(response).await?;
            return Err(Self::engine_error(status, &bytes));
        }

        let mut lines = LineSplitter::default();
        Self::stream(response, |chunk| {
            for line in lines.push(chunk) {
                let Ok(value) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if let Some(event) = parse_pull_line(&value)? {
                    let _ = progress.send(event);
                }
            }
            Ok(())
        })
        .await?;
        debug!(%image, "image pulled");
        Ok(())
    }

    async fn build(&self, spec: &BuildSpec, output: UnboundedSender<String>) -> ExecutorResult<()> {
        let mut args = vec![
            "build".to_string(),
            "-t".to_string(),
            spec.tag.clone(),
            "-f".to_string(),
            spec.dockerfile.clone(),
        ];
        if spec.memory_bytes > 0 {
            args.extend(["--memory".to_string(), spec.memory_bytes.to_string()]);
        }
        if spec.cpu_quota > 0 {
            args.extend([
                "--cpu-quota".to_string(),
                spec.cpu_quota.to_string(),
                "--cpu-period".to_string(),
                spec.cpu_period.to_string(),
            ]);
        }
        args.push(".".to_string());

        let mut child = Command::new(&self.cli)
            .args(&args)
            .current_dir(&spec.context)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Unavailable(format!("{}: {e}", self.cli)))?;

        let forward = |reader: Option<Box<dyn tokio::io::AsyncRead + Send + Unpin>>, output: UnboundedSender<String>| async move {
            let Some(reader) = reader else {
                return;
            };
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = output.send(line);
            }
        };
        let stdout = child.stdout.take().map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Send + Unpin>);
        let stderr = child.stderr.take().map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Send + Unpin>);
        tokio::join!(forward(stdout, output.clone()), forward(stderr, output));

        let status = child.wait().await?;
        if !status.success() {
            return Err(ExecutorError::Runtime(format!(
                "docker build returned a non-zero code: {}",
                status.code().unwrap_or(1)
            )));
        }
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec, output: UnboundedSender<Vec<u8>>) -> ExecutorResult<i64> {
        // A container left over from an earlier attempt would block the name.
        let _ = self.remove(&spec.name).await;

        let created = self
            .call_json(
                Method::POST,
                &format!("/containers/create?name={}", encode_query(&spec.name)),
                Some(create_body(spec)),
            )
            .await?;
        let id = created["Id"]
            .as_str()
            .ok_or_else(|| ExecutorError::Runtime("container create returned no id".into()))?
            .to_string();
        self.call(Method::POST, &format!("/containers/{id}/start"), None).await?;

        let logs = self
            .send(Method::GET, &format!("/containers/{id}/logs?follow=1&stdout=1&stderr=1"), None)
            .await?;
        let mut demux = LogDemuxer::default();
        Self::stream(logs, |chunk| {
            for payload in demux.push(chunk) {
                let _ = output.send(payload);
            }
            Ok(())
        })
        .await?;

        let waited = self.call_json(Method::POST, &format!("/containers/{id}/wait"), None).await?;
        let code = waited["StatusCode"].as_i64().unwrap_or(-1);
        if let Err(e) = self.remove(&id).await {
            warn!(container = %spec.name, error = %e, "failed to remove container");
        }
        Ok(code)
    }

    async fn stop(&self, name: &str, grace: Duration) -> ExecutorResult<()> {
        let response = self
            .send(Method::POST, &format!("/containers/{name}/stop?t={}", grace.as_secs()), None)
            .await?;
        let status = response.status();
        let bytes = Self::read_body(response).await?;
        match status {
            s if s.is_success() || s == StatusCode::NOT_MODIFIED || s == StatusCode::NOT_FOUND => Ok(()),
            s => Err(Self::engine_error(s, &bytes)),
        }
    }

    async fn remove(&self, name: &str) -> ExecutorResult<()> {
        let response = self
            .send(Method::DELETE, &format!("/containers/{name}?force=1&v=1"), None)
            .await?;
        let status = response.status();
        let bytes = Self::read_body(response).await?;
        match status {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            s => Err(Self::engine_error(s, &bytes)),
        }
    }

    async fn stats(&self, name: &str) -> ExecutorResult<Option<ContainerStats>> {
        let response = self
            .send(Method::GET, &format!("/containers/{name}/stats?stream=false"), None)
            .await?;
        let status = response.status();
        let bytes = Self::read_body(response).await?;
        match status {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let sample: Value = serde_json::from_slice(&bytes).map_err(runtime_err)?;
                Ok(Some(parse_stats(&sample)))
            }
            s => Err(Self::engine_error(s, &bytes)),
        }
    }

    async fn list_images(&self) -> ExecutorResult<Vec<ImageSummary>> {
        let images = self.call_json(Method::GET, "/images/json", None).await?;
        Ok(images
            .as_array()
            .map(|list| {
                list.iter()
                    .map(|i| ImageSummary {
                        id: i["Id"].as_str().unwrap_or_default().to_string(),
                        tags: serde_json::from_value(i["RepoTags"].clone()).unwrap_or_default(),
                        size: i["Size"].as_u64().unwrap_or(0),
                        created: i["Created"].as_i64().unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove_image(&self, id: &str) -> ExecutorResult<()> {
        self.call(Method::DELETE, &format!("/images/{id}?force=1"), None).await?;
        Ok(())
    }

    async fn prune_images(&self) -> ExecutorResult<()> {
        self.call(Method::POST, "/images/prune", None).await?;
        Ok(())
    }

    async fn list_containers(&self) -> ExecutorResult<Vec<ContainerSummary>> {
        let containers = self.call_json(Method::GET, "/containers/json?all=1", None).await?;
        Ok(containers
            .as_array()
            .map(|list| {
                list.iter()
                    .map(|c| ContainerSummary {
                        id: c["Id"].as_str().unwrap_or_default().to_string(),
                        names: serde_json::from_value(c["Names"].clone()).unwrap_or_default(),
                        image: c["Image"].as_str().unwrap_or_default().to_string(),
                        state: c["State"].as_str().unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn prune_containers(&self) -> ExecutorResult<()> {
        self.call(Method::POST, "/containers/prune", None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn demuxes_split_frames() {
        let mut data = frame(1, b"hello\n");
        data.extend(frame(2, b"oops\n"));
        let mut demux = LogDemuxer::default();
        assert!(demux.push(&data[..5]).is_empty());
        let payloads = demux.push(&data[5..]);
        assert_eq!(payloads, vec![b"hello\n".to_vec(), b"oops\n".to_vec()]);
    }

    #[test]
    fn tty_output_passes_through() {
        let mut demux = LogDemuxer::default();
        assert_eq!(demux.push(b"plain text output"), vec![b"plain text output".to_vec()]);
    }

    #[test]
    fn image_names_split_on_tag() {
        assert_eq!(split_image("python:3.9"), ("python", "3.9"));
        assert_eq!(split_image("ubuntu"), ("ubuntu", "latest"));
        assert_eq!(split_image("registry:5000/team/img"), ("registry:5000/team/img", "latest"));
        assert_eq!(split_image("registry:5000/img:v2"), ("registry:5000/img", "v2"));
    }

    #[test]
    fn pull_progress_lines() {
        let line = json!({"status": "Downloading", "progressDetail": {"current": 10, "total": 100}, "id": "a1"});
        assert_eq!(
            parse_pull_line(&line).unwrap(),
            Some(PullEvent::Downloading {
                layer: "a1".into(),
                current: 10,
                total: 100
            })
        );
        assert_eq!(parse_pull_line(&json!({"status": "Pulling from library/python"})).unwrap(), None);
        assert!(parse_pull_line(&json!({"error": "manifest unknown"})).is_err());
    }

    #[test]
    fn stats_sample() {
        let sample = json!({
            "cpu_stats": {"cpu_usage": {"total_usage": 400, "percpu_usage": [1, 2]}, "system_cpu_usage": 2000},
            "memory_stats": {"usage": 50, "limit": 100},
            "networks": {"eth0": {"rx_bytes": 5, "tx_bytes": 7}, "eth1": {"rx_bytes": 1, "tx_bytes": 1}},
            "blkio_stats": {"io_service_bytes_recursive": [{"op": "Read", "value": 3}, {"op": "write", "value": 4}]}
        });
        let stats = parse_stats(&sample);
        assert_eq!(stats.online_cpus, 2);
        assert_eq!(stats.network_rx, 6);
        assert_eq!(stats.network_tx, 8);
        assert_eq!((stats.block_read, stats.block_write), (3, 4));
        assert_eq!(stats.memory_limit, 100);
    }

    #[test]
    fn gpu_device_request_only_with_gpus() {
        let mut spec = ContainerSpec {
            name: "c".into(),
            image: "python".into(),
            ..Default::default()
        };
        assert!(create_body(&spec)["HostConfig"].get("DeviceRequests").is_none());
        spec.gpu_uuids = vec!["GPU-1".into()];
        assert_eq!(create_body(&spec)["HostConfig"]["DeviceRequests"][0]["DeviceIDs"][0], "GPU-1");
    }

    #[tokio::test]
    async fn missing_socket_is_unavailable() {
        let engine = DockerEngine::new(Path::new("/nonexistent/docker.sock"));
        assert!(matches!(engine.info().await, Err(ExecutorError::Unavailable(_))));
    }
}
