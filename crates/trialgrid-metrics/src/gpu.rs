//! NVIDIA GPU inventory and telemetry via `nvidia-smi`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

const QUERY_FIELDS: &str = "index,uuid,name,memory.total,memory.used,utilization.gpu,temperature.gpu,power.draw,power.limit,clocks.sm,clocks.max.sm";

/// One GPU as reported by the driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub uuid: String,
    pub name: String,
    /// GB
    pub memory_total: f64,
    /// GB
    pub memory_used: f64,
    /// 0..=1
    pub utilization: f64,
    pub temperature: f64,
    pub power_draw: f64,
    pub power_limit: f64,
    pub clock: f64,
    pub clock_max: f64,
}

impl GpuInfo {
    pub fn memory_ratio(&self) -> f64 {
        if self.memory_total > 0.0 {
            self.memory_used / self.memory_total
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NvidiaVersions {
    pub driver: String,
    pub cuda: Option<String>,
}

/// Parse `--format=csv,noheader,nounits` output of the GPU query.
///
/// Lines that do not carry every field are skipped; `[N/A]` values read
/// as zero.
pub fn parse_gpu_query(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split(',').map(str::trim).collect();
            if cols.len() < 11 {
                return None;
            }
            let num = |i: usize| cols[i].parse::<f64>().unwrap_or(0.0);
            Some(GpuInfo {
                index: cols[0].parse().ok()?,
                uuid: cols[1].to_string(),
                name: cols[2].to_string(),
                memory_total: num(3) / 1024.0,
                memory_used: num(4) / 1024.0,
                utilization: num(5) / 100.0,
                temperature: num(6),
                power_draw: num(7),
                power_limit: num(8),
                clock: num(9),
                clock_max: num(10),
            })
        })
        .collect()
}

fn parse_cuda_version(banner: &str) -> Option<String> {
    let rest = &banner[banner.find("CUDA Version:")? + "CUDA Version:".len()..];
    rest.split_whitespace().next().map(str::to_string)
}

/// Reads GPU state by shelling out to `nvidia-smi`.
///
/// Every failure (binary missing, no driver, timeout) reads as "no GPUs".
#[derive(Debug, Clone)]
pub struct GpuReader {
    binary: String,
    timeout: Duration,
}

impl Default for GpuReader {
    fn default() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl GpuReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_string();
        self
    }

    async fn run(&self, args: &[&str]) -> Option<String> {
        let output = tokio::time::timeout(self.timeout, Command::new(&self.binary).args(args).output()).await;
        match output {
            Ok(Ok(out)) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
            Ok(Ok(out)) => {
                debug!(binary = %self.binary, code = ?out.status.code(), "gpu query failed");
                None
            }
            Ok(Err(e)) => {
                debug!(binary = %self.binary, error = %e, "gpu query unavailable");
                None
            }
            Err(_) => {
                debug!(binary = %self.binary, "gpu query timed out");
                None
            }
        }
    }

    pub async fn read(&self) -> Vec<GpuInfo> {
        let query = format!("--query-gpu={QUERY_FIELDS}");
        match self.run(&[&query, "--format=csv,noheader,nounits"]).await {
            Some(out) => parse_gpu_query(&out),
            None => Vec::new(),
        }
    }

    /// GPUs with the given indexes, in the order asked for.
    pub async fn read_indexes(&self, indexes: &[u32]) -> Vec<GpuInfo> {
        let all = self.read().await;
        indexes
            .iter()
            .filter_map(|i| all.iter().find(|g| g.index == *i).cloned())
            .collect()
    }

    pub async fn uuids_for_indexes(&self, indexes: &[u32]) -> Vec<String> {
        self.read_indexes(indexes)
            .await
            .into_iter()
            .map(|g| g.uuid)
            .collect()
    }

    pub async fn versions(&self) -> Option<NvidiaVersions> {
        let driver = self
            .run(&["--query-gpu=driver_version", "--format=csv,noheader"])
            .await?
            .lines()
            .next()?
            .trim()
            .to_string();
        let cuda = self.run(&[]).await.as_deref().and_then(parse_cuda_version);
        Some(NvidiaVersions { driver, cuda })
    }
}
