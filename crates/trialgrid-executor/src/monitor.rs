//! Per-instance hardware usage sampling while a container runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;
use trial_core::epoch_secs_f64;
use trialgrid_metrics::{CpuUsageTracker, GpuReader, GpuSample, HardwareSample, encode_hardware_row};
use trialgrid_sync::JobStorage;

use crate::error::ExecutorResult;
use crate::runtime::ContainerRuntime;

pub fn hardware_file(task: &str, replica: u32) -> String {
    format!(".trialgrid/hardware/{task}_{replica}.hardware")
}

/// Samples one container and streams hardware rows for it.
pub struct LiveMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    gpus: GpuReader,
    storage: Arc<JobStorage>,
    container: String,
    path: String,
    assigned_cpus: u32,
    gpu_indexes: Vec<u32>,
    cpu: CpuUsageTracker,
}

impl LiveMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        gpus: GpuReader,
        storage: Arc<JobStorage>,
        container: &str,
        task: &str,
        replica: u32,
        assigned_cpus: u32,
        gpu_indexes: Vec<u32>,
    ) -> Self {
        Self {
            runtime,
            gpus,
            storage,
            container: container.to_string(),
            path: hardware_file(task, replica),
            assigned_cpus,
            gpu_indexes,
            cpu: CpuUsageTracker::new(),
        }
    }

    /// One sample, or `None` while the container does not exist.
    pub async fn sample(&mut self) -> ExecutorResult<Option<HardwareSample>> {
        let Some(stats) = self.runtime.stats(&self.container).await? else {
            return Ok(None);
        };
        let cpu = self.cpu.update(
            stats.cpu_total_usage,
            stats.system_cpu_usage,
            stats.online_cpus,
            self.assigned_cpus,
        );
        let memory = if stats.memory_limit > 0 {
            stats.memory_usage as f64 / stats.memory_limit as f64
        } else {
            0.0
        };
        let gpus = if self.gpu_indexes.is_empty() {
            Vec::new()
        } else {
            self.gpus
                .read_indexes(&self.gpu_indexes)
                .await
                .iter()
                .map(|g| GpuSample {
                    utilization: g.utilization,
                    memory: g.memory_ratio(),
                    temperature: g.temperature,
                    power: g.power_draw,
                })
                .collect()
        };
        Ok(Some(HardwareSample {
            time: epoch_secs_f64(),
            cpu,
            memory,
            network_rx: stats.network_rx as f64,
            network_tx: stats.network_tx as f64,
            block_write: stats.block_write as f64,
            block_read: stats.block_read as f64,
            gpus,
        }))
    }

    /// Sample every `interval` until `shutdown` flips.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.sample().await {
                        Ok(Some(sample)) => {
                            self.storage.stream_internal_file(&self.path, encode_hardware_row(&sample));
                        }
                        Ok(None) => {}
                        Err(e) => debug!(container = %self.container, error = %e, "stats sample failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(container = %self.container, "monitor stopped");
    }
}
