//! Host hardware facts and utilization.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::gpu::GpuInfo;

const GB: f64 = 1_000_000_000.0;

/// Static facts about the machine, used for instance environment snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostFacts {
    pub hostname: String,
    pub platform: String,
    pub release: String,
    pub arch: String,
    pub os: String,
    pub uptime: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuDescription {
    pub name: String,
    /// MHz
    pub speed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuDescription {
    pub index: u32,
    pub uuid: String,
    pub name: String,
    pub memory: f64,
    pub clock_max: f64,
    pub power_limit: f64,
}

/// Hardware inventory reported once per connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareInformation {
    pub os_description: String,
    pub cpu_description: String,
    pub platform: String,
    pub cpus: Vec<CpuDescription>,
    /// GB
    pub memory_total: f64,
    pub gpus: Vec<GpuDescription>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuStats {
    pub uuid: String,
    pub utilization: f64,
    pub memory: f64,
    pub temperature: f64,
    pub power_draw: f64,
    pub clock: f64,
}

/// Utilization snapshot streamed while connected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareStats {
    pub uptime: u64,
    /// GB in use.
    pub memory_usage: f64,
    /// Per-core utilization, 0..=1
    pub cpus: Vec<f32>,
    pub gpus: Vec<GpuStats>,
}

/// Source of host hardware facts.
pub trait HostProbe: Send + Sync {
    fn cpu_count(&self) -> u32;
    /// Whole gigabytes of physical memory.
    fn total_memory_gb(&self) -> u32;
    fn facts(&self) -> HostFacts;
    fn hardware_information(&self, gpus: &[GpuInfo]) -> HardwareInformation;
    fn stats(&self, gpus: &[GpuInfo]) -> HardwareStats;
}

/// [`HostProbe`] backed by `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_all();
        Self {
            system: Mutex::new(system),
        }
    }

    fn with_system<R>(&self, f: impl FnOnce(&mut System) -> R) -> R {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut system)
    }
}

impl HostProbe for SysinfoProbe {
    fn cpu_count(&self) -> u32 {
        self.with_system(|s| s.cpus().len().max(1) as u32)
    }

    fn total_memory_gb(&self) -> u32 {
        self.with_system(|s| {
            s.refresh_memory();
            (s.total_memory() as f64 / GB).floor() as u32
        })
    }

    fn facts(&self) -> HostFacts {
        HostFacts {
            hostname: System::host_name().unwrap_or_default(),
            platform: std::env::consts::OS.to_string(),
            release: System::kernel_version().unwrap_or_default(),
            arch: std::env::consts::ARCH.to_string(),
            os: System::long_os_version().unwrap_or_default(),
            uptime: System::uptime(),
        }
    }

    fn hardware_information(&self, gpus: &[GpuInfo]) -> HardwareInformation {
        self.with_system(|s| {
            s.refresh_memory();
            let cpus: Vec<CpuDescription> = s
                .cpus()
                .iter()
                .map(|c| CpuDescription {
                    name: c.brand().to_string(),
                    speed: c.frequency(),
                })
                .collect();
            HardwareInformation {
                os_description: System::long_os_version().unwrap_or_default(),
                cpu_description: cpus.first().map(|c| c.name.clone()).unwrap_or_default(),
                platform: std::env::consts::OS.to_string(),
                cpus,
                memory_total: s.total_memory() as f64 / GB,
                gpus: gpus
                    .iter()
                    .map(|g| GpuDescription {
                        index: g.index,
                        uuid: g.uuid.clone(),
                        name: g.name.clone(),
                        memory: g.memory_total,
                        clock_max: g.clock_max,
                        power_limit: g.power_limit,
                    })
                    .collect(),
            }
        })
    }

    fn stats(&self, gpus: &[GpuInfo]) -> HardwareStats {
        self.with_system(|s| {
            s.refresh_cpu_usage();
            s.refresh_memory();
            HardwareStats {
                uptime: System::uptime(),
                memory_usage: s.used_memory() as f64 / GB,
                cpus: s.cpus().iter().map(|c| c.cpu_usage() / 100.0).collect(),
                gpus: gpus
                    .iter()
                    .map(|g| GpuStats {
                        uuid: g.uuid.clone(),
                        utilization: g.utilization,
                        memory: g.memory_ratio(),
                        temperature: g.temperature,
                        power_draw: g.power_draw,
                        clock: g.clock,
                    })
                    .collect(),
            }
        })
    }
}
