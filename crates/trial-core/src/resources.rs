//! Resource requests, assignments and node start policy.

use serde::{Deserialize, Serialize};

/// Hardware a task asks for, per replica.
///
/// Exact values (`cpu`, `memory`, `gpu`) win over the min/max pairs.
/// Memory is in whole gigabytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobResources {
    #[serde(alias = "min_cpu")]
    pub min_cpu: u32,
    #[serde(alias = "max_cpu")]
    pub max_cpu: u32,
    pub cpu: u32,

    /// Reserve every free gigabyte of memory on the node.
    #[serde(alias = "all_memory")]
    pub all_memory: bool,
    #[serde(alias = "min_memory")]
    pub min_memory: u32,
    #[serde(alias = "max_memory")]
    pub max_memory: u32,
    pub memory: u32,

    #[serde(alias = "min_gpu")]
    pub min_gpu: u32,
    #[serde(alias = "max_gpu")]
    pub max_gpu: u32,
    pub gpu: u32,
    /// Minimum memory (GB) each assigned GPU must have.
    #[serde(alias = "min_gpu_memory")]
    pub min_gpu_memory: f64,
}

impl JobResources {
    pub fn min_cpu(&self) -> u32 {
        at_least(if self.min_cpu > 0 { self.min_cpu } else { self.cpu }, 1)
    }

    pub fn max_cpu(&self) -> u32 {
        at_least(if self.max_cpu > 0 { self.max_cpu } else { self.cpu }, 1)
    }

    pub fn min_memory(&self) -> u32 {
        at_least(if self.min_memory > 0 { self.min_memory } else { self.memory }, 1)
    }

    pub fn max_memory(&self) -> u32 {
        at_least(if self.max_memory > 0 { self.max_memory } else { self.memory }, 1)
    }

    pub fn min_gpu(&self) -> u32 {
        if self.min_gpu > 0 { self.min_gpu } else { self.gpu }
    }

    pub fn max_gpu(&self) -> u32 {
        if self.max_gpu > 0 { self.max_gpu } else { self.gpu }
    }

    /// Clamp values that came from loosely typed sources.
    pub fn normalize(&mut self) {
        if !self.min_gpu_memory.is_finite() || self.min_gpu_memory < 0.0 {
            self.min_gpu_memory = 0.0;
        }
    }
}

fn at_least(value: u32, floor: u32) -> u32 {
    value.max(floor)
}

/// One GPU handed to an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedGpu {
    pub index: u32,
    pub name: String,
    /// Memory in GB.
    pub memory: f64,
}

/// What the ledger actually reserved for an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignedResources {
    pub cpu: u32,
    /// Memory in GB.
    pub memory: u32,
    pub gpus: Vec<AssignedGpu>,
}

impl AssignedResources {
    pub fn gpu_indexes(&self) -> Vec<u32> {
        self.gpus.iter().map(|g| g.index).collect()
    }
}

/// A task instance the authority assigned to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedTaskInstance {
    pub job_id: String,
    pub job_access_token: String,
    pub task_name: String,
    pub instance: u32,
    pub assigned_resources: AssignedResources,
}

impl AssignedTaskInstance {
    /// Key in the node's active-instance map: `<jobId>.<instance>.<taskName>`.
    pub fn key(&self) -> String {
        instance_key(&self.job_id, self.instance, &self.task_name)
    }
}

pub fn instance_key(job_id: &str, instance: u32, task_name: &str) -> String {
    format!("{job_id}.{instance}.{task_name}")
}

/// Node-level rules for starting task instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartPolicy {
    /// `NAME=VALUE` entries added to every container.
    pub env: Vec<String>,
    /// `host:container[:mode]` binds added to every container.
    pub docker_binds: Vec<String>,
    pub host_execution_allowed: bool,
    /// Whether tasks may bring their own docker binds.
    pub custom_mounts_allowed: bool,
}

impl StartPolicy {
    /// Policy for jobs started from the local command line.
    pub fn local() -> Self {
        Self {
            env: Vec::new(),
            docker_binds: Vec::new(),
            host_execution_allowed: true,
            custom_mounts_allowed: true,
        }
    }
}
