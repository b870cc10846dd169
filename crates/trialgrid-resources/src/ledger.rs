//! Per-node resource ledger.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;
use trial_core::{AssignedGpu, AssignedResources, AssignedTaskInstance, JobResources};

use crate::error::{ResourceError, ResourceResult};

/// Hardware a node offers before anything is reserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub cpu: u32,
    /// Memory in GB.
    pub memory: u32,
    pub gpus: Vec<GpuCapacity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuCapacity {
    pub index: u32,
    pub name: String,
    /// Memory in GB.
    pub memory: f64,
}

/// Reserved amount out of a total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub reserved: u32,
    pub total: u32,
}

impl Capacity {
    pub fn new(total: u32) -> Self {
        Self { reserved: 0, total }
    }

    pub fn free(&self) -> u32 {
        self.total.saturating_sub(self.reserved)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGpu {
    pub index: u32,
    pub name: String,
    pub memory: f64,
    pub reserved: bool,
}

/// Whether a resource request can be placed on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitsStatus {
    /// Fits into what is free right now.
    Fits,
    /// Would fit an idle node, but not with the current reservations.
    NotFree,
    /// Exceeds the node's totals.
    NeverFits,
}

/// Resources of one node and the instances holding reservations on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    pub cpu: Capacity,
    pub memory: Capacity,
    pub gpus: Vec<NodeGpu>,
    /// Reservations keyed `<jobId>.<instance>.<taskName>`.
    pub assigned: BTreeMap<String, AssignedTaskInstance>,
}

/// Rebuild a node's ledger from its capacity and the active instances.
pub fn compute_resources<'a>(
    capacity: &HostCapacity,
    active: impl IntoIterator<Item = &'a AssignedTaskInstance>,
) -> NodeResources {
    let mut resources = NodeResources::from_capacity(capacity);
    for assigned in active {
        if let Err(e) = resources.reserve_assignment(assigned) {
            warn!(error = %e, "skipping reservation");
        }
    }
    resources
}

impl NodeResources {
    pub fn from_capacity(capacity: &HostCapacity) -> Self {
        Self {
            cpu: Capacity::new(capacity.cpu),
            memory: Capacity::new(capacity.memory),
            gpus: capacity
                .gpus
                .iter()
                .map(|g| NodeGpu {
                    index: g.index,
                    name: g.name.clone(),
                    memory: g.memory,
                    reserved: false,
                })
                .collect(),
            assigned: BTreeMap::new(),
        }
    }

    /// Record an instance's assigned resources as reserved.
    pub fn reserve_assignment(&mut self, assigned: &AssignedTaskInstance) -> ResourceResult<()> {
        let key = assigned.key();
        if self.assigned.contains_key(&key) {
            return Err(ResourceError::AlreadyReserved(key));
        }
        let res = &assigned.assigned_resources;
        self.cpu.reserved += res.cpu;
        self.memory.reserved += res.memory;
        for gpu in &res.gpus {
            match self.gpus.iter_mut().find(|g| g.index == gpu.index) {
                Some(node_gpu) => node_gpu.reserved = true,
                None => warn!(index = gpu.index, %key, "assigned GPU not present on node"),
            }
        }
        self.assigned.insert(key, assigned.clone());
        Ok(())
    }

    pub fn clear_reservations(&mut self) {
        self.cpu.reserved = 0;
        self.memory.reserved = 0;
        for gpu in &mut self.gpus {
            gpu.reserved = false;
        }
        self.assigned.clear();
    }

    /// A copy with every reservation removed.
    pub fn unreserved(&self) -> Self {
        let mut copy = self.clone();
        copy.clear_reservations();
        copy
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn has_cpu(&self, cores: u32) -> bool {
        self.cpu.total >= cores
    }

    pub fn has_free_cpu(&self, cores: u32) -> bool {
        self.cpu.free() >= cores
    }

    pub fn has_memory(&self, gb: u32) -> bool {
        self.memory.total >= gb
    }

    pub fn has_free_memory(&self, gb: u32) -> bool {
        self.memory.free() >= gb
    }

    pub fn has_gpu(&self, count: u32, min_memory: f64) -> bool {
        self.gpus.iter().filter(|g| g.memory >= min_memory).count() >= count as usize
    }

    pub fn has_free_gpu(&self, count: u32, min_memory: f64) -> bool {
        self.free_gpus(min_memory).count() >= count as usize
    }

    fn free_gpus(&self, min_memory: f64) -> impl Iterator<Item = &NodeGpu> {
        self.gpus
            .iter()
            .filter(move |g| !g.reserved && g.memory >= min_memory)
    }

    pub fn requirement_fits(&self, req: &JobResources) -> FitsStatus {
        if !self.has_cpu(req.min_cpu())
            || !self.has_memory(req.min_memory())
            || !self.has_gpu(req.min_gpu(), req.min_gpu_memory)
        {
            return FitsStatus::NeverFits;
        }
        if !self.has_free_cpu(req.min_cpu())
            || !self.has_free_memory(req.min_memory())
            || !self.has_free_gpu(req.min_gpu(), req.min_gpu_memory)
        {
            return FitsStatus::NotFree;
        }
        FitsStatus::Fits
    }

    // ── Consumption ───────────────────────────────────────────────

    /// Take resources for one instance out of what is free.
    ///
    /// Min/max ranges are filled greedily up to the free amount. Nothing
    /// is changed when any part of the request cannot be met.
    pub fn consume(&mut self, req: &JobResources) -> ResourceResult<AssignedResources> {
        let cpu = take_range("cpu", req.min_cpu(), req.max_cpu(), self.cpu.free())?;
        let memory = if req.all_memory {
            take_range("memory", req.min_memory(), self.memory.free(), self.memory.free())?
        } else {
            take_range("memory", req.min_memory(), req.max_memory(), self.memory.free())?
        };

        let free_gpus = self.free_gpus(req.min_gpu_memory).count() as u32;
        let gpu_count = take_range("gpu", req.min_gpu(), req.max_gpu(), free_gpus)?;
        let picked: Vec<u32> = self
            .free_gpus(req.min_gpu_memory)
            .take(gpu_count as usize)
            .map(|g| g.index)
            .collect();

        let mut gpus = Vec::with_capacity(picked.len());
        for gpu in self.gpus.iter_mut().filter(|g| picked.contains(&g.index)) {
            gpu.reserved = true;
            gpus.push(AssignedGpu {
                index: gpu.index,
                name: gpu.name.clone(),
                memory: gpu.memory,
            });
        }
        self.cpu.reserved += cpu;
        self.memory.reserved += memory;

        Ok(AssignedResources { cpu, memory, gpus })
    }
}

fn take_range(kind: &'static str, min: u32, max: u32, free: u32) -> ResourceResult<u32> {
    if free < min {
        return Err(ResourceError::Insufficient {
            kind,
            requested: min,
            free,
        });
    }
    Ok(max.max(min).min(free))
}
