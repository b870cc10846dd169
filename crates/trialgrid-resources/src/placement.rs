//! Replica placement across nodes.
//!
//! Candidates are ranked bin-packing first: the node that ends up most
//! utilized after taking a replica is preferred, so large nodes stay free
//! for large requests. Each replica then goes to the best candidate that
//! currently fits.

use serde::{Deserialize, Serialize};
use tracing::debug;
use trial_core::{AssignedResources, JobResources};

use crate::ledger::{FitsStatus, NodeResources};

/// A node offered for placement.
#[derive(Debug, Clone)]
pub struct NodeCandidate {
    pub node_id: String,
    pub resources: NodeResources,
}

/// Result of placing all replicas of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodesFound {
    pub status: FitsStatus,
    /// `(node_id, resources)` per placed replica, in replica order.
    pub assignments: Vec<(String, AssignedResources)>,
}

/// Projected CPU utilization of a node after it takes `req`.
fn packing_score(resources: &NodeResources, req: &JobResources) -> f64 {
    if resources.cpu.total == 0 {
        return 0.0;
    }
    let projected = resources.cpu.reserved + req.min_cpu().min(resources.cpu.free());
    projected as f64 / resources.cpu.total as f64
}

/// Order candidate indexes best first.
pub fn rank_candidates(nodes: &[NodeCandidate], req: &JobResources) -> Vec<usize> {
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by(|a, b| {
        let sa = packing_score(&nodes[*a].resources, req);
        let sb = packing_score(&nodes[*b].resources, req);
        sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

/// Place `replicas` on the given nodes as they are now.
pub fn find_nodes(nodes: &[NodeCandidate], replicas: u32, req: &JobResources) -> NodesFound {
    let mut working: Vec<NodeCandidate> = nodes.to_vec();
    let mut assignments = Vec::new();

    for replica in 0..replicas {
        let order = rank_candidates(&working, req);
        let placed = order.into_iter().find_map(|i| {
            let node = &mut working[i];
            if node.resources.requirement_fits(req) != FitsStatus::Fits {
                return None;
            }
            node.resources
                .consume(req)
                .ok()
                .map(|assigned| (node.node_id.clone(), assigned))
        });
        match placed {
            Some((node_id, assigned)) => {
                debug!(replica, node = %node_id, cpu = assigned.cpu, "replica placed");
                assignments.push((node_id, assigned));
            }
            None => break,
        }
    }

    let status = if assignments.len() == replicas as usize {
        FitsStatus::Fits
    } else if is_assignable(nodes, replicas, req) {
        FitsStatus::NotFree
    } else {
        FitsStatus::NeverFits
    };
    if status != FitsStatus::Fits {
        assignments.clear();
    }
    NodesFound {
        status,
        assignments,
    }
}

/// Whether `replicas` could be placed if every node were idle.
pub fn is_assignable(nodes: &[NodeCandidate], replicas: u32, req: &JobResources) -> bool {
    let idle: Vec<NodeCandidate> = nodes
        .iter()
        .map(|n| NodeCandidate {
            node_id: n.node_id.clone(),
            resources: n.resources.unreserved(),
        })
        .collect();
    let mut working = idle;
    for _ in 0..replicas {
        let placed = working
            .iter_mut()
            .any(|n| n.resources.requirement_fits(req) == FitsStatus::Fits && n.resources.consume(req).is_ok());
        if !placed {
            return false;
        }
    }
    true
}
