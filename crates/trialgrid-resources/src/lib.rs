//! trialgrid-resources: node resource ledger and replica placement.
//!
//! A [`NodeResources`] ledger is never decremented. Every snapshot is
//! rebuilt from host capacity plus the set of active instances with
//! [`compute_resources`], so a finished instance frees its share simply
//! by leaving that set.

pub mod error;
pub mod ledger;
pub mod placement;

pub use error::{ResourceError, ResourceResult};
pub use ledger::{Capacity, FitsStatus, GpuCapacity, HostCapacity, NodeGpu, NodeResources, compute_resources};
pub use placement::{NodeCandidate, NodesFound, find_nodes, is_assignable, rank_candidates};
