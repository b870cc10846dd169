//! Types a node reports to, or receives from, the authority.

use serde::{Deserialize, Serialize};

/// State of the local container runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeInfo {
    /// Whether containers can be started.
    pub ready: bool,
    pub version: String,
    pub os: String,
    pub cpus: u32,
    pub memory_bytes: u64,
    pub error: Option<String>,
}

impl RuntimeInfo {
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSummary {
    pub id: String,
    pub tags: Vec<String>,
    pub size: u64,
    pub created: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
}

/// Another node (or the authority itself) to measure latency to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    /// `host:port`
    pub address: String,
}

/// A file checked in with a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFile {
    pub path: String,
    pub hash: String,
    pub size: u64,
}
