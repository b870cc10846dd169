//! Node-local work directories.
//!
//! ```text
//!   $TRIALGRID_HOME (default ~/.trialgrid)
//!   └── jobs/<job>/
//!       ├── files/                      checked-out job files
//!       ├── instances/<task>/<replica>/ per-instance working copy
//!       └── ops.redb                    pending patch journal
//! ```

use std::path::{Path, PathBuf};

pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

pub fn trialgrid_home() -> PathBuf {
    match std::env::var_os("TRIALGRID_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => home_dir().join(".trialgrid"),
    }
}

/// Layout of one job's directories under a work root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDirs {
    root: PathBuf,
}

impl JobDirs {
    pub fn new(work_root: &Path, job_id: &str) -> Self {
        Self {
            root: work_root.join("jobs").join(job_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> PathBuf {
        self.root.join("files")
    }

    pub fn instances(&self) -> PathBuf {
        self.root.join("instances")
    }

    pub fn instance(&self, task: &str, replica: u32) -> PathBuf {
        instance_dir(&self.instances(), task, replica)
    }

    pub fn journal(&self) -> PathBuf {
        self.root.join("ops.redb")
    }
}

pub fn instance_dir(instances_root: &Path, task: &str, replica: u32) -> PathBuf {
    instances_root.join(task).join(replica.to_string())
}
