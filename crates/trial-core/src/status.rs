//! Lifecycle statuses for jobs, tasks and task instances.
//!
//! Each status carries a numeric code. Codes grow along the lifecycle, so
//! "has this reached X" is a plain comparison.

use serde::{Deserialize, Serialize};

/// Exit code reported when an instance was aborted.
pub const EXIT_ABORTED: i32 = 8961;
/// Exit code reported when an instance command returned non-zero.
pub const EXIT_FAILED: i32 = 8962;
/// Exit code reported when an instance crashed on an internal error.
pub const EXIT_CRASHED: i32 = 8963;

// ── Job ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Creating,
    Created,
    Queued,
    Running,
    Done,
    Aborted,
    Failed,
    Crashed,
}

impl JobStatus {
    pub fn code(self) -> u32 {
        match self {
            JobStatus::Creating => 0,
            JobStatus::Created => 50,
            JobStatus::Queued => 75,
            JobStatus::Running => 100,
            JobStatus::Done => 150,
            JobStatus::Aborted => 200,
            JobStatus::Failed => 250,
            JobStatus::Crashed => 300,
        }
    }

    pub fn is_ended(self) -> bool {
        self >= JobStatus::Done
    }

    pub fn is_errored(self) -> bool {
        matches!(self, JobStatus::Aborted | JobStatus::Failed | JobStatus::Crashed)
    }
}

// ── Task ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Queued,
    Assigned,
    Started,
    Done,
    Aborted,
    Failed,
    Crashed,
}

impl TaskStatus {
    pub fn code(self) -> u32 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Queued => 100,
            TaskStatus::Assigned => 150,
            TaskStatus::Started => 300,
            TaskStatus::Done => 500,
            TaskStatus::Aborted => 550,
            TaskStatus::Failed => 600,
            TaskStatus::Crashed => 650,
        }
    }

    pub fn is_started(self) -> bool {
        self >= TaskStatus::Started
    }

    pub fn is_ended(self) -> bool {
        self >= TaskStatus::Done
    }

    pub fn is_running(self) -> bool {
        self.is_started() && !self.is_ended()
    }

    pub fn is_errored(self) -> bool {
        matches!(self, TaskStatus::Aborted | TaskStatus::Failed | TaskStatus::Crashed)
    }

    /// The job status a job ends with when this task is the reason.
    pub fn as_job_status(self) -> Option<JobStatus> {
        match self {
            TaskStatus::Done => Some(JobStatus::Done),
            TaskStatus::Aborted => Some(JobStatus::Aborted),
            TaskStatus::Failed => Some(JobStatus::Failed),
            TaskStatus::Crashed => Some(JobStatus::Crashed),
            _ => None,
        }
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Status of one replica of a task.
///
/// Containerized instances pass through the `docker_*` states; host
/// instances go from `checkout_files` straight to `joining_network`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Pending,
    CheckoutFiles,
    DockerPull,
    DockerBuildAwait,
    DockerBuild,
    JoiningNetwork,
    Started,
    Done,
    Aborted,
    Failed,
    Crashed,
}

impl InstanceStatus {
    pub fn code(self) -> u32 {
        match self {
            InstanceStatus::Pending => 0,
            InstanceStatus::CheckoutFiles => 200,
            InstanceStatus::DockerPull => 220,
            InstanceStatus::DockerBuildAwait => 230,
            InstanceStatus::DockerBuild => 235,
            InstanceStatus::JoiningNetwork => 250,
            InstanceStatus::Started => 300,
            InstanceStatus::Done => 500,
            InstanceStatus::Aborted => 550,
            InstanceStatus::Failed => 600,
            InstanceStatus::Crashed => 650,
        }
    }

    pub fn is_started(self) -> bool {
        self > InstanceStatus::Pending
    }

    pub fn is_ended(self) -> bool {
        self >= InstanceStatus::Done
    }

    pub fn is_running(self) -> bool {
        self.is_started() && !self.is_ended()
    }

    pub fn is_errored(self) -> bool {
        matches!(
            self,
            InstanceStatus::Aborted | InstanceStatus::Failed | InstanceStatus::Crashed
        )
    }

    /// Map a terminal instance status onto the task status scale.
    pub fn as_task_status(self) -> Option<TaskStatus> {
        match self {
            InstanceStatus::Done => Some(TaskStatus::Done),
            InstanceStatus::Aborted => Some(TaskStatus::Aborted),
            InstanceStatus::Failed => Some(TaskStatus::Failed),
            InstanceStatus::Crashed => Some(TaskStatus::Crashed),
            _ => None,
        }
    }
}

/// Map an executor exit code onto the terminal status it stands for.
pub fn status_for_exit_code(code: i32) -> InstanceStatus {
    match code {
        0 => InstanceStatus::Done,
        EXIT_ABORTED => InstanceStatus::Aborted,
        EXIT_CRASHED => InstanceStatus::Crashed,
        _ => InstanceStatus::Failed,
    }
}
