//! Runtime records: jobs, their tasks and task instances.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::JobConfig;
use crate::resources::AssignedResources;
use crate::status::{InstanceStatus, JobStatus, TaskStatus};

// ── Instance ──────────────────────────────────────────────────────

/// Snapshot of the machine and process environment an instance ran in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobEnvironment {
    pub hostname: String,
    pub username: String,
    pub platform: String,
    pub release: String,
    pub arch: String,
    pub uptime: u64,
    pub agent_version: String,
    pub python_version: Option<String>,
    /// Resolved task environment variables.
    pub variables: BTreeMap<String, String>,
}

/// Container runtime the instance ran on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerRuntime {
    pub run_on_version: String,
}

/// Metadata of the image an instance ran in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerImage {
    pub name: String,
    pub id: String,
    pub size: u64,
    pub os: String,
    pub arch: String,
    pub created: String,
    pub built_with_docker_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullStatus {
    #[default]
    Waiting,
    Downloading,
    Extracting,
    Verifying,
    Done,
}

/// Progress of one image layer during a pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullStats {
    pub current: u64,
    pub total: u64,
    pub status: PullStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTaskInstance {
    pub id: u32,
    pub status: InstanceStatus,
    pub node: Option<String>,
    pub assigned_resources: AssignedResources,
    pub environment: JobEnvironment,
    pub docker: DockerRuntime,
    pub docker_image: DockerImage,
    pub docker_pull_stats: BTreeMap<String, PullStats>,
    pub exit_code: Option<i32>,
    pub error: String,
    pub started: Option<u64>,
    pub ended: Option<u64>,
}

impl JobTaskInstance {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn is_started(&self) -> bool {
        self.status.is_started()
    }

    pub fn is_ended(&self) -> bool {
        self.status.is_ended()
    }
}

// ── Task ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTask {
    pub name: String,
    pub status: TaskStatus,
    pub assigned: Option<u64>,
    pub started: Option<u64>,
    pub ended: Option<u64>,
    pub exit_code: Option<i32>,
    pub instances: Vec<JobTaskInstance>,
}

impl JobTask {
    pub fn new(name: &str, replicas: u32) -> Self {
        Self {
            name: name.to_string(),
            instances: (0..replicas.max(1)).map(JobTaskInstance::new).collect(),
            ..Default::default()
        }
    }

    pub fn instance(&self, replica: u32) -> Option<&JobTaskInstance> {
        self.instances.get(replica as usize)
    }

    pub fn instance_mut(&mut self, replica: u32) -> Option<&mut JobTaskInstance> {
        self.instances.get_mut(replica as usize)
    }

    pub fn is_started(&self) -> bool {
        self.status.is_started()
    }

    pub fn is_ended(&self) -> bool {
        self.status.is_ended()
    }

    pub fn is_errored(&self) -> bool {
        self.status.is_errored()
    }

    /// Status derived from the instances.
    ///
    /// Precedence is crashed, failed, aborted, still running, done.
    pub fn status_from_instances(&self) -> TaskStatus {
        fn rank(status: TaskStatus) -> u8 {
            match status {
                TaskStatus::Crashed => 4,
                TaskStatus::Failed => 3,
                TaskStatus::Aborted => 2,
                TaskStatus::Done => 0,
                _ => 1,
            }
        }
        self.instances
            .iter()
            .map(|i| i.status.as_task_status().unwrap_or(TaskStatus::Started))
            .max_by_key(|s| rank(*s))
            .unwrap_or(TaskStatus::Done)
    }
}

// ── Channels ──────────────────────────────────────────────────────

/// A user-defined metric series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Channel {
    pub traces: Vec<String>,
    pub xaxis: Value,
    pub yaxis: Value,
    pub layout: Value,
    pub last_value: Vec<f64>,
}

// ── Job ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    pub id: String,
    pub access_token: String,
    pub project: String,
    pub config: JobConfig,
    pub status: JobStatus,
    pub tasks: BTreeMap<String, JobTask>,

    pub title: String,
    pub created: u64,
    pub started: Option<u64>,
    pub ended: Option<u64>,

    pub iteration: u64,
    pub iterations: u64,
    pub step: u64,
    pub steps: u64,
    pub step_label: String,
    pub seconds_per_iteration: f64,
    pub eta: f64,
    pub speed: f64,

    pub infos: BTreeMap<String, Value>,
    pub parameters: BTreeMap<String, Value>,
    pub channels: BTreeMap<String, Channel>,
}

impl Job {
    /// Create a job with one task record per configured task.
    pub fn new(id: &str, access_token: &str, config: JobConfig) -> Self {
        let tasks = config
            .tasks
            .iter()
            .map(|t| (t.name.clone(), JobTask::new(&t.name, t.replicas())))
            .collect();
        Self {
            id: id.to_string(),
            access_token: access_token.to_string(),
            config,
            tasks,
            created: crate::epoch_secs(),
            ..Default::default()
        }
    }

    pub fn task(&self, name: &str) -> Option<&JobTask> {
        self.tasks.get(name)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut JobTask> {
        self.tasks.get_mut(name)
    }

    /// Tasks in configuration order.
    pub fn ordered_tasks(&self) -> impl Iterator<Item = &JobTask> {
        self.config
            .tasks
            .iter()
            .filter_map(|t| self.tasks.get(&t.name))
    }

    pub fn instance(&self, task: &str, replica: u32) -> Option<&JobTaskInstance> {
        self.tasks.get(task).and_then(|t| t.instance(replica))
    }

    pub fn is_ended(&self) -> bool {
        self.status.is_ended()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobTaskConfig;

    fn test_task(statuses: &[InstanceStatus]) -> JobTask {
        let mut task = JobTask::new("train", statuses.len() as u32);
        for (instance, status) in task.instances.iter_mut().zip(statuses) {
            instance.status = *status;
        }
        task
    }

    #[test]
    fn replicas_create_instances() {
        let mut config = JobConfig::default();
        let mut task = JobTaskConfig::named("train");
        task.replicas = 3;
        config.tasks.push(task);

        let job = Job::new("job-1", "token", config);
        assert_eq!(job.task("train").unwrap().instances.len(), 3);
        assert_eq!(job.instance("train", 2).unwrap().id, 2);
    }

    #[test]
    fn status_from_instances_precedence() {
        use InstanceStatus::*;
        assert_eq!(test_task(&[Done, Done]).status_from_instances(), TaskStatus::Done);
        assert_eq!(test_task(&[Done, Aborted]).status_from_instances(), TaskStatus::Aborted);
        assert_eq!(test_task(&[Aborted, Failed]).status_from_instances(), TaskStatus::Failed);
        assert_eq!(test_task(&[Crashed, Aborted]).status_from_instances(), TaskStatus::Crashed);
        assert_eq!(test_task(&[Done, Started]).status_from_instances(), TaskStatus::Started);
    }
}
