//! Typed writes to a [`Job`], each mapping to one dot-path patch.

use serde::Serialize;
use serde_json::Value;
use trial_core::{
    AssignedResources, Channel, DockerImage, DockerRuntime, InstanceStatus, Job, JobEnvironment, JobStatus,
    JobTaskInstance, PullStats, TaskStatus,
};

use crate::error::{SyncError, SyncResult};
use crate::patch::set_path;

/// A write that can be applied locally and mirrored remotely.
pub trait Patch {
    fn path(&self) -> String;
    fn value(&self) -> Value;
    fn apply(&self, job: &mut Job) -> SyncResult<()>;
}

fn to_value<T: Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

// ── Job ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum JobPatch {
    Status(JobStatus),
    Title(String),
    Started(u64),
    Ended(u64),
    Iteration(u64),
    Iterations(u64),
    Step(u64),
    Steps(u64),
    StepLabel(String),
    SecondsPerIteration(f64),
    Eta(f64),
    Speed(f64),
    Info { name: String, value: Value },
    /// `path` may be dotted; nested objects are created.
    Parameter { path: String, value: Value },
    Channel { name: String, channel: Channel },
    ChannelLastValue { name: String, values: Vec<f64> },
}

impl Patch for JobPatch {
    fn path(&self) -> String {
        match self {
            JobPatch::Status(_) => "status".into(),
            JobPatch::Title(_) => "title".into(),
            JobPatch::Started(_) => "started".into(),
            JobPatch::Ended(_) => "ended".into(),
            JobPatch::Iteration(_) => "iteration".into(),
            JobPatch::Iterations(_) => "iterations".into(),
            JobPatch::Step(_) => "step".into(),
            JobPatch::Steps(_) => "steps".into(),
            JobPatch::StepLabel(_) => "step_label".into(),
            JobPatch::SecondsPerIteration(_) => "seconds_per_iteration".into(),
            JobPatch::Eta(_) => "eta".into(),
            JobPatch::Speed(_) => "speed".into(),
            JobPatch::Info { name, .. } => format!("infos.{name}"),
            JobPatch::Parameter { path, .. } => format!("parameters.{path}"),
            JobPatch::Channel { name, .. } => format!("channels.{name}"),
            JobPatch::ChannelLastValue { name, .. } => format!("channels.{name}.last_value"),
        }
    }

    fn value(&self) -> Value {
        match self {
            JobPatch::Status(s) => to_value(s),
            JobPatch::Title(s) | JobPatch::StepLabel(s) => Value::from(s.as_str()),
            JobPatch::Started(t) | JobPatch::Ended(t) => Value::from(*t),
            JobPatch::Iteration(n) | JobPatch::Iterations(n) | JobPatch::Step(n) | JobPatch::Steps(n) => {
                Value::from(*n)
            }
            JobPatch::SecondsPerIteration(v) | JobPatch::Eta(v) | JobPatch::Speed(v) => to_value(v),
            JobPatch::Info { value, .. } | JobPatch::Parameter { value, .. } => value.clone(),
            JobPatch::Channel { channel, .. } => to_value(channel),
            JobPatch::ChannelLastValue { values, .. } => to_value(values),
        }
    }

    fn apply(&self, job: &mut Job) -> SyncResult<()> {
        match self {
            JobPatch::Status(s) => job.status = *s,
            JobPatch::Title(s) => job.title = s.clone(),
            JobPatch::Started(t) => job.started = Some(*t),
            JobPatch::Ended(t) => job.ended = Some(*t),
            JobPatch::Iteration(n) => job.iteration = *n,
            JobPatch::Iterations(n) => job.iterations = *n,
            JobPatch::Step(n) => job.step = *n,
            JobPatch::Steps(n) => job.steps = *n,
            JobPatch::StepLabel(s) => job.step_label = s.clone(),
            JobPatch::SecondsPerIteration(v) => job.seconds_per_iteration = *v,
            JobPatch::Eta(v) => job.eta = *v,
            JobPatch::Speed(v) => job.speed = *v,
            JobPatch::Info { name, value } => {
                job.infos.insert(name.clone(), value.clone());
            }
            JobPatch::Parameter { path, value } => {
                let (head, rest) = path.split_once('.').unwrap_or((path.as_str(), ""));
                let entry = job.parameters.entry(head.to_string()).or_insert(Value::Null);
                set_path(entry, rest, value.clone());
            }
            JobPatch::Channel { name, channel } => {
                job.channels.insert(name.clone(), channel.clone());
            }
            JobPatch::ChannelLastValue { name, values } => {
                job.channels
                    .get_mut(name)
                    .ok_or_else(|| SyncError::ChannelNotFound(name.clone()))?
                    .last_value = values.clone();
            }
        }
        Ok(())
    }
}

// ── Task ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum TaskChange {
    Status(TaskStatus),
    Assigned(u64),
    Started(u64),
    Ended(u64),
    ExitCode(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskPatch {
    pub task: String,
    pub change: TaskChange,
}

impl TaskPatch {
    pub fn new(task: &str, change: TaskChange) -> Self {
        Self {
            task: task.to_string(),
            change,
        }
    }
}

impl Patch for TaskPatch {
    fn path(&self) -> String {
        let field = match self.change {
            TaskChange::Status(_) => "status",
            TaskChange::Assigned(_) => "assigned",
            TaskChange::Started(_) => "started",
            TaskChange::Ended(_) => "ended",
            TaskChange::ExitCode(_) => "exit_code",
        };
        format!("tasks.{}.{field}", self.task)
    }

    fn value(&self) -> Value {
        match &self.change {
            TaskChange::Status(s) => to_value(s),
            TaskChange::Assigned(t) | TaskChange::Started(t) | TaskChange::Ended(t) => Value::from(*t),
            TaskChange::ExitCode(c) => Value::from(*c),
        }
    }

    fn apply(&self, job: &mut Job) -> SyncResult<()> {
        let task = job
            .task_mut(&self.task)
            .ok_or_else(|| SyncError::TaskNotFound(self.task.clone()))?;
        match &self.change {
            TaskChange::Status(s) => task.status = *s,
            TaskChange::Assigned(t) => task.assigned = Some(*t),
            TaskChange::Started(t) => task.started = Some(*t),
            TaskChange::Ended(t) => task.ended = Some(*t),
            TaskChange::ExitCode(c) => task.exit_code = Some(*c),
        }
        Ok(())
    }
}

// ── Instance ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceChange {
    Status(InstanceStatus),
    Node(String),
    AssignedResources(AssignedResources),
    Environment(JobEnvironment),
    Docker(DockerRuntime),
    DockerImage(DockerImage),
    PullStats(std::collections::BTreeMap<String, PullStats>),
    ExitCode(i32),
    Error(String),
    Started(u64),
    Ended(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstancePatch {
    pub task: String,
    pub replica: u32,
    pub change: InstanceChange,
}

impl InstancePatch {
    pub fn new(task: &str, replica: u32, change: InstanceChange) -> Self {
        Self {
            task: task.to_string(),
            replica,
            change,
        }
    }

    fn target<'a>(&self, job: &'a mut Job) -> SyncResult<&'a mut JobTaskInstance> {
        job.task_mut(&self.task)
            .ok_or_else(|| SyncError::TaskNotFound(self.task.clone()))?
            .instance_mut(self.replica)
            .ok_or_else(|| SyncError::InstanceNotFound {
                task: self.task.clone(),
                replica: self.replica,
            })
    }
}

impl Patch for InstancePatch {
    fn path(&self) -> String {
        let field = match self.change {
            InstanceChange::Status(_) => "status",
            InstanceChange::Node(_) => "node",
            InstanceChange::AssignedResources(_) => "assigned_resources",
            InstanceChange::Environment(_) => "environment",
            InstanceChange::Docker(_) => "docker",
            InstanceChange::DockerImage(_) => "docker_image",
            InstanceChange::PullStats(_) => "docker_pull_stats",
            InstanceChange::ExitCode(_) => "exit_code",
            InstanceChange::Error(_) => "error",
            InstanceChange::Started(_) => "started",
            InstanceChange::Ended(_) => "ended",
        };
        format!("tasks.{}.instances.{}.{field}", self.task, self.replica)
    }

    fn value(&self) -> Value {
        match &self.change {
            InstanceChange::Status(s) => to_value(s),
            InstanceChange::Node(s) | InstanceChange::Error(s) => Value::from(s.as_str()),
            InstanceChange::AssignedResources(r) => to_value(r),
            InstanceChange::Environment(e) => to_value(e),
            InstanceChange::Docker(d) => to_value(d),
            InstanceChange::DockerImage(i) => to_value(i),
            InstanceChange::PullStats(p) => to_value(p),
            InstanceChange::ExitCode(c) => Value::from(*c),
            InstanceChange::Started(t) | InstanceChange::Ended(t) => Value::from(*t),
        }
    }

    fn apply(&self, job: &mut Job) -> SyncResult<()> {
        let instance = self.target(job)?;
        match &self.change {
            InstanceChange::Status(s) => instance.status = *s,
            InstanceChange::Node(n) => instance.node = Some(n.clone()),
            InstanceChange::AssignedResources(r) => instance.assigned_resources = r.clone(),
            InstanceChange::Environment(e) => instance.environment = e.clone(),
            InstanceChange::Docker(d) => instance.docker = d.clone(),
            InstanceChange::DockerImage(i) => instance.docker_image = i.clone(),
            InstanceChange::PullStats(p) => instance.docker_pull_stats = p.clone(),
            InstanceChange::ExitCode(c) => instance.exit_code = Some(*c),
            InstanceChange::Error(e) => instance.error = e.clone(),
            InstanceChange::Started(t) => instance.started = Some(*t),
            InstanceChange::Ended(t) => instance.ended = Some(*t),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trial_core::{JobConfig, JobTaskConfig};

    fn test_job() -> Job {
        let mut config = JobConfig::default();
        let mut task = JobTaskConfig::named("train");
        task.replicas = 2;
        config.tasks.push(task);
        Job::new("job-1", "token", config)
    }

    #[test]
    fn instance_patch_paths_are_snake_case() {
        let patch = InstancePatch::new("train", 1, InstanceChange::Status(InstanceStatus::DockerPull));
        assert_eq!(patch.path(), "tasks.train.instances.1.status");
        assert_eq!(patch.value(), Value::from("docker_pull"));

        let mut job = test_job();
        patch.apply(&mut job).unwrap();
        assert_eq!(job.instance("train", 1).unwrap().status, InstanceStatus::DockerPull);
    }

    #[test]
    fn unknown_targets_are_errors() {
        let mut job = test_job();
        let missing = TaskPatch::new("eval", TaskChange::Status(TaskStatus::Done));
        assert!(matches!(missing.apply(&mut job), Err(SyncError::TaskNotFound(_))));
        let missing = InstancePatch::new("train", 5, InstanceChange::ExitCode(1));
        assert!(matches!(missing.apply(&mut job), Err(SyncError::InstanceNotFound { .. })));
        let missing = JobPatch::ChannelLastValue {
            name: "loss".into(),
            values: vec![1.0],
        };
        assert!(matches!(missing.apply(&mut job), Err(SyncError::ChannelNotFound(_))));
    }

    #[test]
    fn dotted_parameter_nests() {
        let mut job = test_job();
        let patch = JobPatch::Parameter {
            path: "optimizer.lr".into(),
            value: Value::from(0.01),
        };
        assert_eq!(patch.path(), "parameters.optimizer.lr");
        patch.apply(&mut job).unwrap();
        assert_eq!(job.parameters["optimizer"]["lr"], 0.01);
    }
}
