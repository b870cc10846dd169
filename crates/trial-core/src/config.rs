//! Resolved job configuration types.
//!
//! These are the output of [`crate::resolver`]. After resolution a config
//! is immutable; only [`JobConfig::apply_overrides`] (command-line
//! overrides applied before a job is created) touches it again.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConfigError, ConfigResult};
use crate::resources::JobResources;

/// Name of the task synthesized when a config declares none.
pub const DEFAULT_TASK: &str = "main";

/// One shell command of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCommand {
    #[serde(default)]
    pub name: String,
    pub command: String,
}

/// Extra options for containerized tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerOptions {
    pub env: Vec<String>,
    pub binds: Vec<String>,
    pub links: Vec<String>,
}

/// Settings a task either sets itself or inherits from the root config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    /// Build steps: `ADD src[:target]` or a shell line.
    pub build: Vec<String>,
    pub dockerfile: String,
    pub image: String,
    /// `NAME=VALUE` or `NAME` (taken from the starting process).
    pub env: Vec<String>,
    pub clusters: Vec<String>,
    pub nodes: Vec<String>,
    pub node_ids: Vec<String>,
    pub resources: JobResources,
    /// Glob patterns of files collected after the run.
    pub output: Vec<String>,
    pub commands: Vec<TaskCommand>,
    pub args: Vec<String>,
    pub docker: DockerOptions,
}

impl TaskSettings {
    pub fn is_containerized(&self) -> bool {
        !self.image.is_empty()
    }

    pub fn has_build(&self) -> bool {
        !self.dockerfile.is_empty() || !self.build.is_empty()
    }
}

/// A single task of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTaskConfig {
    pub name: String,
    pub replicas: u32,
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub settings: TaskSettings,
    /// Keys the task set itself; those are never overwritten by
    /// inheritance.
    pub explicit_keys: BTreeSet<String>,
}

impl Default for JobTaskConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            replicas: 1,
            depends_on: Vec::new(),
            settings: TaskSettings::default(),
            explicit_keys: BTreeSet::new(),
        }
    }
}

impl JobTaskConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn replicas(&self) -> u32 {
        self.replicas.max(1)
    }

    /// `name`, or `name_replica` when the task has more than one replica.
    pub fn instance_name(&self, replica: u32) -> String {
        if self.replicas() > 1 {
            format!("{}_{}", self.name, replica)
        } else {
            self.name.clone()
        }
    }

    fn inherit_from(&mut self, root: &TaskSettings) {
        macro_rules! inherit {
            ($($field:ident),* $(,)?) => {
                $(
                    if !self.explicit_keys.contains(stringify!($field)) {
                        self.settings.$field = root.$field.clone();
                    }
                )*
            };
        }
        inherit!(
            build, dockerfile, image, env, clusters, nodes, node_ids, resources, output,
            commands, args, docker,
        );
    }
}

/// The fully resolved configuration of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Entry file, relative to the root directory.
    pub path: String,
    /// Every file read, in read order.
    pub paths: Vec<String>,
    /// Distinct directories of those files (`""` for the root).
    pub dirs: Vec<String>,
    pub files: Vec<String>,
    pub ignore: Vec<String>,
    pub labels: Vec<String>,
    pub priority: i32,
    /// Free-form values, available to command templates.
    pub config: Map<String, Value>,
    #[serde(flatten)]
    pub settings: TaskSettings,
    pub tasks: Vec<JobTaskConfig>,
}

impl JobConfig {
    pub fn task(&self, name: &str) -> Option<&JobTaskConfig> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name.clone()).collect()
    }

    /// Add the implicit `main` task when no task was declared.
    pub fn ensure_default_task(&mut self) {
        if self.tasks.is_empty() {
            self.tasks.push(JobTaskConfig::named(DEFAULT_TASK));
        }
    }

    /// Copy root settings into every task that did not set them.
    pub fn resolve_inheritance(&mut self) {
        let root = self.settings.clone();
        for task in &mut self.tasks {
            task.inherit_from(&root);
        }
    }

    /// Apply command-line overrides and re-run inheritance.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> ConfigResult<()> {
        let res = &mut self.settings.resources;
        macro_rules! set_if {
            ($($field:ident),* $(,)?) => {
                $( if let Some(v) = overrides.$field { res.$field = v; } )*
            };
        }
        set_if!(cpu, min_cpu, max_cpu, memory, min_memory, max_memory, gpu, min_gpu, max_gpu);
        if let Some(v) = overrides.min_gpu_memory {
            res.min_gpu_memory = v;
        }
        res.normalize();

        if !overrides.nodes.is_empty() {
            self.settings.nodes = overrides.nodes.clone();
        }
        if let Some(priority) = overrides.priority {
            self.priority = priority;
        }
        for entry in &overrides.config {
            let (path, raw) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::Invalid(format!("expected key=value, got '{entry}'")))?;
            let value: Value = serde_yaml::from_str(raw).unwrap_or(Value::String(raw.to_string()));
            set_config_path(&mut self.config, path.trim(), value)?;
        }
        self.resolve_inheritance();
        Ok(())
    }
}

/// Overrides given on the command line when starting a job.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub cpu: Option<u32>,
    pub min_cpu: Option<u32>,
    pub max_cpu: Option<u32>,
    pub memory: Option<u32>,
    pub min_memory: Option<u32>,
    pub max_memory: Option<u32>,
    pub gpu: Option<u32>,
    pub min_gpu: Option<u32>,
    pub max_gpu: Option<u32>,
    pub min_gpu_memory: Option<f64>,
    pub nodes: Vec<String>,
    pub priority: Option<i32>,
    /// `dotted.path=value` entries for the `config` map.
    pub config: Vec<String>,
}

fn set_config_path(map: &mut Map<String, Value>, path: &str, value: Value) -> ConfigResult<()> {
    if path.is_empty() {
        return Err(ConfigError::Invalid("empty config path".into()));
    }
    let mut parts = path.split('.').peekable();
    let mut current = map;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return Ok(());
        }
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot
            .as_object_mut()
            .ok_or_else(|| ConfigError::Invalid(format!("cannot set '{path}'")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> JobConfig {
        let mut explicit = JobTaskConfig::named("eval");
        explicit.settings.image = "python:3.11".into();
        explicit.explicit_keys.insert("image".into());

        JobConfig {
            settings: TaskSettings {
                image: "python:3.10".into(),
                commands: vec![TaskCommand {
                    name: String::new(),
                    command: "python train.py".into(),
                }],
                ..Default::default()
            },
            tasks: vec![JobTaskConfig::named("train"), explicit],
            ..Default::default()
        }
    }

    #[test]
    fn inheritance_respects_explicit_keys() {
        let mut config = test_config();
        config.resolve_inheritance();

        let train = config.task("train").unwrap();
        assert_eq!(train.settings.image, "python:3.10");
        assert_eq!(train.settings.commands.len(), 1);

        let eval = config.task("eval").unwrap();
        assert_eq!(eval.settings.image, "python:3.11");
        assert_eq!(eval.settings.commands[0].command, "python train.py");
    }

    #[test]
    fn default_task_only_when_empty() {
        let mut config = JobConfig::default();
        config.ensure_default_task();
        assert_eq!(config.task_names(), vec!["main"]);

        config.ensure_default_task();
        assert_eq!(config.tasks.len(), 1);
    }

    #[test]
    fn overrides_reach_inheriting_tasks() {
        let mut config = test_config();
        config.resolve_inheritance();
        let overrides = ConfigOverrides {
            cpu: Some(6),
            config: vec!["optimizer.lr=0.01".into(), "name=resnet".into()],
            ..Default::default()
        };
        config.apply_overrides(&overrides).unwrap();

        assert_eq!(config.task("train").unwrap().settings.resources.cpu, 6);
        assert_eq!(config.config["optimizer"]["lr"], serde_json::json!(0.01));
        assert_eq!(config.config["name"], serde_json::json!("resnet"));
    }

    #[test]
    fn override_without_equals_is_rejected() {
        let mut config = test_config();
        let overrides = ConfigOverrides {
            config: vec!["nope".into()],
            ..Default::default()
        };
        assert!(matches!(
            config.apply_overrides(&overrides),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn instance_name_includes_replica_only_when_replicated() {
        let mut task = JobTaskConfig::named("train");
        assert_eq!(task.instance_name(0), "train");
        task.replicas = 3;
        assert_eq!(task.instance_name(2), "train_2");
    }
}
