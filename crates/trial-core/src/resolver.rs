//! Layered job configuration resolver.
//!
//! # Resolution
//!
//! ```text
//!   entry.yml ─┬─ normalize (command → commands, strings → lists)
//!              ├─ rewrite paths of files outside the root directory
//!              ├─ validate tasks (missing deps, cycles)
//!              ├─ merge into accumulator ($inherit expansion)
//!              └─ import: a.yml, b.yml ... (same steps, depth-first)
//!                                │
//!                                ▼
//!              strip $inherit ─► JobConfig ─► implicit `main` ─► inheritance
//! ```
//!
//! Values already set by the importing file win; imported files only fill
//! gaps, except for lists containing `$inherit`, which pull the imported
//! list in at that position, and the `config` map, whose top-level keys are
//! overwritten by the imported file.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::config::JobConfig;
use crate::error::{ConfigError, ConfigResult};

/// Marker item that splices the imported list into the importing one.
pub const INHERIT: &str = "$inherit";

/// Keys holding newline-separated lists when given as a string.
const LIST_KEYS: &[&str] = &["labels", "import", "build", "output", "ignore", "files", "env", "args"];

/// Keys holding paths relative to the file that declared them.
const PATH_LIST_KEYS: &[&str] = &["ignore", "output", "files"];

// ── Sources ───────────────────────────────────────────────────────

/// Where configuration files are read from.
pub trait ConfigSource {
    fn exists(&self, file: &str) -> bool;
    fn read(&self, file: &str) -> std::io::Result<String>;
    /// Human readable root, used in error messages.
    fn root(&self) -> String;
}

/// Reads files relative to a directory on disk.
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ConfigSource for DirSource {
    fn exists(&self, file: &str) -> bool {
        self.root.join(file).is_file()
    }

    fn read(&self, file: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.root.join(file))
    }

    fn root(&self) -> String {
        self.root.display().to_string()
    }
}

/// In-memory file set.
#[derive(Debug, Clone, Default)]
pub struct MapSource {
    files: BTreeMap<String, String>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, file: &str, content: &str) -> Self {
        self.files.insert(normalize_path(file), content.to_string());
        self
    }
}

impl ConfigSource for MapSource {
    fn exists(&self, file: &str) -> bool {
        self.files.contains_key(&normalize_path(file))
    }

    fn read(&self, file: &str) -> std::io::Result<String> {
        self.files
            .get(&normalize_path(file))
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, file.to_string()))
    }

    fn root(&self) -> String {
        "<memory>".to_string()
    }
}

// ── Entry points ──────────────────────────────────────────────────

/// Resolve `entry` (relative to `root`) into a job configuration.
pub fn resolve(root: &Path, entry: &str) -> ConfigResult<JobConfig> {
    resolve_from(&DirSource::new(root), entry)
}

/// Resolve `entry` from an arbitrary source.
pub fn resolve_from(source: &dyn ConfigSource, entry: &str) -> ConfigResult<JobConfig> {
    let mut acc = Accumulator::default();
    load_file(source, &mut acc, &normalize_path(entry))?;
    let config = acc.finish()?;
    debug!(path = %config.path, files = config.paths.len(), tasks = config.tasks.len(), "config resolved");
    Ok(config)
}

#[derive(Default)]
struct Accumulator {
    path: Option<String>,
    paths: Vec<String>,
    dirs: Vec<String>,
    values: Mapping,
}

impl Accumulator {
    fn finish(self) -> ConfigResult<JobConfig> {
        let mut values = self.values;
        let tasks = values.remove("tasks");
        for key in ["path", "paths", "dirs", "import"] {
            values.remove(key);
        }

        let mut config: JobConfig = serde_yaml::from_value(Value::Mapping(values))
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.path = self.path.unwrap_or_default();
        config.paths = self.paths;
        config.dirs = self.dirs;
        config.settings.resources.normalize();

        if let Some(Value::Mapping(tasks)) = tasks {
            for (_, task) in tasks {
                let mut task: crate::config::JobTaskConfig = serde_yaml::from_value(task)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                task.settings.resources.normalize();
                config.tasks.push(task);
            }
        }

        config.ensure_default_task();
        config.resolve_inheritance();
        Ok(config)
    }
}

fn load_file(source: &dyn ConfigSource, acc: &mut Accumulator, file: &str) -> ConfigResult<()> {
    if !source.exists(file) {
        return Err(ConfigError::NotFound {
            file: file.to_string(),
            root: source.root(),
        });
    }
    let content = source.read(file).map_err(|e| ConfigError::Read {
        file: file.to_string(),
        message: e.to_string(),
    })?;

    if acc.path.is_none() {
        acc.path = Some(file.to_string());
    }
    acc.paths.push(file.to_string());
    let rel_dir = parent_dir(file);
    if !acc.dirs.contains(&rel_dir) {
        acc.dirs.push(rel_dir.clone());
    }

    let mut parsed = match serde_yaml::from_str::<Value>(&content) {
        Ok(Value::Mapping(m)) => m,
        Ok(Value::Null) => Mapping::new(),
        Ok(_) => {
            return Err(ConfigError::Invalid(format!(
                "top level of {file} must be a mapping"
            )));
        }
        Err(e) => {
            return Err(ConfigError::Parse {
                file: file.to_string(),
                message: e.to_string(),
            });
        }
    };

    normalize_settings(&mut parsed, &rel_dir);
    if let Some(tasks) = parsed.get_mut("tasks") {
        if tasks.is_null() {
            *tasks = Value::Mapping(Mapping::new());
        }
        match tasks {
            Value::Mapping(tasks) => prepare_tasks(tasks, &rel_dir)?,
            _ => return Err(ConfigError::Invalid(format!("`tasks` in {file} must be a mapping"))),
        }
    }

    let imports = string_list(parsed.get("import"));
    merge_into(&mut acc.values, parsed);

    for import in imports {
        load_file(source, acc, &join_path(&rel_dir, &import))?;
    }

    strip_inherit(&mut acc.values);
    Ok(())
}

// ── Normalization ─────────────────────────────────────────────────

fn normalize_settings(map: &mut Mapping, rel_dir: &str) {
    rename_key(map, "label", "labels");
    rename_key(map, "nodeIds", "node_ids");

    if let Some(command) = map.remove("command") {
        map.insert("commands".into(), command);
    }
    if let Some(commands) = map.get_mut("commands") {
        *commands = normalize_commands(commands.clone());
    }

    for key in LIST_KEYS {
        if let Some(Value::String(s)) = map.get(*key) {
            let lines = s.split('\n').map(|l| Value::String(l.to_string())).collect();
            map.insert((*key).into(), Value::Sequence(lines));
        }
    }
    if let Some(Value::String(dep)) = map.get("depends_on") {
        let dep = dep.clone();
        map.insert("depends_on".into(), Value::Sequence(vec![Value::String(dep)]));
    }

    if rel_dir.is_empty() {
        return;
    }

    for key in PATH_LIST_KEYS {
        if let Some(Value::Sequence(items)) = map.get_mut(*key) {
            for item in items.iter_mut() {
                if let Value::String(s) = item {
                    *s = rebase_path(rel_dir, s);
                }
            }
        }
    }
    if let Some(Value::String(dockerfile)) = map.get_mut("dockerfile") {
        *dockerfile = rebase_path(rel_dir, dockerfile);
    }
    if let Some(Value::Sequence(lines)) = map.get_mut("build") {
        for line in lines.iter_mut() {
            if let Value::String(s) = line {
                *s = rebase_build_line(rel_dir, s);
            }
        }
    }
    if let Some(Value::Sequence(commands)) = map.get_mut("commands") {
        for command in commands.iter_mut() {
            if let Value::Mapping(c) = command
                && let Some(Value::String(cmd)) = c.get_mut("command")
            {
                *cmd = format!("cd {rel_dir} && ({cmd})");
            }
        }
    }
}

fn normalize_commands(value: Value) -> Value {
    let entry = |name: String, command: Value| {
        let mut m = Mapping::new();
        m.insert("name".into(), Value::String(name));
        m.insert("command".into(), command);
        Value::Mapping(m)
    };
    match value {
        Value::String(s) => Value::Sequence(vec![entry(String::new(), Value::String(s))]),
        Value::Sequence(items) => Value::Sequence(
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| match item {
                    Value::String(s) if s == INHERIT => Value::String(s),
                    Value::String(s) => entry(i.to_string(), Value::String(s)),
                    other => other,
                })
                .collect(),
        ),
        Value::Mapping(map) => Value::Sequence(
            map.into_iter()
                .filter_map(|(k, v)| key_string(&k).map(|k| entry(k, v)))
                .collect(),
        ),
        other => other,
    }
}

fn rebase_path(rel_dir: &str, path: &str) -> String {
    if path == INHERIT {
        return path.to_string();
    }
    if let Some(negated) = path.strip_prefix('!') {
        return format!("!{}", join_path(rel_dir, negated));
    }
    let joined = join_path(rel_dir, path);
    if joined.is_empty() { "./".to_string() } else { joined }
}

fn rebase_build_line(rel_dir: &str, line: &str) -> String {
    if line == INHERIT {
        return line.to_string();
    }
    if let Some(rest) = line.strip_prefix("ADD ") {
        let mut parts = rest.split(':');
        let src = parts.next().unwrap_or_default();
        let target = parts.next().filter(|t| !t.is_empty());
        let src = rebase_path(rel_dir, src);
        return match target {
            Some(target) => format!("ADD {src}:{target}"),
            None => format!("ADD {src}"),
        };
    }
    format!("cd {rel_dir} && ({line})")
}

fn rename_key(map: &mut Mapping, from: &str, to: &str) {
    if let Some(v) = map.remove(from)
        && !map.contains_key(to)
    {
        map.insert(to.into(), v);
    }
}

// ── Tasks ─────────────────────────────────────────────────────────

fn prepare_tasks(tasks: &mut Mapping, rel_dir: &str) -> ConfigResult<()> {
    let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut order = Vec::new();

    for (key, value) in tasks.iter_mut() {
        let name = key_string(key)
            .ok_or_else(|| ConfigError::Invalid("task names must be strings".into()))?;
        if value.is_null() {
            *value = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(task) = value else {
            return Err(ConfigError::Invalid(format!("task '{name}' must be a mapping")));
        };

        normalize_settings(task, rel_dir);
        let explicit: Vec<Value> = task
            .keys()
            .filter_map(key_string)
            .map(Value::String)
            .collect();
        task.insert("name".into(), Value::String(name.clone()));
        task.insert("explicit_keys".into(), Value::Sequence(explicit));

        graph.insert(name.clone(), string_list(task.get("depends_on")));
        order.push(name);
    }

    for name in &order {
        for dep in &graph[name] {
            if !graph.contains_key(dep) {
                return Err(ConfigError::MissingDependency {
                    task: name.clone(),
                    dependency: dep.clone(),
                });
            }
            detect_cycle(&graph, dep)?;
        }
    }
    Ok(())
}

/// Walk `depends_on` edges from `origin` and fail if any path leads back
/// to it. The reported cycle starts and ends with `origin`.
fn detect_cycle(graph: &BTreeMap<String, Vec<String>>, origin: &str) -> ConfigResult<()> {
    fn walk(
        graph: &BTreeMap<String, Vec<String>>,
        origin: &str,
        path: &mut Vec<String>,
        explored: &mut HashSet<String>,
    ) -> ConfigResult<()> {
        let Some(current) = path.last().cloned() else {
            return Ok(());
        };
        for dep in graph.get(&current).into_iter().flatten() {
            if dep == origin {
                let mut cycle = path.clone();
                cycle.push(dep.clone());
                return Err(ConfigError::CircularDependency { cycle });
            }
            if path.contains(dep) || !explored.insert(dep.clone()) {
                continue;
            }
            path.push(dep.clone());
            walk(graph, origin, path, explored)?;
            path.pop();
        }
        Ok(())
    }

    let mut path = vec![origin.to_string()];
    walk(graph, origin, &mut path, &mut HashSet::new())
}

// ── Merging ───────────────────────────────────────────────────────

fn merge_into(acc: &mut Mapping, parsed: Mapping) {
    for (key, incoming) in parsed {
        if acc.get(&key).is_none_or(Value::is_null) {
            acc.insert(key, incoming);
            continue;
        }
        let is_config = key.as_str() == Some("config");
        let Some(existing) = acc.get_mut(&key) else {
            continue;
        };
        match (existing, incoming) {
            (Value::Sequence(current), Value::Sequence(incoming)) => {
                expand_inherit(current, &incoming);
            }
            (Value::Mapping(current), Value::Mapping(incoming)) if is_config => {
                merge_config(current, incoming);
            }
            _ => {}
        }
    }
}

fn expand_inherit(current: &mut Vec<Value>, incoming: &[Value]) {
    if !current.iter().any(is_inherit) {
        return;
    }
    let expanded = std::mem::take(current)
        .into_iter()
        .flat_map(|item| {
            if is_inherit(&item) {
                incoming.to_vec()
            } else {
                vec![item]
            }
        })
        .collect();
    *current = expanded;
}

/// Top-level keys of the imported `config` map replace the importer's.
fn merge_config(current: &mut Mapping, incoming: Mapping) {
    for (key, value) in incoming {
        current.insert(key, value);
    }
}

fn strip_inherit(values: &mut Mapping) {
    for (_, value) in values.iter_mut() {
        if let Value::Sequence(items) = value {
            items.retain(|item| !is_inherit(item));
        }
    }
}

fn is_inherit(value: &Value) -> bool {
    value.as_str() == Some(INHERIT)
}

// ── Helpers ───────────────────────────────────────────────────────

fn key_string(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(|i| i.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Lexically normalize a `/`-separated relative path. A trailing slash is
/// kept; the empty path stays empty.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let mut out = parts.join("/");
    if path.ends_with('/') && !out.is_empty() {
        out.push('/');
    }
    out
}

pub fn join_path(dir: &str, path: &str) -> String {
    if dir.is_empty() {
        normalize_path(path)
    } else {
        normalize_path(&format!("{dir}/{path}"))
    }
}

fn parent_dir(file: &str) -> String {
    match file.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_map(files: &[(&str, &str)]) -> ConfigResult<JobConfig> {
        let source = files
            .iter()
            .fold(MapSource::new(), |s, (name, content)| s.with(name, content));
        resolve_from(&source, files[0].0)
    }

    #[test]
    fn single_command_becomes_main_task() {
        let config = resolve_map(&[("trialgrid.yml", "command: python train.py")]).unwrap();
        assert_eq!(config.tasks.len(), 1);
        let main = &config.tasks[0];
        assert_eq!(main.name, "main");
        assert_eq!(main.settings.commands.len(), 1);
        assert_eq!(main.settings.commands[0].command, "python train.py");
        assert_eq!(main.settings.commands[0].name, "");
    }

    #[test]
    fn command_forms_normalize() {
        let config = resolve_map(&[(
            "trialgrid.yml",
            "tasks:\n  a:\n    command: [\"echo 1\", \"echo 2\"]\n  b:\n    commands:\n      prep: make\n      run: ./run\n",
        )])
        .unwrap();
        let a = config.task("a").unwrap();
        assert_eq!(a.settings.commands[1].name, "1");
        assert_eq!(a.settings.commands[1].command, "echo 2");
        assert!(a.explicit_keys.contains("commands"));

        let b = config.task("b").unwrap();
        assert_eq!(b.settings.commands[0].name, "prep");
        assert_eq!(b.settings.commands[1].command, "./run");
    }

    #[test]
    fn newline_strings_become_lists() {
        let config = resolve_map(&[(
            "trialgrid.yml",
            "build: \"apt-get update\\napt-get install -y git\"\nignore: \"data\\nlogs\"\nlabel: \"a\\nb\"\n",
        )])
        .unwrap();
        assert_eq!(config.settings.build, vec!["apt-get update", "apt-get install -y git"]);
        assert_eq!(config.ignore, vec!["data", "logs"]);
        assert_eq!(config.labels, vec!["a", "b"]);
    }

    #[test]
    fn missing_dependency_is_config_error() {
        let err = resolve_map(&[("trialgrid.yml", "tasks:\n  a:\n    depends_on: [nope]\n")])
            .unwrap_err();
        assert!(err.is_dependency_error());
        assert_eq!(err.to_string(), "Task 'a' depends on missing 'nope'");
    }

    #[test]
    fn cycle_reports_full_path() {
        let err = resolve_map(&[(
            "trialgrid.yml",
            "tasks:\n  a:\n    depends_on: b\n  b:\n    depends_on: c\n  c:\n    depends_on: a\n",
        )])
        .unwrap_err();
        match err {
            ConfigError::CircularDependency { cycle } => {
                assert_eq!(cycle, vec!["b", "c", "a", "b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = resolve_map(&[("trialgrid.yml", "tasks:\n  a:\n    depends_on: [a]\n")])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Circular dependency in task dependencies: a -> a"
        );
    }

    #[test]
    fn cycle_not_through_origin_terminates() {
        let err = resolve_map(&[(
            "trialgrid.yml",
            "tasks:\n  a:\n    depends_on: b\n  b:\n    depends_on: c\n  c:\n    depends_on: b\n",
        )])
        .unwrap_err();
        match err {
            ConfigError::CircularDependency { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"b".to_string()));
                assert!(cycle.contains(&"c".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn importing_file_wins_and_inherit_splices() {
        let config = resolve_map(&[
            (
                "trialgrid.yml",
                "import: base.yml\nimage: python:3.11\nbuild: [\"$inherit\", \"make dataset\"]\n",
            ),
            (
                "base.yml",
                "image: python:3.8\nbuild: [\"pip install tensorflow\"]\noutput: [model.h5]\n",
            ),
        ])
        .unwrap();
        assert_eq!(config.settings.image, "python:3.11");
        assert_eq!(config.settings.build, vec!["pip install tensorflow", "make dataset"]);
        assert_eq!(config.settings.output, vec!["model.h5"]);
        assert_eq!(config.paths, vec!["trialgrid.yml", "base.yml"]);
    }

    #[test]
    fn unresolved_inherit_is_removed() {
        let config = resolve_map(&[("trialgrid.yml", "build: [\"$inherit\", \"make\"]\n")]).unwrap();
        assert_eq!(config.settings.build, vec!["make"]);
    }

    #[test]
    fn imported_config_keys_replace_the_importers() {
        let config = resolve_map(&[
            (
                "trialgrid.yml",
                "import: base.yml\nconfig:\n  lr: 0.1\n  batch: 32\n  model:\n    depth: 50\n    dropout: 0.2\n",
            ),
            (
                "base.yml",
                "config:\n  lr: 0.5\n  epochs: 10\n  model:\n    depth: 18\n    width: 2\n",
            ),
        ])
        .unwrap();
        assert_eq!(config.config["lr"], serde_json::json!(0.5));
        assert_eq!(config.config["batch"], serde_json::json!(32));
        assert_eq!(config.config["epochs"], serde_json::json!(10));
        // whole values are replaced, nested maps are not merged
        assert_eq!(config.config["model"], serde_json::json!({"depth": 18, "width": 2}));
    }

    #[test]
    fn nested_file_paths_are_rebased() {
        let config = resolve_map(&[
            ("trialgrid.yml", "import: sub/dir/extra.yml\n"),
            (
                "sub/dir/extra.yml",
                "ignore: [\"data\", \"!keep\", \"..\"]\nbuild: [\"ADD src:/opt/src\", \"pip install -e .\"]\ncommand: python run.py\n",
            ),
        ])
        .unwrap();
        assert_eq!(config.ignore, vec!["sub/dir/data", "!sub/dir/keep", "sub"]);
        assert_eq!(
            config.settings.build,
            vec!["ADD sub/dir/src:/opt/src", "cd sub/dir && (pip install -e .)"]
        );
        assert_eq!(
            config.settings.commands[0].command,
            "cd sub/dir && (python run.py)"
        );
        assert_eq!(config.dirs, vec!["", "sub/dir"]);
    }

    #[test]
    fn missing_file_names_root() {
        let err = resolve_map(&[("trialgrid.yml", "import: gone.yml\n")]).unwrap_err();
        assert_eq!(err.to_string(), "Config at gone.yml in <memory> not found");
        assert!(!err.is_dependency_error());
    }

    #[test]
    fn task_settings_inherit_from_root() {
        let config = resolve_map(&[(
            "trialgrid.yml",
            "image: python:3.10\nresources:\n  cpu: 2\ntasks:\n  train:\n    command: python train.py\n  eval:\n    image: python:3.11\n    depends_on: train\n",
        )])
        .unwrap();
        let eval = config.task("eval").unwrap();
        assert_eq!(eval.settings.image, "python:3.11");
        assert_eq!(eval.settings.resources.cpu, 2);
        assert_eq!(eval.depends_on, vec!["train"]);
        assert!(eval.settings.commands.is_empty());
        assert_eq!(config.task("train").unwrap().settings.image, "python:3.10");
    }

    #[test]
    fn normalize_path_cases() {
        assert_eq!(normalize_path("./a/../b/"), "b/");
        assert_eq!(normalize_path("a/./b"), "a/b");
        assert_eq!(normalize_path("../x"), "../x");
        assert_eq!(normalize_path("."), "");
        assert_eq!(join_path("sub", "../other.yml"), "other.yml");
    }
}
