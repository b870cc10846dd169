//! Resolver tests against real directory trees.

use std::fs;
use std::path::Path;

use tempfile::TempDir;
use trial_core::{ConfigError, Job, resolve};

fn write(root: &Path, file: &str, content: &str) {
    let path = root.join(file);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

#[test]
fn inherited_build_lines_keep_their_directory() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "experiments/child.yml",
        "import: ../base/parent.yml\nbuild:\n  - $inherit\n  - make dataset\n",
    );
    write(
        dir.path(),
        "base/parent.yml",
        "image: python:3.8\nbuild:\n  - pip install tensorflow\n",
    );

    let config = resolve(dir.path(), "experiments/child.yml").unwrap();
    assert_eq!(
        config.settings.build,
        vec![
            "cd base && (pip install tensorflow)",
            "cd experiments && (make dataset)",
        ]
    );
    assert_eq!(config.settings.image, "python:3.8");
    assert_eq!(config.path, "experiments/child.yml");
    assert_eq!(config.dirs, vec!["experiments", "base"]);
}

#[test]
fn root_level_inherit_chain() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "trialgrid.yml",
        "import: parent.yml\nbuild: [\"$inherit\", \"make dataset\"]\n",
    );
    write(dir.path(), "parent.yml", "build: [\"pip install tensorflow\"]\n");

    let config = resolve(dir.path(), "trialgrid.yml").unwrap();
    assert_eq!(
        config.settings.build,
        vec!["pip install tensorflow", "make dataset"]
    );
    assert_eq!(config.task("main").unwrap().settings.build.len(), 2);
}

#[test]
fn resolving_twice_is_identical() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "trialgrid.yml",
        "import: sub/extra.yml\ntasks:\n  train:\n    command: python train.py\n",
    );
    write(
        dir.path(),
        "sub/extra.yml",
        "output: [\"models/\", \"!models/tmp\"]\nfiles: [\"*.py\"]\ncommand: ./prepare.sh\n",
    );

    let first = resolve(dir.path(), "trialgrid.yml").unwrap();
    let second = resolve(dir.path(), "trialgrid.yml").unwrap();
    assert_eq!(first, second);
    assert_eq!(first.settings.output, vec!["sub/models/", "!sub/models/tmp"]);
    assert_eq!(first.files, vec!["sub/*.py"]);
}

#[test]
fn cycle_includes_originating_task_in_any_order() {
    for content in [
        "tasks:\n  a:\n    depends_on: b\n  b:\n    depends_on: a\n",
        "tasks:\n  b:\n    depends_on: a\n  a:\n    depends_on: b\n",
    ] {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "trialgrid.yml", content);
        match resolve(dir.path(), "trialgrid.yml") {
            Err(ConfigError::CircularDependency { cycle }) => {
                assert_eq!(cycle.len(), 3);
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }
}

#[test]
fn missing_entry_file() {
    let dir = TempDir::new().unwrap();
    let err = resolve(dir.path(), "nope.yml").unwrap_err();
    assert!(matches!(err, ConfigError::NotFound { .. }));
}

#[test]
fn job_from_resolved_config() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "trialgrid.yml",
        "tasks:\n  prep:\n    command: ./prep.sh\n  train:\n    replicas: 2\n    depends_on: prep\n    command: python train.py\n",
    );
    let config = resolve(dir.path(), "trialgrid.yml").unwrap();
    let job = Job::new("job-1", "secret", config);

    let names: Vec<_> = job.ordered_tasks().map(|t| t.name.clone()).collect();
    assert_eq!(names, vec!["prep", "train"]);
    assert_eq!(job.task("train").unwrap().instances.len(), 2);
}
