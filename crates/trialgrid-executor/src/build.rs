//! Image build recipes for tasks with `build` lines or a `dockerfile`.

use std::path::Path;

use sha2::{Digest, Sha256};
use trial_core::TaskSettings;

/// Where a synthesized build file is written inside the instance dir.
pub const GENERATED_DOCKERFILE: &str = ".trialgrid/Dockerfile";

/// What to build and how to tag it.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildPlan {
    /// Relative to the instance dir.
    pub dockerfile: String,
    /// Contents to write at `dockerfile`; `None` for a user build file.
    pub generated: Option<String>,
    pub tag: String,
}

fn normalize_source(raw: &str) -> &str {
    let mut path = raw.trim();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.trim_start_matches('/')
}

/// Build file for `build` lines on top of `image`.
///
/// `ADD src[:target]` lines become `ADD` instructions when `src` exists in
/// `instance_dir` and are dropped otherwise; every other line runs as is.
pub fn synthesize_dockerfile(image: &str, dirs: &[String], build: &[String], instance_dir: &Path) -> String {
    let mut out = String::from("# Generated from the task's \"build\" lines.\n");
    out.push_str(&format!("FROM {image}\n"));
    out.push_str("RUN mkdir /job\n");
    out.push_str("WORKDIR /job\n");
    for dir in dirs.iter().filter(|d| !d.is_empty() && *d != "." && *d != "./") {
        out.push_str(&format!("RUN mkdir -p /job/{}\n", dir.trim_end_matches('/')));
    }
    for line in build {
        match line.strip_prefix("ADD ") {
            Some(spec) => {
                let (source, target) = match spec.trim().split_once(':') {
                    Some((source, target)) => (normalize_source(source), target.trim()),
                    None => (normalize_source(spec), ""),
                };
                if source.is_empty() || !instance_dir.join(source).exists() {
                    continue;
                }
                let target = if target.is_empty() { source } else { target };
                out.push_str(&format!("ADD {source} {target}\n"));
            }
            None => out.push_str(&format!("RUN {line}\n")),
        }
    }
    out
}

/// `<project>_<sha256(image, recipe)>`, lower-cased. Identical recipes
/// share a tag and thus a cached image.
pub fn image_tag(project: &str, image: &str, recipe: &[String]) -> String {
    let project: String = project
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect();
    let mut hasher = Sha256::new();
    hasher.update(image.as_bytes());
    for line in recipe {
        hasher.update(b"_");
        hasher.update(line.as_bytes());
    }
    format!("{project}_{}", hex::encode(hasher.finalize())).to_lowercase()
}

/// `None` when the task runs its image unchanged.
pub fn plan_build(project: &str, settings: &TaskSettings, dirs: &[String], instance_dir: &Path) -> Option<BuildPlan> {
    if !settings.dockerfile.is_empty() {
        let recipe = vec![format!("dockerfile:{}", settings.dockerfile)];
        return Some(BuildPlan {
            dockerfile: settings.dockerfile.clone(),
            generated: None,
            tag: image_tag(project, &settings.image, &recipe),
        });
    }
    if settings.build.is_empty() {
        return None;
    }
    Some(BuildPlan {
        dockerfile: GENERATED_DOCKERFILE.to_string(),
        generated: Some(synthesize_dockerfile(&settings.image, dirs, &settings.build, instance_dir)),
        tag: image_tag(project, &settings.image, &settings.build),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn dockerfile_adds_existing_sources_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "numpy\n").unwrap();

        let build = vec![
            "ADD ./requirements.txt".to_string(),
            "ADD data/:/data".to_string(),
            "pip install -r requirements.txt".to_string(),
        ];
        let dirs = vec![String::new(), "models".to_string()];
        let out = synthesize_dockerfile("python:3.9", &dirs, &build, dir.path());
        let lines: Vec<&str> = out.lines().skip(1).collect();
        assert_eq!(
            lines,
            vec![
                "FROM python:3.9",
                "RUN mkdir /job",
                "WORKDIR /job",
                "RUN mkdir -p /job/models",
                "ADD requirements.txt requirements.txt",
                "RUN pip install -r requirements.txt",
            ]
        );
    }

    #[test]
    fn add_target_is_kept() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        let out = synthesize_dockerfile("ubuntu", &[], &["ADD data:/srv/data".to_string()], dir.path());
        assert!(out.contains("ADD data /srv/data\n"));
    }

    #[test]
    fn tags_are_stable_and_sanitized() {
        let build = vec!["pip install tensorflow".to_string()];
        let a = image_tag("My Project", "python:3.9", &build);
        let b = image_tag("My Project", "python:3.9", &build);
        assert_eq!(a, b);
        assert!(a.starts_with("my-project_"));
        assert_eq!(a.len(), "my-project_".len() + 64);
        assert_ne!(a, image_tag("My Project", "python:3.10", &build));
    }

    #[test]
    fn plan_follows_settings() {
        let dir = TempDir::new().unwrap();
        let mut settings = TaskSettings {
            image: "python:3.9".into(),
            ..Default::default()
        };
        assert!(plan_build("p", &settings, &[], dir.path()).is_none());

        settings.build = vec!["make".into()];
        let plan = plan_build("p", &settings, &[], dir.path()).unwrap();
        assert_eq!(plan.dockerfile, GENERATED_DOCKERFILE);
        assert!(plan.generated.unwrap().contains("RUN make"));

        settings.dockerfile = "docker/Dockerfile".into();
        let plan = plan_build("p", &settings, &[], dir.path()).unwrap();
        assert_eq!(plan.dockerfile, "docker/Dockerfile");
        assert!(plan.generated.is_none());
    }
}
