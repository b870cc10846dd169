//! Instance environment: variables, bind paths, and the host snapshot.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use trial_core::JobEnvironment;
use trialgrid_metrics::HostProbe;

/// `NAME=VALUE` entries as a map. A bare `NAME` takes its value from this
/// process's environment and is skipped when unset there.
pub fn parse_env_vars(entries: &[String]) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.split_once('=') {
            Some((name, value)) => {
                vars.insert(name.trim().to_string(), value.to_string());
            }
            None => {
                if let Ok(value) = std::env::var(entry) {
                    vars.insert(entry.to_string(), value);
                }
            }
        }
    }
    vars
}

pub fn env_list(vars: &BTreeMap<String, String>) -> Vec<String> {
    vars.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

/// Expand `~` (home) and `.` (instance dir) at the start of the host side
/// of a `host:container[:mode]` bind.
pub fn expand_bind(bind: &str, home: &Path, instance_dir: &Path) -> String {
    let (host, rest) = match bind.split_once(':') {
        Some((host, rest)) => (host, Some(rest)),
        None => (bind, None),
    };
    let host = if host == "~" {
        home.to_string_lossy().into_owned()
    } else if let Some(tail) = host.strip_prefix("~/") {
        home.join(tail).to_string_lossy().into_owned()
    } else if host == "." {
        instance_dir.to_string_lossy().into_owned()
    } else if let Some(tail) = host.strip_prefix("./") {
        instance_dir.join(tail).to_string_lossy().into_owned()
    } else {
        host.to_string()
    };
    match rest {
        Some(rest) => format!("{host}:{rest}"),
        None => host,
    }
}

fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

/// `3.10.4` from `Python 3.10.4`.
pub fn parse_python_version(output: &str) -> Option<String> {
    let version = output.trim().strip_prefix("Python ")?.trim();
    (!version.is_empty()).then(|| version.to_string())
}

async fn python_version() -> Option<String> {
    for binary in ["python3", "python"] {
        let output = tokio::time::timeout(Duration::from_secs(5), Command::new(binary).arg("--version").output()).await;
        if let Ok(Ok(out)) = output
            && out.status.success()
        {
            // Python 2 prints its version to stderr.
            let text = if out.stdout.is_empty() { out.stderr } else { out.stdout };
            if let Some(version) = parse_python_version(&String::from_utf8_lossy(&text)) {
                return Some(version);
            }
        }
    }
    None
}

/// Snapshot of where an instance runs.
pub async fn collect_environment(
    probe: &dyn HostProbe,
    agent_version: &str,
    variables: BTreeMap<String, String>,
) -> JobEnvironment {
    let facts = probe.facts();
    JobEnvironment {
        hostname: facts.hostname,
        username: username(),
        platform: facts.platform,
        release: facts.release,
        arch: facts.arch,
        uptime: facts.uptime,
        agent_version: agent_version.to_string(),
        python_version: python_version().await,
        variables,
    }
}
