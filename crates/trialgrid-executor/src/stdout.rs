//! Task output reader.
//!
//! Output is split into lines. A line ending in `}` that contains
//! `{"trialgrid":` or `{trialgrid:` carries a directive: the text from
//! that position is parsed as YAML and applied to the job. Text before
//! the directive is logged like any other output; a line that is only a
//! directive is not.
//!
//! ```text
//!   {"trialgrid": "iteration", "iteration": 3, "total": 10}
//!   {trialgrid: batch, current: 20, total: 100, size: 32}
//!   {trialgrid: channel, name: loss, x: 3, y: [0.12, 0.2]}
//! ```

use std::io::Write;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;
use trial_core::Channel;
use trialgrid_sync::{JobPatch, JobStorage, SyncResult};

const MARKERS: [&str; 2] = ["{\"trialgrid\":", "{trialgrid:"];

/// Batch-style progress, from `batch` or `sample` directives.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchProgress {
    pub step_label: &'static str,
    pub step: Option<u64>,
    pub steps: Option<u64>,
    /// `(current, total, size)` when all three are given.
    pub batch: Option<(f64, f64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Iteration { total: Option<u64>, iterations: Vec<u64> },
    Status { title: String },
    Parameter { path: String, value: Value },
    Info { name: String, value: Value },
    CreateChannel { name: String, channel: Channel },
    Batch(BatchProgress),
    Channel { name: String, x: f64, y: Vec<f64> },
}

/// Byte offset of the directive in `line`, if it carries one.
pub fn find_directive(line: &str) -> Option<usize> {
    if !line.trim_end_matches(['\r', '\n']).ends_with('}') {
        return None;
    }
    MARKERS.iter().find_map(|marker| line.find(marker))
}

fn number(op: &Value, key: &str) -> Option<f64> {
    op.get(key).and_then(Value::as_f64).filter(|n| n.is_finite())
}

fn count(op: &Value, key: &str) -> Option<u64> {
    number(op, key).filter(|n| *n >= 0.0).map(|n| n as u64)
}

fn string(op: &Value, key: &str) -> Option<String> {
    match op.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Parse the YAML text of one directive. `Ok(None)` for unknown kinds.
pub fn parse_directive(text: &str) -> Result<Option<Directive>, serde_yaml::Error> {
    let op: Value = serde_yaml::from_str(text.trim())?;
    let Some(kind) = op.get("trialgrid").and_then(Value::as_str) else {
        return Ok(None);
    };

    let directive = match kind {
        "iteration" | "epoch" => Directive::Iteration {
            total: count(&op, "total"),
            iterations: ["step", "iteration", "epoch"]
                .iter()
                .filter_map(|key| count(&op, key))
                .collect(),
        },
        "status" => {
            let Some(title) = string(&op, "title").or_else(|| string(&op, "value")) else {
                return Ok(None);
            };
            Directive::Status { title }
        }
        "parameter" => {
            let Some(path) = string(&op, "path") else {
                return Ok(None);
            };
            Directive::Parameter {
                path,
                value: op.get("value").cloned().unwrap_or(Value::Null),
            }
        }
        "info" => {
            let Some(name) = string(&op, "name") else {
                return Ok(None);
            };
            let name = name
                .split('.')
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("_");
            Directive::Info {
                name,
                value: op.get("value").cloned().unwrap_or(Value::Null),
            }
        }
        "create-channel" => {
            let Some(name) = string(&op, "name") else {
                return Ok(None);
            };
            let traces = op
                .get("traces")
                .and_then(Value::as_array)
                .map(|t| t.iter().map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())).collect())
                .unwrap_or_else(|| vec![name.clone()]);
            let field = |key: &str| op.get(key).cloned().unwrap_or(Value::Null);
            Directive::CreateChannel {
                channel: Channel {
                    traces,
                    xaxis: field("xaxis"),
                    yaxis: field("yaxis"),
                    layout: field("layout"),
                    last_value: Vec::new(),
                },
                name,
            }
        }
        "batch" | "sample" => {
            let batch = match (number(&op, "current"), number(&op, "total"), number(&op, "size")) {
                (Some(current), Some(total), Some(size)) => Some((current, total, size)),
                _ => None,
            };
            let (step_label, step) = if kind == "batch" {
                ("batch", count(&op, "current"))
            } else {
                ("step", count(&op, "sample"))
            };
            Directive::Batch(BatchProgress {
                step_label,
                step,
                steps: count(&op, "total"),
                batch,
            })
        }
        "channel" => {
            let Some(name) = string(&op, "name") else {
                return Ok(None);
            };
            let y = match op.get("y") {
                Some(Value::Array(items)) => items.iter().filter_map(Value::as_f64).collect(),
                Some(v) => v.as_f64().into_iter().collect(),
                None => Vec::new(),
            };
            Directive::Channel {
                name,
                x: number(&op, "x").unwrap_or(0.0),
                y,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(directive))
}

/// Apply a directive to the job.
pub fn apply_directive(storage: &JobStorage, directive: Directive) -> SyncResult<()> {
    match directive {
        Directive::Iteration { total, iterations } => {
            if let Some(total) = total {
                storage.set_iterations(total)?;
            }
            for iteration in iterations {
                storage.set_iteration(iteration)?;
            }
        }
        Directive::Status { title } => {
            storage.patch_job(JobPatch::Title(title))?;
        }
        Directive::Parameter { path, value } => {
            storage.patch_job(JobPatch::Parameter { path, value })?;
        }
        Directive::Info { name, value } => {
            storage.patch_job(JobPatch::Info { name, value })?;
        }
        Directive::CreateChannel { name, channel } => storage.create_channel(&name, channel)?,
        Directive::Batch(progress) => {
            storage.patch_job(JobPatch::StepLabel(progress.step_label.to_string()))?;
            if let Some(step) = progress.step {
                storage.patch_job(JobPatch::Step(step))?;
            }
            if let Some(steps) = progress.steps {
                storage.patch_job(JobPatch::Steps(steps))?;
            }
            if let Some((current, total, size)) = progress.batch {
                storage.set_batch(current, total, size)?;
            }
        }
        Directive::Channel { name, x, y } => storage.add_channel_value(&name, x, y)?,
    }
    Ok(())
}

/// Line-buffered reader over one instance's output.
pub struct StdoutReader {
    storage: Arc<JobStorage>,
    log_name: String,
    echo: bool,
    buffer: Vec<u8>,
}

impl StdoutReader {
    pub fn new(storage: Arc<JobStorage>, log_name: &str, echo: bool) -> Self {
        Self {
            storage,
            log_name: log_name.to_string(),
            echo,
            buffer: Vec::new(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.handle_line(&String::from_utf8_lossy(&line));
        }
    }

    /// Flush a trailing partial line.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() {
            self.feed(b"\n");
        }
    }

    /// Output that did not come from the task itself (status messages).
    pub fn write_raw(&self, text: &str) {
        self.emit(text);
    }

    fn handle_line(&self, line: &str) {
        let mut visible = line;
        if let Some(start) = find_directive(line) {
            match parse_directive(&line[start..]) {
                Ok(Some(directive)) => {
                    if let Err(e) = apply_directive(&self.storage, directive) {
                        warn!(log = %self.log_name, error = %e, "output directive failed");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(log = %self.log_name, line = %line.trim_end(), error = %e, "invalid output directive"),
            }
            if start == 0 {
                return;
            }
            visible = &line[..start];
        }
        self.emit(visible);
    }

    fn emit(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.echo {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
        self.storage.log(&self.log_name, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_directives_only_at_line_end() {
        assert_eq!(find_directive("{\"trialgrid\": \"epoch\"}\n"), Some(0));
        assert_eq!(find_directive("loss 0.3 {trialgrid: epoch, epoch: 2}\r\n"), Some(9));
        assert_eq!(find_directive("{trialgrid: epoch} trailing\n"), None);
        assert_eq!(find_directive("{\"other\": 1}\n"), None);
    }

    #[test]
    fn iteration_directive_collects_counters() {
        let d = parse_directive("{trialgrid: iteration, total: 10, step: 2, epoch: 3}").unwrap();
        assert_eq!(
            d,
            Some(Directive::Iteration {
                total: Some(10),
                iterations: vec![2, 3]
            })
        );
    }

    #[test]
    fn info_names_flatten_dots() {
        let d = parse_directive("{\"trialgrid\": \"info\", \"name\": \"model..layers.count\", \"value\": 4}").unwrap();
        assert_eq!(
            d,
            Some(Directive::Info {
                name: "model_layers_count".into(),
                value: json!(4)
            })
        );
    }

    #[test]
    fn create_channel_defaults_traces_to_name() {
        let Some(Directive::CreateChannel { name, channel }) =
            parse_directive("{trialgrid: create-channel, name: loss}").unwrap()
        else {
            panic!("expected create-channel");
        };
        assert_eq!(name, "loss");
        assert_eq!(channel.traces, vec!["loss"]);
    }

    #[test]
    fn batch_and_sample_labels() {
        let Some(Directive::Batch(batch)) =
            parse_directive("{trialgrid: batch, current: 5, total: 50, size: 32}").unwrap()
        else {
            panic!("expected batch");
        };
        assert_eq!(batch.step_label, "batch");
        assert_eq!(batch.step, Some(5));
        assert_eq!(batch.batch, Some((5.0, 50.0, 32.0)));

        let Some(Directive::Batch(sample)) = parse_directive("{trialgrid: sample, sample: 7, total: 9}").unwrap() else {
            panic!("expected sample");
        };
        assert_eq!(sample.step_label, "step");
        assert_eq!(sample.step, Some(7));
        assert_eq!(sample.batch, None);
    }

    #[test]
    fn channel_accepts_scalar_or_list() {
        assert_eq!(
            parse_directive("{trialgrid: channel, name: acc, x: 1, y: 0.5}").unwrap(),
            Some(Directive::Channel {
                name: "acc".into(),
                x: 1.0,
                y: vec![0.5]
            })
        );
        assert_eq!(parse_directive("{trialgrid: unknown-kind}").unwrap(), None);
        assert!(parse_directive("{trialgrid: \"unterminated}").is_err());
    }
}
