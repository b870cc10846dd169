//! `{{a.b.c}}` substitution in task commands.

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template variable '{0}' is not defined.")]
    Missing(String),

    #[error("invalid template pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Values a command template can reference.
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub config: &'a Map<String, Value>,
    /// `task` or `task_replica` when the task is replicated.
    pub instance_name: String,
}

impl<'a> TemplateContext<'a> {
    pub fn new(config: &'a Map<String, Value>, instance_name: &str) -> Self {
        Self {
            config,
            instance_name: instance_name.to_string(),
        }
    }

    fn lookup(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = match self.config.get(first) {
            Some(value) => value,
            None => {
                return match path {
                    "_name" | "_replica" => Some(Value::from(self.instance_name.as_str())),
                    _ => None,
                };
            }
        };
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        (!current.is_null()).then(|| current.clone())
    }
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Shell-safe rendering of a config value.
pub fn quote_value(value: &Value) -> String {
    match value {
        Value::String(s) => shell_quote(s),
        other => shell_quote(&other.to_string()),
    }
}

fn substitute(template: &str, ctx: &TemplateContext<'_>, strict: bool) -> Result<String, TemplateError> {
    let re = Regex::new(r"\{\{[\sa-zA-Z0-9._-]+\}\}")?;
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for m in re.find_iter(template) {
        out.push_str(&template[last..m.start()]);
        let path: String = m.as_str()[2..m.as_str().len() - 2]
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        match ctx.lookup(&path) {
            Some(value) => out.push_str(&quote_value(&value)),
            None if strict => return Err(TemplateError::Missing(path)),
            None => {
                warn!(variable = %path, "template variable not defined, using ''");
                out.push_str("''");
            }
        }
        last = m.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Substitute every placeholder; an undefined variable is an error.
pub fn render(template: &str, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
    substitute(template, ctx, true)
}

/// Like [`render`] but undefined variables become `''` with a warning.
pub fn render_lenient(template: &str, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
    substitute(template, ctx, false)
}
