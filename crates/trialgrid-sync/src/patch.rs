//! Pending job-document writes, collapsed by path.
//!
//! ```text
//!   enqueue("tasks.t.instances.0.status", v)
//!     ├─ pending ancestor "tasks.t"        ──► fold v into it      (Folded)
//!     ├─ pending op at the same path       ──► replace its value   (Replaced)
//!     └─ otherwise  drop pending descendants, append new op        (Appended)
//! ```
//!
//! "Pending" means not currently being sent. Ops in flight are never
//! touched; a later write to the same region is appended behind them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// One write to the job document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub id: u64,
    pub path: String,
    pub value: Value,
    #[serde(default)]
    pub sending: bool,
}

/// What `enqueue` did with a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Appended(u64),
    Replaced(u64),
    /// Merged into the pending ancestor op with this id.
    Folded(u64),
}

/// Ops handed out by [`PatchQueue::begin_send`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendBatch {
    pub ids: Vec<u64>,
    pub patches: Map<String, Value>,
}

impl SendBatch {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PatchQueue {
    next_id: u64,
    ops: BTreeMap<u64, PatchOperation>,
    /// Latest op per path.
    by_path: BTreeMap<String, u64>,
}

impl PatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn enqueue(&mut self, path: &str, value: Value) -> Enqueued {
        if let Some((ancestor, sub_path)) = self.pending_ancestor(path) {
            if let Some(op) = self.ops.get_mut(&ancestor) {
                set_path(&mut op.value, &sub_path, value);
                return Enqueued::Folded(ancestor);
            }
        }

        if let Some(id) = self.by_path.get(path).copied() {
            if let Some(op) = self.ops.get_mut(&id).filter(|op| !op.sending) {
                op.value = value;
                return Enqueued::Replaced(id);
            }
        }

        let superseded = self.pending_descendants(path);
        for id in &superseded {
            if let Some(op) = self.ops.remove(id) {
                self.unindex(&op.path, *id);
            }
        }
        if !superseded.is_empty() {
            debug!(%path, dropped = superseded.len(), "pending descendant ops superseded");
        }

        let id = self.next_id;
        self.next_id += 1;
        self.ops.insert(
            id,
            PatchOperation {
                id,
                path: path.to_string(),
                value,
                sending: false,
            },
        );
        self.by_path.insert(path.to_string(), id);
        Enqueued::Appended(id)
    }

    /// Nearest pending op whose path is a strict prefix of `path`, with the
    /// remaining sub-path.
    fn pending_ancestor(&self, path: &str) -> Option<(u64, String)> {
        let mut prefix_end = Vec::new();
        for (i, c) in path.char_indices() {
            if c == '.' {
                prefix_end.push(i);
            }
        }
        prefix_end.into_iter().rev().find_map(|end| {
            let id = *self.by_path.get(&path[..end])?;
            let op = self.ops.get(&id)?;
            (!op.sending).then(|| (id, path[end + 1..].to_string()))
        })
    }

    fn pending_descendants(&self, path: &str) -> Vec<u64> {
        let prefix = format!("{path}.");
        self.by_path
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(_, id)| self.ops.get(id).is_some_and(|op| !op.sending))
            .map(|(_, id)| *id)
            .collect()
    }

    fn unindex(&mut self, path: &str, id: u64) {
        if self.by_path.get(path) == Some(&id) {
            self.by_path.remove(path);
        }
    }

    /// Mark every op as sending and return them as one patch map.
    ///
    /// When an op targets an ancestor of an earlier op, the earlier one is
    /// left out of the map since the newer value covers it.
    pub fn begin_send(&mut self) -> SendBatch {
        let mut batch = SendBatch::default();
        for op in self.ops.values_mut() {
            op.sending = true;
            let prefix = format!("{}.", op.path);
            batch.patches.retain(|p, _| !p.starts_with(&prefix));
            batch.patches.insert(op.path.clone(), op.value.clone());
            batch.ids.push(op.id);
        }
        batch
    }

    pub fn ack(&mut self, ids: &[u64]) {
        for id in ids {
            if let Some(op) = self.ops.remove(id) {
                self.unindex(&op.path, *id);
            }
        }
    }

    pub fn nack(&mut self, ids: &[u64]) {
        for id in ids {
            if let Some(op) = self.ops.get_mut(id) {
                op.sending = false;
            }
        }
    }

    /// Replace the queue contents with journaled ops.
    pub fn restore(&mut self, ops: Vec<PatchOperation>) {
        self.ops.clear();
        self.by_path.clear();
        for mut op in ops {
            op.sending = false;
            self.next_id = self.next_id.max(op.id + 1);
            self.by_path.insert(op.path.clone(), op.id);
            self.ops.insert(op.id, op);
        }
    }

    pub fn snapshot(&self) -> Vec<PatchOperation> {
        self.ops.values().cloned().collect()
    }
}

/// Write `value` at a dot-path inside `target`, creating objects on the
/// way. Numeric segments index into existing arrays.
pub fn set_path(target: &mut Value, path: &str, value: Value) {
    if path.is_empty() {
        *target = value;
        return;
    }
    let segments: Vec<&str> = path.split('.').collect();
    set_segments(target, &segments, value);
}

fn set_segments(target: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *target = value;
        return;
    };
    if let Value::Array(items) = target {
        if let Some(item) = head.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
            set_segments(item, rest, value);
            return;
        }
    }
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        let child = map.entry(head.to_string()).or_insert(Value::Null);
        set_segments(child, rest, value);
    }
}
