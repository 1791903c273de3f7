//! C8 — Task Subrecord.
//!
//! An entity's `tasks` property is a map of task id to task data. Rather
//! than replace the whole map wholesale on every update, this reconciles
//! the incoming map against what was tracked before: unchanged entries are
//! left alone, new ones fire `TaskAdded`, and ones that disappear fire
//! `TaskRemoved`. Malformed entries (missing a name) are skipped with a
//! warning rather than failing the whole update.

use std::collections::BTreeMap;

use crate::value::Value;

/// A single in-progress task, as reconciled from the `tasks` property.
#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub progress: f64,
    pub seconds_left: Option<f64>,
}

impl Task {
    fn from_entry(id: &str, value: &Value) -> Result<Task, crate::error::Error> {
        let map = value.as_map().ok_or_else(|| crate::error::Error::TaskMissingName(id.to_string()))?;
        let name = map
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| crate::error::Error::TaskMissingName(id.to_string()))?
            .to_string();
        let progress = map.get("progress").and_then(Value::as_f64).unwrap_or(0.0);
        let seconds_left = map.get("seconds_left").and_then(Value::as_f64);
        Ok(Task { id: id.to_string(), name, progress, seconds_left })
    }
}

/// Reconciles the live task set against a fresh `tasks` property value.
#[derive(Default)]
pub struct TaskTracker {
    tasks: BTreeMap<String, Task>,
}

/// What changed as a result of reconciling one `tasks` update.
#[derive(Default, Debug)]
pub struct TaskDelta {
    pub added: Vec<Task>,
    pub removed: Vec<Task>,
}

impl TaskTracker {
    pub fn new() -> Self {
        TaskTracker::default()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Reconciles against `tasks_property`, which is expected to be a
    /// `Value::Map` of task id to task data. Any other shape (including
    /// `Value::None`, meaning the entity has no outstanding tasks) is
    /// treated as an empty task set. Ids present before and after are
    /// updated in place without firing anything; only a genuinely new id
    /// fires `TaskAdded`, and only an id that drops out fires `TaskRemoved`.
    pub fn reconcile(&mut self, tasks_property: &Value) -> TaskDelta {
        let incoming: Vec<(String, Task)> = match tasks_property.as_map() {
            Some(map) => map
                .iter()
                .filter_map(|(id, value)| match Task::from_entry(id, value) {
                    Ok(task) => Some((id.clone(), task)),
                    Err(err) => {
                        tracing::warn!(%err, task_id = %id, "skipping malformed task entry");
                        None
                    }
                })
                .collect(),
            None => Vec::new(),
        };
        let incoming_ids: std::collections::BTreeSet<&str> = incoming.iter().map(|(id, _)| id.as_str()).collect();

        let mut delta = TaskDelta::default();
        for (id, task) in incoming {
            match self.tasks.get(&id) {
                Some(existing) if *existing == task => {}
                Some(_) => {
                    self.tasks.insert(id, task);
                }
                None => {
                    delta.added.push(task.clone());
                    self.tasks.insert(id, task);
                }
            }
        }

        let removed_ids: Vec<String> =
            self.tasks.keys().filter(|id| !incoming_ids.contains(id.as_str())).cloned().collect();
        for id in removed_ids {
            if let Some(task) = self.tasks.remove(&id) {
                delta.removed.push(task);
            }
        }
        delta
    }
}
