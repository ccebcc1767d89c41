//! Data models for the catalogue fetcher.
//!
//! This module contains the core data structures shared by the API client,
//! the batched aggregator and the report output: catalogue entities,
//! task identities, task states and published snapshots.

use crate::error::FetchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of an item that a task is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemKey {
    /// Numeric entity id (investigation ids are numeric).
    Number(i64),
    /// Any other string identity.
    Text(String),
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKey::Number(n) => write!(f, "{}", n),
            ItemKey::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for ItemKey {
    fn from(n: i64) -> Self {
        ItemKey::Number(n)
    }
}

impl From<&str> for ItemKey {
    fn from(s: &str) -> Self {
        ItemKey::Text(s.to_string())
    }
}

impl From<String> for ItemKey {
    fn from(s: String) -> Self {
        ItemKey::Text(s)
    }
}

/// Kind of derived value a task fetches.
///
/// The kind is part of every task identity so aggregators over different
/// derived data never share cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    /// Total file size of an investigation, from the download API.
    InvestigationSize,
    /// Number of datasets in an investigation.
    InvestigationDatasetCount,
}

impl TaskKind {
    /// Returns the fixed tag used in cache keys and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            TaskKind::InvestigationSize => "investigationSize",
            TaskKind::InvestigationDatasetCount => "investigationDatasetCount",
        }
    }

    /// Column heading used when rendering values of this kind.
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::InvestigationSize => "Size",
            TaskKind::InvestigationDatasetCount => "Dataset Count",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Identity of a task: the owning item's key plus the task kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub kind: TaskKind,
    pub key: ItemKey,
}

impl QueryKey {
    pub fn new(kind: TaskKind, key: impl Into<ItemKey>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.kind, self.key)
    }
}

/// Lifecycle state of a single task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState<V> {
    /// Derived but not started yet.
    Pending,
    /// Request outstanding.
    InFlight,
    /// Terminal: fetched value.
    Succeeded(V),
    /// Terminal: last error after retries were exhausted or skipped.
    Failed(FetchError),
}

impl<V> TaskState<V> {
    /// Returns true for `Succeeded` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded(_) | TaskState::Failed(_))
    }
}

/// One task of the current generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Task<V> {
    pub query: QueryKey,
    pub state: TaskState<V>,
}

impl<V> Task<V> {
    pub fn pending(query: QueryKey) -> Self {
        Self {
            query,
            state: TaskState::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns the fetched value, if the task succeeded.
    pub fn value(&self) -> Option<&V> {
        match &self.state {
            TaskState::Succeeded(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the recorded error, if the task failed.
    pub fn error(&self) -> Option<&FetchError> {
        match &self.state {
            TaskState::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// A published result set: the full task list of one generation.
#[derive(Debug, Clone)]
pub struct Snapshot<V> {
    /// Generation the tasks belong to.
    pub generation: u64,
    /// Every task of the generation, in item order. Empty until the first
    /// publish after a reset.
    pub tasks: Vec<Task<V>>,
    /// Number of tasks in the generation.
    pub total: usize,
    /// Terminal task count this snapshot reflects.
    pub completed: usize,
    /// When the snapshot was published.
    pub published_at: DateTime<Utc>,
}

impl<V> Snapshot<V> {
    /// The empty result set exposed right after a reset.
    pub fn empty(generation: u64, total: usize) -> Self {
        Self {
            generation,
            tasks: Vec::new(),
            total,
            completed: 0,
            published_at: Utc::now(),
        }
    }

    /// True when the snapshot holds every task of its generation and all
    /// of them are terminal.
    pub fn is_complete(&self) -> bool {
        self.tasks.len() == self.total && self.tasks.iter().all(Task::is_terminal)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of failed tasks.
    pub fn failed(&self) -> usize {
        self.tasks.iter().filter(|t| t.error().is_some()).count()
    }

    /// Looks up the value fetched for an item.
    pub fn value_for(&self, key: &ItemKey) -> Option<&V> {
        self.tasks
            .iter()
            .find(|t| &t.query.key == key)
            .and_then(Task::value)
    }
}

/// An investigation record as returned by the catalogue API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Investigation {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visit_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    /// Only present when requested with an `include` filter.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub investigation_users: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<serde_json::Value>,
}

/// Format a byte count the way the catalogue tables show sizes.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1000 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    format!("{:.2} {}", value, UNITS[unit])
}
