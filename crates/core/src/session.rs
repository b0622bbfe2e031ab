//! Session data types threaded through item execution
//!
//! A session is one append-only log file produced by a single agent run.
//! The log source hands the engine raw lines plus parsed structured entries;
//! parsing itself happens outside this workspace.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The raw and parsed content of one session log
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionData {
    /// Raw log lines, in file order
    pub lines: Vec<String>,
    /// Parsed structured entries, one per parseable line
    pub entries: Vec<Value>,
}

impl SessionData {
    /// Returns true if the session produced no lines at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Execution context handed to registered items
///
/// Accumulates the values produced by evals and enrichments so that later
/// items (actions, aggregate collect phases) can read cached sibling results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    /// Project the session belongs to
    pub project: String,
    /// Session identifier (file stem of the log)
    pub session_id: String,
    /// Log content for this session
    pub data: SessionData,
    /// Values produced by already-run items, keyed by item name
    pub values: BTreeMap<String, Value>,
}

impl SessionContext {
    /// Create a context for a freshly loaded session
    #[must_use]
    pub fn new(project: impl Into<String>, session_id: impl Into<String>, data: SessionData) -> Self {
        Self {
            project: project.into(),
            session_id: session_id.into(),
            data,
            values: BTreeMap::new(),
        }
    }

    /// Look up a previously computed item value
    #[must_use]
    pub fn value(&self, item_name: &str) -> Option<&Value> {
        self.values.get(item_name)
    }

    /// Record an item's output so later items can consume it
    pub fn record(&mut self, item_name: impl Into<String>, value: Value) {
        self.values.insert(item_name.into(), value);
    }
}

/// One session's contribution to an aggregate view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectedSession {
    /// Project the session belongs to
    pub project: String,
    /// Session identifier
    pub session_id: String,
    /// Per-aggregate collected values, keyed by aggregate name
    pub values: BTreeMap<String, Value>,
}

impl CollectedSession {
    /// Stable key identifying this session across sweeps
    #[must_use]
    pub fn key(&self) -> String {
        session_key(&self.project, &self.session_id)
    }
}

/// Canonical `{project}/{session_id}` key used by the index and cache layers
#[must_use]
pub fn session_key(project: &str, session_id: &str) -> String {
    format!("{project}/{session_id}")
}
