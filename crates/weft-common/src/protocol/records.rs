//! Execution results and the records handed to persistence collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::console::{render_console, ConsoleEntry};
use super::envelope::SessionId;

/// Where a raw script came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Interactive,
    Api,
    Bootstrap,
    File,
}

/// Outcome of one job: produced exactly once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub value: serde_json::Value,
    pub console: Vec<ConsoleEntry>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(value: serde_json::Value, console: Vec<ConsoleEntry>) -> Self {
        Self {
            value,
            console,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>, console: Vec<ConsoleEntry>) -> Self {
        Self {
            value: serde_json::Value::Null,
            console,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One `db.query` / `db.exec` call made by a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbOperation {
    pub sql: String,
    pub duration_ms: f64,
    pub rows: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Immutable record of a finished raw-script job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub session_id: SessionId,
    pub source: String,
    /// Serialized JSON of the returned value (`null` on failure).
    pub result: String,
    pub console: String,
    /// Error text, empty on success.
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub origin: Origin,
    /// Structured console entries, kept so the envelope can be rebuilt.
    #[serde(default)]
    pub console_entries: Vec<ConsoleEntry>,
}

impl ExecutionRecord {
    pub fn new(
        session_id: SessionId,
        source: impl Into<String>,
        origin: Origin,
        result: &ExecutionResult,
    ) -> Self {
        Self {
            session_id,
            source: source.into(),
            result: result.value.to_string(),
            console: render_console(&result.console),
            error: result.error.clone().unwrap_or_default(),
            timestamp: Utc::now(),
            origin,
            console_entries: result.console.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }

    /// Rebuilds the execution result this record was made from.
    pub fn to_result(&self) -> ExecutionResult {
        if self.is_success() {
            let value = serde_json::from_str(&self.result).unwrap_or(serde_json::Value::Null);
            ExecutionResult::success(value, self.console_entries.clone())
        } else {
            ExecutionResult::failure(self.error.clone(), self.console_entries.clone())
        }
    }
}

/// Record of one served HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub console: Vec<ConsoleEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub db_operations: Vec<DbOperation>,
    pub timestamp: DateTime<Utc>,
}
