//! Wire envelope of the remote script submission endpoint.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::console::ConsoleEntry;
use super::error::WeftError;
use super::records::ExecutionResult;

/// Identifier correlating a raw-script job with its result.
///
/// Generated per job so a caller that submits asynchronously can fetch the
/// outcome later from the execution log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(SessionId)
            .map_err(|e| WeftError::InvalidRequest(format!("Invalid session id '{}': {}", s, e)))
    }
}

/// Response body of `POST {admin}/execute`.
///
/// # Wire Format
///
/// ```json
/// {"success": true, "result": 42, "consoleLog": [...], "sessionID": "..."}
/// {"success": false, "error": "ReferenceError: x is not defined", "sessionID": "..."}
/// ```
///
/// `pending` is only present while an asynchronously submitted session has
/// not finished yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(rename = "consoleLog", default, skip_serializing_if = "Option::is_none")]
    pub console_log: Option<Vec<ConsoleEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending: bool,
}

impl ExecuteEnvelope {
    pub fn from_result(session_id: SessionId, result: &ExecutionResult) -> Self {
        let console_log = if result.console.is_empty() {
            None
        } else {
            Some(result.console.clone())
        };

        match &result.error {
            None => Self {
                success: true,
                result: Some(result.value.clone()),
                console_log,
                error: None,
                session_id,
                pending: false,
            },
            Some(error) => Self {
                success: false,
                result: None,
                console_log,
                error: Some(error.clone()),
                session_id,
                pending: false,
            },
        }
    }

    /// Envelope returned when the caller stopped waiting.
    pub fn timeout(session_id: SessionId, waited_ms: u64) -> Self {
        Self::failure(session_id, WeftError::Timeout(waited_ms).to_string())
    }

    pub fn failure(session_id: SessionId, error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            console_log: None,
            error: Some(error.into()),
            session_id,
            pending: false,
        }
    }

    /// Acknowledgement for an accepted asynchronous submission.
    pub fn accepted(session_id: SessionId) -> Self {
        Self {
            success: true,
            result: None,
            console_log: None,
            error: None,
            session_id,
            pending: true,
        }
    }
}
