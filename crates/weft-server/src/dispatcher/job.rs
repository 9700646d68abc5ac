use serde_json::{json, Value};
use std::time::Instant;
use tokio::sync::oneshot;
use weft_common::{ExecutionResult, Origin, SessionId, WeftError};

use crate::bridge::{HttpReply, RequestView};
use crate::routes::RouteTarget;
use crate::runtime::{Invocation, ScriptRun};

/// What a job asks the worker to do.
#[derive(Debug)]
pub enum JobKind {
    /// Evaluate raw script text in the persistent scope.
    RawScript { source: String, origin: Origin },
    /// Call a matched route target. The view carries method and path so the
    /// worker can re-match if the handler was replaced meanwhile.
    HandlerInvocation {
        target: RouteTarget,
        request: RequestView,
    },
    ReadState,
    ReplaceState(Value),
    ResetRoutes,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::RawScript { .. } => "script",
            JobKind::HandlerInvocation { .. } => "handler",
            JobKind::ReadState => "read_state",
            JobKind::ReplaceState(_) => "replace_state",
            JobKind::ResetRoutes => "reset_routes",
        }
    }
}

/// Result delivered to the submitter, one variant per job kind plus
/// [`JobOutcome::Failed`] for administrative jobs that could not complete.
#[derive(Debug)]
pub enum JobOutcome {
    Script(ScriptRun),
    Handler(Invocation),
    State(Value),
    StateReplaced,
    RoutesReset(usize),
    Failed(WeftError),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            JobOutcome::Script(run) => run.result.is_success(),
            JobOutcome::Handler(invocation) => invocation.result.is_success(),
            JobOutcome::Failed(_) => false,
            JobOutcome::State(_) | JobOutcome::StateReplaced | JobOutcome::RoutesReset(_) => true,
        }
    }

    /// Outcome for a job whose execution panicked. Keeps the shape the
    /// submitter expects for `kind`.
    pub(crate) fn panicked(kind: &str, message: String) -> Self {
        let message = format!("Worker panicked while running {} job: {}", kind, message);
        match kind {
            "script" => JobOutcome::Script(ScriptRun {
                result: ExecutionResult::failure(message, Vec::new()),
                db_operations: Vec::new(),
            }),
            "handler" => JobOutcome::Handler(Invocation {
                reply: HttpReply::json(500, &json!({ "success": false, "error": message })),
                result: ExecutionResult::failure(message, Vec::new()),
                db_operations: Vec::new(),
            }),
            _ => JobOutcome::Failed(WeftError::JavaScriptExecution(message)),
        }
    }

    /// Converts an outcome of the wrong shape into an error.
    pub(crate) fn into_error(self, expected: &str) -> WeftError {
        match self {
            JobOutcome::Failed(err) => err,
            other => WeftError::JavaScriptExecution(format!(
                "Expected {} outcome, got {:?}",
                expected, other
            )),
        }
    }
}

/// A unit of work owned by the dispatcher from submission to completion.
#[derive(Debug)]
pub struct Job {
    pub id: u64,
    pub session_id: SessionId,
    pub kind: JobKind,
    pub submitted_at: Instant,
    /// `None` for fire-and-forget submissions.
    pub(crate) reply: Option<oneshot::Sender<JobOutcome>>,
}
