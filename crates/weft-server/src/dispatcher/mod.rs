//! Dispatcher
//!
//! The serialization point between the concurrent HTTP layer and the single
//! script context. One OS thread owns the [`ScriptContext`] and drains an
//! unbounded FIFO queue; any task may submit without blocking.
//!
//! # Job lifecycle
//!
//! ```text
//! Queued -> Running -> Completed(success) | Completed(error)
//!    \
//!     `-> Abandoned (caller timed out; the job still runs when its turn comes)
//! ```
//!
//! Delivery is at-most-once: a caller that stopped waiting simply never sees
//! the outcome. Execution is at-least-once: the worker never skips a queued
//! job. A panicking job is caught and reported like a script error, and the
//! worker keeps going.

mod job;

#[cfg(test)]
mod tests;

pub use job::{Job, JobKind, JobOutcome};

use serde::Serialize;
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use weft_common::{ExecutionRecord, ExecutionResult, Origin, Result, SessionId, WeftError};

use crate::bridge::{HttpReply, RequestView};
use crate::config::DatabaseConfig;
use crate::routes::{RouteTarget, SharedRoutes};
use crate::runtime::{Database, Invocation, ScriptContext};
use crate::sinks::{PendingSessions, Recorder};

/// Counters shared between the worker and submitters.
#[derive(Debug, Default)]
struct DispatcherStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    timed_out: AtomicU64,
    undelivered: AtomicU64,
}

/// Point-in-time view of the dispatcher counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    /// Callers that gave up waiting.
    pub timed_out: u64,
    /// Outcomes the worker could not hand back because nobody was waiting.
    pub undelivered: u64,
    /// Jobs queued or running right now.
    pub in_flight: u64,
}

impl DispatcherStats {
    fn snapshot(&self) -> StatsSnapshot {
        let submitted = self.submitted.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let panicked = self.panicked.load(Ordering::Relaxed);
        StatsSnapshot {
            submitted,
            completed,
            failed,
            panicked,
            timed_out: self.timed_out.load(Ordering::Relaxed),
            undelivered: self.undelivered.load(Ordering::Relaxed),
            in_flight: submitted.saturating_sub(completed + failed),
        }
    }
}

/// Waiting side of a submitted job.
#[derive(Debug)]
pub struct JobTicket {
    id: u64,
    session_id: SessionId,
    receiver: oneshot::Receiver<JobOutcome>,
    stats: Arc<DispatcherStats>,
}

impl JobTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Waits for the outcome. On timeout the job is abandoned, not
    /// cancelled: it still runs later, and its outcome is discarded.
    ///
    /// # Errors
    ///
    /// - `WeftError::Timeout` if nothing arrived within `timeout`
    /// - `WeftError::DispatcherUnavailable` if the worker dropped the job
    pub async fn wait(self, timeout: Duration) -> Result<JobOutcome> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(WeftError::DispatcherUnavailable(format!(
                "job {} was dropped by the worker",
                self.id
            ))),
            Err(_) => {
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Job {} (session {}) abandoned after {}ms",
                    self.id,
                    self.session_id,
                    timeout.as_millis()
                );
                Err(WeftError::Timeout(timeout.as_millis() as u64))
            }
        }
    }
}

/// Handle to the dispatcher worker. Cheap to clone; the worker stops once
/// every handle is dropped and the queue is drained.
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::UnboundedSender<Job>,
    routes: SharedRoutes,
    pending: PendingSessions,
    stats: Arc<DispatcherStats>,
    next_id: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Spawns the worker thread and waits until its script context is ready.
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot be spawned, the database cannot be opened,
    /// or the bindings fail to install.
    pub fn spawn(
        routes: SharedRoutes,
        database: &DatabaseConfig,
        recorder: Recorder,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);
        let stats = Arc::new(DispatcherStats::default());
        let pending = recorder.pending().clone();

        let worker_routes = routes.clone();
        let worker_stats = stats.clone();
        let database = database.clone();

        std::thread::Builder::new()
            .name("weft-dispatcher".to_string())
            .spawn(move || {
                let context = match Database::open(&database)
                    .and_then(|db| ScriptContext::new(worker_routes, db))
                {
                    Ok(context) => {
                        let _ = init_tx.send(Ok(()));
                        context
                    }
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };
                run_worker(context, receiver, worker_stats, recorder);
            })
            .map_err(WeftError::Io)?;

        match init_rx.recv() {
            Ok(Ok(())) => {
                info!("Dispatcher worker started");
                Ok(Self {
                    sender,
                    routes,
                    pending,
                    stats,
                    next_id: Arc::new(AtomicU64::new(0)),
                })
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(WeftError::DispatcherUnavailable(
                "worker thread exited during initialization".to_string(),
            )),
        }
    }

    pub fn routes(&self) -> &SharedRoutes {
        &self.routes
    }

    pub fn pending(&self) -> &PendingSessions {
        &self.pending
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    fn enqueue(
        &self,
        kind: JobKind,
        reply: Option<oneshot::Sender<JobOutcome>>,
    ) -> Result<(u64, SessionId)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session_id = SessionId::new();
        let is_script = matches!(kind, JobKind::RawScript { .. });
        if is_script {
            self.pending.insert(session_id);
        }

        debug!("Queueing {} job {} (session {})", kind.name(), id, session_id);
        let job = Job {
            id,
            session_id,
            kind,
            submitted_at: Instant::now(),
            reply,
        };

        if self.sender.send(job).is_err() {
            if is_script {
                self.pending.remove(&session_id);
            }
            return Err(WeftError::DispatcherUnavailable(
                "dispatcher worker is not running".to_string(),
            ));
        }
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok((id, session_id))
    }

    /// Queues a job and returns a ticket to wait on. Never blocks.
    ///
    /// # Errors
    ///
    /// `WeftError::DispatcherUnavailable` if the worker is gone.
    pub fn submit(&self, kind: JobKind) -> Result<JobTicket> {
        let (reply, receiver) = oneshot::channel();
        let (id, session_id) = self.enqueue(kind, Some(reply))?;
        Ok(JobTicket {
            id,
            session_id,
            receiver,
            stats: self.stats.clone(),
        })
    }

    /// Queues a job nobody will wait for. Raw-script results are still
    /// recorded and can be looked up by the returned session id.
    pub fn submit_detached(&self, kind: JobKind) -> Result<SessionId> {
        self.enqueue(kind, None).map(|(_, session_id)| session_id)
    }

    pub async fn run_script(
        &self,
        source: impl Into<String>,
        origin: Origin,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let kind = JobKind::RawScript {
            source: source.into(),
            origin,
        };
        match self.submit(kind)?.wait(timeout).await? {
            JobOutcome::Script(run) => Ok(run.result),
            other => Err(other.into_error("script")),
        }
    }

    pub async fn invoke(
        &self,
        target: RouteTarget,
        request: RequestView,
        timeout: Duration,
    ) -> Result<Invocation> {
        match self
            .submit(JobKind::HandlerInvocation { target, request })?
            .wait(timeout)
            .await?
        {
            JobOutcome::Handler(invocation) => Ok(invocation),
            other => Err(other.into_error("handler")),
        }
    }

    pub async fn read_state(&self, timeout: Duration) -> Result<Value> {
        match self.submit(JobKind::ReadState)?.wait(timeout).await? {
            JobOutcome::State(state) => Ok(state),
            other => Err(other.into_error("state")),
        }
    }

    pub async fn replace_state(&self, state: Value, timeout: Duration) -> Result<()> {
        match self.submit(JobKind::ReplaceState(state))?.wait(timeout).await? {
            JobOutcome::StateReplaced => Ok(()),
            other => Err(other.into_error("state replacement")),
        }
    }

    pub async fn reset_routes(&self, timeout: Duration) -> Result<usize> {
        match self.submit(JobKind::ResetRoutes)?.wait(timeout).await? {
            JobOutcome::RoutesReset(removed) => Ok(removed),
            other => Err(other.into_error("route reset")),
        }
    }
}

fn run_worker(
    mut context: ScriptContext,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    stats: Arc<DispatcherStats>,
    recorder: Recorder,
) {
    while let Some(job) = receiver.blocking_recv() {
        let Job {
            id,
            session_id,
            kind,
            submitted_at,
            reply,
        } = job;

        let name = kind.name();
        let script = match &kind {
            JobKind::RawScript { source, origin } => Some((source.clone(), *origin)),
            _ => None,
        };

        debug!(
            "Running {} job {} after {:.2}ms in queue",
            name,
            id,
            submitted_at.elapsed().as_secs_f64() * 1000.0
        );
        let started = Instant::now();

        let outcome = match catch_unwind(AssertUnwindSafe(|| execute(&mut context, kind))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                stats.panicked.fetch_add(1, Ordering::Relaxed);
                let message = panic_message(payload.as_ref());
                error!("Job {} panicked: {}", id, message);
                JobOutcome::panicked(name, message)
            }
        };

        let counter = if outcome.is_success() {
            &stats.completed
        } else {
            &stats.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Finished {} job {} in {:.2}ms",
            name,
            id,
            started.elapsed().as_secs_f64() * 1000.0
        );

        if let (Some((source, origin)), JobOutcome::Script(run)) = (script, &outcome) {
            let record = ExecutionRecord::new(session_id, source, origin, &run.result);
            recorder.record_execution(record);
        }

        if let Some(reply) = reply {
            if reply.send(outcome).is_err() {
                stats.undelivered.fetch_add(1, Ordering::Relaxed);
                warn!("Job {} finished after its caller stopped waiting", id);
            }
        }
    }

    info!("Dispatcher worker stopped");
}

fn execute(context: &mut ScriptContext, kind: JobKind) -> JobOutcome {
    match kind {
        JobKind::RawScript { source, .. } => JobOutcome::Script(context.run_script(&source)),
        JobKind::HandlerInvocation { target, request } => {
            JobOutcome::Handler(invoke_current(context, target, request))
        }
        JobKind::ReadState => match context.read_state() {
            Ok(state) => JobOutcome::State(state),
            Err(err) => JobOutcome::Failed(err),
        },
        JobKind::ReplaceState(state) => match context.replace_state(&state) {
            Ok(()) => JobOutcome::StateReplaced,
            Err(err) => JobOutcome::Failed(err),
        },
        JobKind::ResetRoutes => JobOutcome::RoutesReset(context.reset_routes()),
    }
}

/// Invokes `target`, re-matching the request first if the handler was
/// replaced or cleared after the HTTP layer matched it.
fn invoke_current(
    context: &mut ScriptContext,
    target: RouteTarget,
    request: RequestView,
) -> Invocation {
    if context.has_handler(target.handler_id()) {
        return context.invoke(&target, &request);
    }

    match context.rematch(request.method, &request.path) {
        Some((current, params)) => {
            debug!("Re-matched {} {} to {}", request.method, request.path, current.handler_id());
            let request = request.with_params(params);
            context.invoke(&current, &request)
        }
        None => {
            let message = format!("No route for {} {}", request.method, request.path);
            Invocation {
                reply: HttpReply::json(404, &json!({ "success": false, "error": message })),
                result: ExecutionResult::failure(message, Vec::new()),
                db_operations: Vec::new(),
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
