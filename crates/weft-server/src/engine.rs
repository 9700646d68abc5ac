use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use weft_common::auth::AuthConfig;
use weft_common::{
    ExecutionRecord, ExecutionResult, Origin, RequestRecord, Result, SessionId, WeftError,
};

use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, StatsSnapshot};
use crate::routes::{RouteInfo, RouteTable, SharedRoutes};
use crate::sinks::{ExecutionSink, MemoryLog, Recorder, RequestLogSink, TracingSink};

/// Where a raw-script session currently stands.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionLookup {
    Finished(ExecutionRecord),
    Pending,
    Unknown,
}

/// Body of the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_ms: u64,
    pub routes: usize,
    pub pending_sessions: usize,
    pub dispatcher: StatsSnapshot,
}

/// Weft engine: the dispatcher, the shared route table and the in-memory
/// histories behind the administrative API.
///
/// One engine owns exactly one script context. Everything the HTTP layer
/// needs hangs off this type, so it is shared as `Arc<Engine>`.
pub struct Engine {
    config: EngineConfig,
    auth: AuthConfig,
    dispatcher: Dispatcher,
    recorder: Recorder,
    executions: Arc<MemoryLog<ExecutionRecord>>,
    requests: Arc<MemoryLog<RequestRecord>>,
    started_at: Instant,
}

impl Engine {
    /// Creates an engine with the built-in sinks only.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration or when the database cannot be
    /// opened.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_sinks(config, Vec::new(), Vec::new())
    }

    /// Creates an engine that additionally feeds the given sinks.
    pub fn with_sinks(
        config: EngineConfig,
        execution_sinks: Vec<Arc<dyn ExecutionSink>>,
        request_sinks: Vec<Arc<dyn RequestLogSink>>,
    ) -> Result<Self> {
        config.validate().map_err(WeftError::InvalidRequest)?;

        let executions = Arc::new(MemoryLog::new(config.history_capacity));
        let requests = Arc::new(MemoryLog::new(config.history_capacity));

        let mut all_execution_sinks = vec![
            executions.clone() as Arc<dyn ExecutionSink>,
            Arc::new(TracingSink) as Arc<dyn ExecutionSink>,
        ];
        all_execution_sinks.extend(execution_sinks);
        let mut all_request_sinks = vec![
            requests.clone() as Arc<dyn RequestLogSink>,
            Arc::new(TracingSink) as Arc<dyn RequestLogSink>,
        ];
        all_request_sinks.extend(request_sinks);

        let recorder = Recorder::spawn(all_execution_sinks, all_request_sinks)?;
        let dispatcher =
            Dispatcher::spawn(RouteTable::shared(), &config.database, recorder.clone())?;

        tracing::info!(
            "Engine ready (timeout {}ms, body limit {} bytes, admin at {})",
            config.response_timeout.as_millis(),
            config.max_body_bytes,
            config.admin_prefix
        );

        Ok(Self {
            config,
            auth: AuthConfig::disabled(),
            dispatcher,
            recorder,
            executions,
            requests,
            started_at: Instant::now(),
        })
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn auth(&self) -> &AuthConfig {
        &self.auth
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn routes(&self) -> &SharedRoutes {
        self.dispatcher.routes()
    }

    /// Point-in-time copy of the route table.
    pub fn route_snapshot(&self) -> Vec<RouteInfo> {
        self.routes()
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .describe()
    }

    pub fn executions(&self) -> &MemoryLog<ExecutionRecord> {
        &self.executions
    }

    pub fn requests(&self) -> &MemoryLog<RequestRecord> {
        &self.requests
    }

    /// Runs `source` and waits up to the configured response timeout.
    pub async fn run_script(
        &self,
        source: impl Into<String>,
        origin: Origin,
    ) -> Result<ExecutionResult> {
        self.dispatcher
            .run_script(source, origin, self.config.response_timeout)
            .await
    }

    /// Loads a script file as a `file` job.
    ///
    /// A script that throws is not an error here; the caller decides what a
    /// failed bootstrap means.
    pub async fn load_script_file(&self, path: &Path) -> Result<ExecutionResult> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            WeftError::InvalidRequest(format!("Failed to load script {}: {}", path.display(), e))
        })?;
        tracing::info!("Loading script {}", path.display());
        self.run_script(source, Origin::File).await
    }

    /// Looks up a raw-script session. Pending is checked first: a session
    /// leaves the pending set only after the history has recorded it.
    pub fn lookup_session(&self, session: &SessionId) -> SessionLookup {
        if self.recorder.pending().contains(session) {
            return SessionLookup::Pending;
        }
        match self.executions.find(|record| record.session_id == *session) {
            Some(record) => SessionLookup::Finished(record),
            None => SessionLookup::Unknown,
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: if self.dispatcher.is_running() { "ok" } else { "degraded" },
            uptime_ms: self.uptime_ms(),
            routes: self.routes().read().unwrap_or_else(PoisonError::into_inner).len(),
            pending_sessions: self.recorder.pending().len(),
            dispatcher: self.dispatcher.stats(),
        }
    }
}
