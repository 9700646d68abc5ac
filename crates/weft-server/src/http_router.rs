//! HTTP Router for the Weft engine
//!
//! Every inbound request ends up here. Paths under the admin prefix are
//! served by the built-in administrative endpoints; everything else is
//! matched against the script-registered route table and handed to the
//! dispatcher.
//!
//! # Administrative endpoints
//!
//! | method & path              | purpose                                  |
//! |----------------------------|------------------------------------------|
//! | `POST /execute`            | run a script (`?async=true` to not wait)  |
//! | `GET /executions`          | recent execution records (`?limit=n`)     |
//! | `GET /executions/:session` | result of one session                     |
//! | `GET /state`               | global state snapshot                     |
//! | `PUT`/`POST /state`        | replace the global state                  |
//! | `GET /routes`              | route table snapshot                      |
//! | `POST /routes/reset`       | clear the route table                     |
//! | `GET /requests`            | recent request-log records                |
//! | `GET /health`              | uptime and dispatcher counters            |
//!
//! Malformed input is answered at this boundary and never enqueued.

use chrono::Utc;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use tracing::{debug, warn};
use weft_common::transport::{HttpTransport, HyperResponse};
use weft_common::{
    ConsoleEntry, DbOperation, ExecuteEnvelope, ExecutionResult, HttpMethod, Origin, RequestRecord,
    SessionId, WeftError,
};

use crate::bridge::{parse_query, HttpReply, RequestView};
use crate::dispatcher::{JobKind, JobOutcome};
use crate::engine::{Engine, SessionLookup};
use crate::runtime::{Invocation, ScriptRun};

const DEFAULT_LIST_LIMIT: usize = 50;

/// Console output and database calls of the job that served a request.
#[derive(Debug, Default)]
struct JobActivity {
    console: Vec<ConsoleEntry>,
    db_operations: Vec<DbOperation>,
}

impl From<Invocation> for JobActivity {
    fn from(invocation: Invocation) -> Self {
        Self {
            console: invocation.result.console,
            db_operations: invocation.db_operations,
        }
    }
}

impl From<ScriptRun> for JobActivity {
    fn from(run: ScriptRun) -> Self {
        Self {
            console: run.result.console,
            db_operations: run.db_operations,
        }
    }
}

/// Routes requests to the admin API or to script handlers.
pub struct EngineRouter {
    engine: Arc<Engine>,
}

impl EngineRouter {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Serves one request and hands a request-log record to the sinks.
    pub async fn handle<B>(&self, req: Request<B>, remote: Option<SocketAddr>) -> HyperResponse
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let started = Instant::now();
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();

        let limit = self.engine.config().max_body_bytes;
        let (response, activity) = match read_body(body, limit).await {
            Err(response) => (response, JobActivity::default()),
            Ok(body) => match self.admin_path(&path) {
                Some(endpoint) => self.handle_admin(&parts, endpoint, body).await,
                None => self.handle_route(&parts, body, remote).await,
            },
        };

        self.engine.recorder().record_request(RequestRecord {
            method: parts.method.to_string(),
            path,
            status: response.status().as_u16(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            remote_addr: remote.map(|addr| addr.to_string()),
            console: activity.console,
            db_operations: activity.db_operations,
            timestamp: Utc::now(),
        });

        response
    }

    /// The endpoint part of `path` when it lies under the admin prefix.
    fn admin_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.engine.config().admin_prefix.as_str())?;
        if rest.is_empty() {
            Some("/")
        } else if rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    async fn handle_route(
        &self,
        parts: &Parts,
        body: Bytes,
        remote: Option<SocketAddr>,
    ) -> (HyperResponse, JobActivity) {
        let path = parts.uri.path();
        let found = HttpMethod::try_from(&parts.method).ok().and_then(|method| {
            self.engine
                .routes()
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .find(method, path)
                .map(|found| (method, found))
        });

        let Some((method, found)) = found else {
            debug!("No route for {} {}", parts.method, path);
            let message = format!("Route not found: {} {}", parts.method, path);
            return (
                HttpTransport::error(StatusCode::NOT_FOUND, message),
                JobActivity::default(),
            );
        };

        debug!("{} {} matched {} ({})", method, path, found.pattern, found.target.handler_id());
        let request = RequestView::from_parts(method, &parts.uri, &parts.headers, &body, remote)
            .with_params(found.params);

        match self
            .engine
            .dispatcher()
            .invoke(found.target, request, self.engine.config().response_timeout)
            .await
        {
            Ok(invocation) => (reply_to_response(&invocation.reply), invocation.into()),
            Err(err) => (HttpTransport::from_error(&err), JobActivity::default()),
        }
    }

    async fn handle_admin(
        &self,
        parts: &Parts,
        endpoint: &str,
        body: Bytes,
    ) -> (HyperResponse, JobActivity) {
        if !self.engine.auth().authorize(&parts.headers) {
            let response =
                HttpTransport::error(StatusCode::UNAUTHORIZED, "Missing or invalid API key");
            return (response, JobActivity::default());
        }

        let query = parse_query(parts.uri.query().unwrap_or_default());
        let endpoint = match endpoint.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };

        let response = match (&parts.method, endpoint) {
            (&Method::POST, "/execute") => return self.execute(body, &query).await,
            (&Method::GET, "/executions") => HttpTransport::json(
                StatusCode::OK,
                &self.engine.executions().recent(list_limit(&query)),
            ),
            (&Method::GET, session) if session.starts_with("/executions/") => {
                self.execution(&session["/executions/".len()..])
            }
            (&Method::GET, "/state") => {
                match self.engine.dispatcher().read_state(self.timeout()).await {
                    Ok(state) => HttpTransport::json(StatusCode::OK, &state),
                    Err(err) => HttpTransport::from_error(&err),
                }
            }
            (&Method::PUT | &Method::POST, "/state") => self.replace_state(&body).await,
            (&Method::GET, "/routes") => {
                HttpTransport::json(StatusCode::OK, &self.engine.route_snapshot())
            }
            (&Method::POST, "/routes/reset") => {
                match self.engine.dispatcher().reset_routes(self.timeout()).await {
                    Ok(removed) => HttpTransport::json(
                        StatusCode::OK,
                        &json!({ "success": true, "removed": removed }),
                    ),
                    Err(err) => HttpTransport::from_error(&err),
                }
            }
            (&Method::GET, "/requests") => HttpTransport::json(
                StatusCode::OK,
                &self.engine.requests().recent(list_limit(&query)),
            ),
            (&Method::GET, "/health") => HttpTransport::json(StatusCode::OK, &self.engine.health()),
            (method, endpoint) => HttpTransport::error(
                StatusCode::NOT_FOUND,
                format!("Unknown admin endpoint: {} {}", method, endpoint),
            ),
        };
        (response, JobActivity::default())
    }

    async fn execute(
        &self,
        body: Bytes,
        query: &Map<String, Value>,
    ) -> (HyperResponse, JobActivity) {
        let source = match std::str::from_utf8(&body) {
            Ok(source) if !source.trim().is_empty() => source.to_string(),
            Ok(_) => {
                let response =
                    HttpTransport::error(StatusCode::BAD_REQUEST, "Script body is empty");
                return (response, JobActivity::default());
            }
            Err(_) => {
                let response =
                    HttpTransport::error(StatusCode::BAD_REQUEST, "Script body must be UTF-8");
                return (response, JobActivity::default());
            }
        };
        let kind = JobKind::RawScript {
            source,
            origin: Origin::Api,
        };
        let dispatcher = self.engine.dispatcher();

        if flag(query, "async") {
            let response = match dispatcher.submit_detached(kind) {
                Ok(session) => HttpTransport::envelope(
                    StatusCode::ACCEPTED,
                    &ExecuteEnvelope::accepted(session),
                ),
                Err(err) => HttpTransport::from_error(&err),
            };
            return (response, JobActivity::default());
        }

        let ticket = match dispatcher.submit(kind) {
            Ok(ticket) => ticket,
            Err(err) => return (HttpTransport::from_error(&err), JobActivity::default()),
        };
        let session = ticket.session_id();

        let response = match ticket.wait(self.timeout()).await {
            Ok(JobOutcome::Script(run)) => {
                let response = envelope_response(session, &run.result);
                return (response, run.into());
            }
            Ok(other) => {
                let err = other.into_error("script");
                failure_envelope(session, &err)
            }
            Err(WeftError::Timeout(waited_ms)) => HttpTransport::envelope(
                StatusCode::REQUEST_TIMEOUT,
                &ExecuteEnvelope::timeout(session, waited_ms),
            ),
            Err(err) => failure_envelope(session, &err),
        };
        (response, JobActivity::default())
    }

    fn execution(&self, session: &str) -> HyperResponse {
        let session: SessionId = match session.parse() {
            Ok(session) => session,
            Err(err) => return HttpTransport::from_error(&err),
        };

        match self.engine.lookup_session(&session) {
            SessionLookup::Finished(record) => HttpTransport::envelope(
                StatusCode::OK,
                &ExecuteEnvelope::from_result(session, &record.to_result()),
            ),
            SessionLookup::Pending => {
                HttpTransport::envelope(StatusCode::ACCEPTED, &ExecuteEnvelope::accepted(session))
            }
            SessionLookup::Unknown => HttpTransport::error(
                StatusCode::NOT_FOUND,
                format!("Unknown session {}", session),
            ),
        }
    }

    async fn replace_state(&self, body: &Bytes) -> HyperResponse {
        let state: Value = match serde_json::from_slice(body) {
            Ok(state) => state,
            Err(err) => {
                let message = format!("Invalid JSON: {}", err);
                return HttpTransport::error(StatusCode::BAD_REQUEST, message);
            }
        };
        if !state.is_object() {
            return HttpTransport::error(StatusCode::BAD_REQUEST, "State must be a JSON object");
        }

        match self.engine.dispatcher().replace_state(state, self.timeout()).await {
            Ok(()) => HttpTransport::json(StatusCode::OK, &json!({ "success": true })),
            Err(err) => HttpTransport::from_error(&err),
        }
    }

    fn timeout(&self) -> std::time::Duration {
        self.engine.config().response_timeout
    }
}

async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, HyperResponse>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => Err(HttpTransport::error(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("Request body exceeds {} bytes", limit),
        )),
        Err(err) => Err(HttpTransport::error(
            StatusCode::BAD_REQUEST,
            format!("Failed to read request body: {}", err),
        )),
    }
}

/// Writes a finished handler reply as the native response.
fn reply_to_response(reply: &HttpReply) -> HyperResponse {
    let mut response = Response::new(Full::new(reply.body.clone()));
    *response.status_mut() =
        StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let headers = response.headers_mut();
    for (name, value) in &reply.headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!("Dropping invalid response header {:?}", name),
        }
    }
    response
}

fn envelope_response(session: SessionId, result: &ExecutionResult) -> HyperResponse {
    let status = if result.is_success() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    HttpTransport::envelope(status, &ExecuteEnvelope::from_result(session, result))
}

fn failure_envelope(session: SessionId, err: &WeftError) -> HyperResponse {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpTransport::envelope(status, &ExecuteEnvelope::failure(session, err.to_string()))
}

fn list_limit(query: &Map<String, Value>) -> usize {
    query
        .get("limit")
        .and_then(Value::as_str)
        .and_then(|limit| limit.parse().ok())
        .unwrap_or(DEFAULT_LIST_LIMIT)
}

fn flag(query: &Map<String, Value>, name: &str) -> bool {
    matches!(query.get(name).and_then(Value::as_str), Some("true" | "1"))
}
