//! Weft Server
//!
//! Runs externally supplied JavaScript (Boa) behind a concurrent hyper
//! server. Scripts register routes, keep data in a shared `state` object and
//! an embedded SQLite store; every execution is serialized through one
//! [`Dispatcher`] worker that owns the interpreter.

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod http_router;
pub mod http_server;
pub mod routes;
pub mod runtime;
pub mod sinks;

pub use config::{DatabaseConfig, EngineConfig};
pub use dispatcher::{Dispatcher, JobKind, JobOutcome, JobTicket, StatsSnapshot};
pub use engine::{Engine, HealthReport, SessionLookup};
pub use http_router::EngineRouter;
pub use http_server::HttpServer;
pub use routes::{RouteInfo, RouteTable, SharedRoutes};
pub use sinks::{ExecutionSink, MemoryLog, Recorder, RequestLogSink, TracingSink};
