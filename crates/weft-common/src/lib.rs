//! Weft Common Types and Transport
//!
//! This crate provides the protocol definitions, error type and HTTP helpers
//! shared by the Weft server, client and CLI.
//!
//! # Overview
//!
//! Weft runs externally supplied JavaScript behind a concurrent HTTP server.
//! Every script execution is serialized through a single dispatcher; the types
//! in this crate describe what flows in and out of that dispatcher:
//!
//! - **Protocol Layer**: execution results, console entries, wire envelopes,
//!   execution and request records
//! - **Transport Layer**: hyper response helpers used by the HTTP server
//! - **Auth**: optional API-key protection for administrative endpoints
//!
//! # Example
//!
//! ```
//! use weft_common::{ExecuteEnvelope, ExecutionResult, SessionId};
//! use serde_json::json;
//!
//! let session = SessionId::new();
//! let result = ExecutionResult::success(json!(42), Vec::new());
//! let envelope = ExecuteEnvelope::from_result(session, &result);
//! assert!(envelope.success);
//! ```

pub mod auth;
pub mod protocol;
pub mod transport;

pub use protocol::*;
