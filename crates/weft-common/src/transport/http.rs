//! HTTP Transport Utilities
//!
//! This module builds hyper responses for the administrative API and the
//! error paths of the route layer.
//!
//! # Components
//!
//! - **[`HttpTransport`]**: JSON and envelope response constructors
//! - **[`HyperRequest`]**: Type alias for Hyper incoming requests
//! - **[`HyperResponse`]**: Type alias for Hyper responses
//!
//! # Example
//!
//! ```
//! use weft_common::transport::http::HttpTransport;
//! use hyper::StatusCode;
//! use serde_json::json;
//!
//! let response = HttpTransport::json(StatusCode::OK, &json!({"status": "ok"}));
//! assert_eq!(response.status(), StatusCode::OK);
//! ```

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use serde_json::json;

use crate::protocol::error::WeftError;
use crate::protocol::ExecuteEnvelope;

/// Type alias for Hyper incoming requests
pub type HyperRequest = Request<Incoming>;

/// Type alias for Hyper responses with full body
pub type HyperResponse = Response<Full<Bytes>>;

/// HTTP transport utility functions
pub struct HttpTransport;

impl HttpTransport {
    /// Serializes `value` as a JSON response with the given status.
    ///
    /// Serialization failures degrade to a 500 with a plain error body.
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> HyperResponse {
        match serde_json::to_vec(value) {
            Ok(body) => Self::bytes(status, "application/json", Bytes::from(body)),
            Err(e) => Self::bytes(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain; charset=utf-8",
                Bytes::from(format!("Failed to serialize response: {}", e)),
            ),
        }
    }

    /// Builds a response from raw bytes and a content type.
    pub fn bytes(status: StatusCode, content_type: &str, body: Bytes) -> HyperResponse {
        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        if let Ok(value) = content_type.parse() {
            response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
        }
        response
    }

    /// Serializes an execute envelope with the given status.
    pub fn envelope(status: StatusCode, envelope: &ExecuteEnvelope) -> HyperResponse {
        Self::json(status, envelope)
    }

    /// `{"success": false, "error": "..."}` with the given status.
    pub fn error(status: StatusCode, message: impl AsRef<str>) -> HyperResponse {
        Self::json(
            status,
            &json!({
                "success": false,
                "error": message.as_ref(),
            }),
        )
    }

    /// Maps a [`WeftError`] to its status code and error body.
    pub fn from_error(error: &WeftError) -> HyperResponse {
        let status = StatusCode::from_u16(error.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::error(status, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionId;

    #[test]
    fn test_json_response() {
        let response = HttpTransport::json(StatusCode::OK, &json!({"result": 42}));

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_error_response() {
        let response = HttpTransport::error(StatusCode::NOT_FOUND, "Not found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_from_error_uses_status_code() {
        let response = HttpTransport::from_error(&WeftError::Timeout(100));
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

        let response = HttpTransport::from_error(&WeftError::InvalidState("bad".into()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_envelope_response() {
        let envelope = ExecuteEnvelope::timeout(SessionId::new(), 5);
        let response = HttpTransport::envelope(StatusCode::REQUEST_TIMEOUT, &envelope);
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn test_bytes_response_content_type() {
        let response = HttpTransport::bytes(
            StatusCode::CREATED,
            "text/html; charset=utf-8",
            Bytes::from_static(b"<p>hi</p>"),
        );
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/html; charset=utf-8"
        );
    }
}
