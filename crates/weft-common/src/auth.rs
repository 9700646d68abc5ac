//! API key protection for the administrative endpoints.
//!
//! Administrative routes (remote execution, state replacement, route reset)
//! can rewrite everything a script registered, so a server exposed beyond
//! localhost should set an API key. Script-registered routes are never
//! guarded; scripts implement their own checks.
//!
//! Keys are compared in constant time. A missing or wrong key is answered
//! with HTTP 401 by the server.
//!
//! # Example
//!
//! ```
//! use weft_common::auth::AuthConfig;
//!
//! let auth = AuthConfig::with_api_key("my-secret-key-12345");
//! assert!(auth.validate_api_key(Some("my-secret-key-12345")));
//! assert!(!auth.validate_api_key(None));
//! ```

use std::fmt;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    api_key: Option<String>,
}

impl AuthConfig {
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn requires_auth(&self) -> bool {
        self.api_key.is_some()
    }

    /// Checks a key taken from the request; always true when auth is off.
    pub fn validate_api_key(&self, provided_key: Option<&str>) -> bool {
        match (&self.api_key, provided_key) {
            (None, _) => true,
            (Some(expected), Some(provided)) => constant_time_eq(expected, provided),
            (Some(_), None) => false,
        }
    }

    /// Validates the `X-API-Key` header of a request.
    pub fn authorize(&self, headers: &hyper::HeaderMap) -> bool {
        let provided = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok());
        self.validate_api_key(provided)
    }
}

impl fmt::Display for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.api_key {
            Some(_) => write!(f, "ApiKey(*****)"),
            None => write!(f, "Disabled"),
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
