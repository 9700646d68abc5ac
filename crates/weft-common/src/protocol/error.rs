use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeftError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid route pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("JavaScript execution error: {0}")]
    JavaScriptExecution(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Dispatcher unavailable: {0}")]
    DispatcherUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl WeftError {
    /// HTTP status code used when this error reaches the HTTP boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            WeftError::InvalidRequest(_)
            | WeftError::InvalidPattern { .. }
            | WeftError::InvalidState(_)
            | WeftError::JsonSerialization(_) => 400,
            WeftError::NotFound(_) => 404,
            WeftError::Timeout(_) => 408,
            WeftError::DispatcherUnavailable(_) => 503,
            _ => 500,
        }
    }
}

impl From<std::net::AddrParseError> for WeftError {
    fn from(err: std::net::AddrParseError) -> Self {
        WeftError::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;
