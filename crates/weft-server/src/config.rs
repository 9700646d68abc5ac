//! Engine configuration.
//!
//! Limits and knobs for the HTTP boundary and the script runtime. Boa offers
//! no memory or CPU quotas, so only the caller-side response timeout bounds
//! how long a request waits for the dispatcher.

use std::path::PathBuf;
use std::time::Duration;

/// Where the script-visible `db` object keeps its data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DatabaseConfig {
    /// Private in-memory SQLite database, lost on restart.
    #[default]
    InMemory,
    /// SQLite database file, created on first use.
    File(PathBuf),
}

/// Configuration for an [`Engine`](crate::Engine).
///
/// # Example
///
/// ```
/// use weft_server::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::new()
///     .with_response_timeout(Duration::from_secs(5))
///     .with_max_body_bytes(64 * 1024);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// How long an HTTP caller waits for its job before answering 408.
    pub response_timeout: Duration,
    /// Largest accepted request body; larger bodies are answered with 413.
    pub max_body_bytes: usize,
    /// Path prefix of the administrative endpoints.
    pub admin_prefix: String,
    /// Entries kept by each in-memory history log.
    pub history_capacity: usize,
    pub database: DatabaseConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            max_body_bytes: 1024 * 1024,
            admin_prefix: "/_api".to_string(),
            history_capacity: 500,
            database: DatabaseConfig::InMemory,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    pub fn with_admin_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.admin_prefix = prefix.into();
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_database(mut self, database: DatabaseConfig) -> Self {
        self.database = database;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found:
    /// - response timeout is zero or longer than one hour
    /// - body limit or history capacity is zero
    /// - admin prefix does not start with `/`, or ends with `/`
    pub fn validate(&self) -> Result<(), String> {
        if self.response_timeout.is_zero() {
            return Err("response timeout must be greater than zero".to_string());
        }

        if self.response_timeout.as_secs() > 3600 {
            return Err(format!(
                "response timeout must be <= 1 hour (got {} seconds)",
                self.response_timeout.as_secs()
            ));
        }

        if self.max_body_bytes == 0 {
            return Err("max body size must be greater than zero".to_string());
        }

        if self.history_capacity == 0 {
            return Err("history capacity must be greater than zero".to_string());
        }

        if !self.admin_prefix.starts_with('/') || self.admin_prefix.len() < 2 {
            return Err(format!(
                "admin prefix must start with '/' and name a path (got '{}')",
                self.admin_prefix
            ));
        }

        if self.admin_prefix.ends_with('/') {
            return Err(format!(
                "admin prefix must not end with '/' (got '{}')",
                self.admin_prefix
            ));
        }

        Ok(())
    }
}
