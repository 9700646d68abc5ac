pub mod console;
pub mod envelope;
pub mod error;
pub mod method;
pub mod records;


pub use console::{render_console, ConsoleEntry, LogLevel};
pub use envelope::{ExecuteEnvelope, SessionId};
pub use error::{Result, WeftError};
pub use method::HttpMethod;
pub use records::{DbOperation, ExecutionRecord, ExecutionResult, Origin, RequestRecord};
