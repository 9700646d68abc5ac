pub mod context;
pub mod database;

mod bindings;
mod console;
mod conversions;


pub use console::ConsoleCapture;
pub use context::{Invocation, ScriptContext, ScriptRun};
pub use conversions::{js_value_to_json, json_to_js_value};
pub use database::{Database, ExecSummary};
