use boa_engine::{
    builtins::promise::PromiseState, js_string, object::builtins::JsPromise, value::JsValue,
    Context, JsError, JsNativeError, JsResult, Source,
};
use serde_json::{json, Value as JsonValue};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::PoisonError;
use tracing::warn;
use weft_common::{ConsoleEntry, DbOperation, ExecutionResult, HttpMethod, Result, WeftError};

use crate::bridge::{HttpReply, RequestView, ResponseBuilder, SendBody};
use crate::routes::{HandlerId, RouteTarget, SharedRoutes};
use crate::runtime::bindings::{self, HandlerRegistry, Host};
use crate::runtime::console::ConsoleCapture;
use crate::runtime::conversions::{js_value_to_json, json_to_js_value};
use crate::runtime::database::Database;

/// Outcome of one raw script.
#[derive(Debug, Clone)]
pub struct ScriptRun {
    pub result: ExecutionResult,
    pub db_operations: Vec<DbOperation>,
}

/// Outcome of one handler invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub result: ExecutionResult,
    pub reply: HttpReply,
    pub db_operations: Vec<DbOperation>,
}

/// The single Boa interpreter plus its persistent global scope.
///
/// Not `Send`: it is created on, and never leaves, the dispatcher's worker
/// thread. Top-level declarations made by one script stay visible to later
/// scripts and handlers.
pub struct ScriptContext {
    ctx: Context,
    host: Host,
}

impl ScriptContext {
    /// Create a context with the Weft bindings installed and an empty
    /// global state.
    pub fn new(routes: SharedRoutes, database: Database) -> Result<Self> {
        let mut ctx = Context::default();
        let host = Host {
            routes,
            handlers: Rc::new(RefCell::new(HandlerRegistry::default())),
            console: Rc::new(RefCell::new(ConsoleCapture::new())),
            database: Rc::new(database),
        };
        bindings::install_bindings(&mut ctx, &host)?;

        Ok(Self { ctx, host })
    }

    #[cfg(test)]
    pub(crate) fn routes(&self) -> &SharedRoutes {
        &self.host.routes
    }

    pub fn has_handler(&self, id: HandlerId) -> bool {
        self.host.handlers.borrow().contains(id)
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self) -> usize {
        self.host.handlers.borrow().len()
    }

    /// Evaluate `source` in the persistent global scope.
    ///
    /// A returned promise is settled by draining the job queue. Exceptions
    /// become the result's error.
    pub fn run_script(&mut self, source: &str) -> ScriptRun {
        self.begin_job();

        let outcome = match self.ctx.eval(Source::from_bytes(source)) {
            Ok(value) => self.settle(value),
            Err(err) => Err(err),
        };

        let console = self.take_console();
        let db_operations = self.host.database.take_operations();

        let result = match outcome {
            Ok(value) => match js_value_to_json(&value, &mut self.ctx) {
                Ok(json) => ExecutionResult::success(json, console),
                Err(e) => ExecutionResult::failure(e.to_string(), console),
            },
            Err(err) => ExecutionResult::failure(self.describe_error(&err), console),
        };
        ScriptRun {
            result,
            db_operations,
        }
    }

    /// Call the callable behind `target` with a request view and a fresh
    /// response builder.
    ///
    /// A handler that throws gets a 500 envelope unless it already finished
    /// the response. A handler that returns without finishing has its return
    /// value sent as JSON, or an empty body when it returned nothing.
    pub fn invoke(&mut self, target: &RouteTarget, request: &RequestView) -> Invocation {
        self.begin_job();

        let label = format!("{} {}", request.method, request.path);
        let response = Rc::new(RefCell::new(ResponseBuilder::new(label)));

        let outcome = match target {
            RouteTarget::Handler(id) => self.call_handler(*id, request, &response),
            RouteTarget::Static {
                generator,
                content_type,
            } => self.call_static(*generator, content_type.as_deref(), &response),
        };

        let console = self.take_console();
        let db_operations = self.host.database.take_operations();

        let result = match outcome {
            Ok(returned) => {
                response.borrow_mut().finish_with(returned.clone());
                ExecutionResult::success(returned.unwrap_or(JsonValue::Null), console)
            }
            Err(message) => {
                let mut builder = response.borrow_mut();
                if !builder.is_finished() {
                    builder.status(500);
                    builder.json(&json!({ "success": false, "error": message }));
                }
                ExecutionResult::failure(message, console)
            }
        };

        let reply = response.borrow_mut().take_reply();
        Invocation {
            result,
            reply,
            db_operations,
        }
    }

    fn call_handler(
        &mut self,
        id: HandlerId,
        request: &RequestView,
        response: &Rc<RefCell<ResponseBuilder>>,
    ) -> std::result::Result<Option<JsonValue>, String> {
        let handler = self
            .host
            .handlers
            .borrow()
            .get(id)
            .ok_or_else(|| format!("{} is no longer registered", id))?;

        let req = json_to_js_value(&request.to_value(), &mut self.ctx).map_err(|e| e.to_string())?;
        let res = bindings::response_object(response.clone(), &mut self.ctx)
            .map_err(|e| self.describe_error(&e))?;

        let returned = handler
            .call(&JsValue::undefined(), &[req, res.into()], &mut self.ctx)
            .and_then(|value| self.settle(value))
            .map_err(|e| self.describe_error(&e))?;

        if returned.is_undefined() {
            return Ok(None);
        }
        js_value_to_json(&returned, &mut self.ctx)
            .map(Some)
            .map_err(|e| e.to_string())
    }

    fn call_static(
        &mut self,
        id: HandlerId,
        content_type: Option<&str>,
        response: &Rc<RefCell<ResponseBuilder>>,
    ) -> std::result::Result<Option<JsonValue>, String> {
        let generator = self
            .host
            .handlers
            .borrow()
            .get(id)
            .ok_or_else(|| format!("{} is no longer registered", id))?;

        let produced = generator
            .call(&JsValue::undefined(), &[], &mut self.ctx)
            .and_then(|value| self.settle(value))
            .map_err(|e| self.describe_error(&e))?;

        let mut builder = response.borrow_mut();
        if let Some(content_type) = content_type {
            builder.content_type(content_type);
        }

        if let Some(text) = produced.as_string() {
            let text = text.to_std_string_escaped();
            builder.send(SendBody::Text(text.clone()));
            return Ok(Some(JsonValue::String(text)));
        }

        let json = js_value_to_json(&produced, &mut self.ctx).map_err(|e| e.to_string())?;
        builder.send(SendBody::Json(json.clone()));
        Ok(Some(json))
    }

    /// Current global state as JSON.
    pub fn read_state(&mut self) -> Result<JsonValue> {
        let global = self.ctx.global_object();
        let state = global
            .get(js_string!("state"), &mut self.ctx)
            .map_err(|e| WeftError::JavaScriptExecution(e.to_string()))?;
        js_value_to_json(&state, &mut self.ctx)
    }

    /// Swap the whole global state. Only JSON objects are accepted; on error
    /// the previous state is untouched.
    ///
    /// Scripts cannot rebind `state` themselves, so this is the only way to
    /// replace the object.
    pub fn replace_state(&mut self, state: &JsonValue) -> Result<()> {
        if !state.is_object() {
            return Err(WeftError::InvalidState(
                "state must be a JSON object".to_string(),
            ));
        }
        let value = json_to_js_value(state, &mut self.ctx)?;
        let global = self.ctx.global_object();
        let property = bindings::state_property(value);
        global
            .define_property_or_throw(js_string!("state"), property, &mut self.ctx)
            .map_err(|e| WeftError::JavaScriptExecution(e.to_string()))?;
        Ok(())
    }

    /// Clear the route table and release every handler it referenced.
    /// Returns the number of routes removed.
    pub fn reset_routes(&mut self) -> usize {
        let removed = self
            .host
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let mut handlers = self.host.handlers.borrow_mut();
        for target in &removed {
            handlers.remove(target.handler_id());
        }
        removed.len()
    }

    /// Re-match `method path` against the current table. Used when a handler
    /// matched on the HTTP side was replaced before the job ran.
    pub fn rematch(
        &self,
        method: HttpMethod,
        path: &str,
    ) -> Option<(RouteTarget, BTreeMap<String, String>)> {
        self.host
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .find(method, path)
            .map(|found| (found.target, found.params))
    }

    fn begin_job(&mut self) {
        self.host.console.borrow_mut().begin();
        self.host.database.take_operations();
    }

    fn take_console(&mut self) -> Vec<ConsoleEntry> {
        self.host.console.borrow_mut().take()
    }

    /// Drain queued promise jobs and unwrap `value` if it is a promise.
    fn settle(&mut self, value: JsValue) -> JsResult<JsValue> {
        if let Err(err) = self.ctx.run_jobs() {
            warn!("Promise job failed: {}", err);
        }

        let Some(object) = value.as_object() else {
            return Ok(value);
        };
        let Ok(promise) = JsPromise::from_object(object.clone()) else {
            return Ok(value);
        };

        match promise.state() {
            PromiseState::Fulfilled(result) => Ok(result),
            PromiseState::Rejected(reason) => Err(JsError::from_opaque(reason)),
            PromiseState::Pending => Err(JsNativeError::error()
                .with_message("Promise did not settle")
                .into()),
        }
    }

    fn describe_error(&mut self, err: &JsError) -> String {
        match err.try_native(&mut self.ctx) {
            Ok(native) => native.to_string(),
            Err(_) => err.to_string(),
        }
    }
}

impl Drop for ScriptContext {
    fn drop(&mut self) {
        // Release registered callables while the interpreter is still alive.
        self.host.handlers.borrow_mut().clear();
    }
}
