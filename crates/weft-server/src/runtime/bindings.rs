//! JavaScript bindings for Weft
//!
//! Native functions exposed to scripts running in the worker's Boa context.
//!
//! # JavaScript API
//!
//! - `weft.get|post|put|delete|patch(pattern, handler)` - register a route
//! - `weft.route(method, pattern, handler)` - register a route for any method
//! - `weft.static(pattern, generator, contentType?)` - GET route whose body is
//!   `generator()`'s return value
//! - `weft.routes()` - `[{method, pattern, kind}]` in match order
//! - `console.log|info|warn|error|debug(...)` - captured per job
//! - `db.query(sql, params?)` / `db.exec(sql, params?)` - SQLite access
//! - `state` - the global state object (read-only binding)
//!
//! Each handler invocation also receives a `res` object built by
//! [`response_object`].
//!
//! # Captured host data
//!
//! Native closures carry their host handles as capture data. The handles are
//! `Rc`s living outside the GC heap, so any `JsObject` they hold stays rooted
//! and tracing them is unnecessary.

use boa_engine::{
    js_string,
    native_function::NativeFunction,
    object::{FunctionObjectBuilder, JsObject},
    property::{Attribute, PropertyDescriptor},
    Context, JsArgs, JsError, JsNativeError, JsResult, JsString, JsValue,
};
use boa_gc::{Finalize, Trace};
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::PoisonError;
use tracing::debug;
use weft_common::{ConsoleEntry, HttpMethod, LogLevel, Result, WeftError};

use crate::bridge::{CookieOptions, ResponseBuilder, SendBody};
use crate::routes::{HandlerId, RoutePattern, RouteTarget, SharedRoutes};
use crate::runtime::console::ConsoleCapture;
use crate::runtime::conversions::{js_value_to_json, json_to_js_value};
use crate::runtime::database::Database;

/// Callables registered by scripts, keyed by the id stored in the route table.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    next_id: u64,
    handlers: HashMap<HandlerId, JsObject>,
}

impl HandlerRegistry {
    pub(crate) fn insert(&mut self, handler: JsObject) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId::new(self.next_id);
        self.handlers.insert(id, handler);
        id
    }

    pub(crate) fn get(&self, id: HandlerId) -> Option<JsObject> {
        self.handlers.get(&id).cloned()
    }

    pub(crate) fn contains(&self, id: HandlerId) -> bool {
        self.handlers.contains_key(&id)
    }

    pub(crate) fn remove(&mut self, id: HandlerId) {
        self.handlers.remove(&id);
    }

    pub(crate) fn clear(&mut self) {
        self.handlers.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}

/// Worker-owned resources reachable from native functions.
#[derive(Clone, Trace, Finalize)]
pub(crate) struct Host {
    #[unsafe_ignore_trace]
    pub(crate) routes: SharedRoutes,
    #[unsafe_ignore_trace]
    pub(crate) handlers: Rc<RefCell<HandlerRegistry>>,
    #[unsafe_ignore_trace]
    pub(crate) console: Rc<RefCell<ConsoleCapture>>,
    #[unsafe_ignore_trace]
    pub(crate) database: Rc<Database>,
}

#[derive(Clone, Trace, Finalize)]
struct RouteCaptures {
    host: Host,
    /// `None` for `weft.route`, where the method is the first argument.
    #[unsafe_ignore_trace]
    method: Option<HttpMethod>,
}

#[derive(Clone, Trace, Finalize)]
struct ConsoleCaptures {
    #[unsafe_ignore_trace]
    console: Rc<RefCell<ConsoleCapture>>,
    #[unsafe_ignore_trace]
    level: LogLevel,
}

#[derive(Clone, Trace, Finalize)]
struct ResponseHandle {
    #[unsafe_ignore_trace]
    inner: Rc<RefCell<ResponseBuilder>>,
}

type HostFn<T> = fn(&JsValue, &[JsValue], &T, &mut Context) -> JsResult<JsValue>;

fn define_method<T: Trace + 'static>(
    object: &JsObject,
    name: &str,
    length: usize,
    body: HostFn<T>,
    captures: T,
    ctx: &mut Context,
) -> JsResult<()> {
    let function = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(body, captures),
    )
    .name(JsString::from(name))
    .length(length)
    .build();

    object.set(JsString::from(name), function, true, ctx)?;
    Ok(())
}

fn type_error(message: impl Into<String>) -> JsError {
    JsNativeError::typ().with_message(message.into()).into()
}

fn host_error(error: WeftError) -> JsError {
    JsNativeError::error().with_message(error.to_string()).into()
}

fn string_arg(args: &[JsValue], index: usize, what: &str) -> JsResult<String> {
    args.get_or_undefined(index)
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| type_error(format!("{} must be a string", what)))
}

fn callable_arg(args: &[JsValue], index: usize, what: &str) -> JsResult<JsObject> {
    match args.get_or_undefined(index).as_object() {
        Some(object) if object.is_callable() => Ok(object.clone()),
        _ => Err(type_error(format!("{} must be a function", what))),
    }
}

/// Install the `weft`, `console`, `db` and `state` globals.
///
/// # Errors
///
/// Returns `WeftError::JavaScriptExecution` if an object or global cannot
/// be created.
pub(crate) fn install_bindings(ctx: &mut Context, host: &Host) -> Result<()> {
    install(ctx, host).map_err(|e| WeftError::JavaScriptExecution(e.to_string()))
}

fn install(ctx: &mut Context, host: &Host) -> JsResult<()> {
    let weft = JsObject::with_object_proto(ctx.intrinsics());
    let verbs = [
        ("get", HttpMethod::Get),
        ("post", HttpMethod::Post),
        ("put", HttpMethod::Put),
        ("delete", HttpMethod::Delete),
        ("patch", HttpMethod::Patch),
    ];
    for (name, method) in verbs {
        let captures = RouteCaptures {
            host: host.clone(),
            method: Some(method),
        };
        define_method(&weft, name, 2, register_route, captures, ctx)?;
    }
    let any_method = RouteCaptures {
        host: host.clone(),
        method: None,
    };
    define_method(&weft, "route", 3, register_route, any_method, ctx)?;
    define_method(&weft, "static", 2, register_static, host.clone(), ctx)?;
    define_method(&weft, "routes", 0, list_routes, host.clone(), ctx)?;
    ctx.register_global_property(js_string!("weft"), weft, Attribute::all())?;

    let console = JsObject::with_object_proto(ctx.intrinsics());
    let levels = [
        ("log", LogLevel::Log),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
        ("debug", LogLevel::Debug),
    ];
    for (name, level) in levels {
        let captures = ConsoleCaptures {
            console: host.console.clone(),
            level,
        };
        define_method(&console, name, 0, console_write, captures, ctx)?;
    }
    ctx.register_global_property(js_string!("console"), console, Attribute::all())?;

    let db = JsObject::with_object_proto(ctx.intrinsics());
    define_method(&db, "query", 2, db_query, host.clone(), ctx)?;
    define_method(&db, "exec", 2, db_exec, host.clone(), ctx)?;
    ctx.register_global_property(js_string!("db"), db, Attribute::all())?;

    let state = JsObject::with_object_proto(ctx.intrinsics());
    let global = ctx.global_object();
    global.define_property_or_throw(js_string!("state"), state_property(state.into()), ctx)?;

    Ok(())
}

/// Descriptor for the `state` global. Scripts mutate the object but cannot
/// rebind the name; only the host redefines it.
pub(crate) fn state_property(value: JsValue) -> PropertyDescriptor {
    PropertyDescriptor::builder()
        .value(value)
        .writable(false)
        .enumerable(true)
        .configurable(true)
        .build()
}

fn insert_route(
    host: &Host,
    method: HttpMethod,
    pattern: &str,
    make: impl FnOnce(HandlerId) -> RouteTarget,
    handler: JsObject,
) -> JsResult<()> {
    let pattern = RoutePattern::parse(pattern).map_err(|e| type_error(e.to_string()))?;
    let id = host.handlers.borrow_mut().insert(handler);
    let target = make(id);

    let mut routes = host.routes.write().unwrap_or_else(PoisonError::into_inner);
    debug!("Registering {} {} -> {}", method, pattern, id);
    if let Some(previous) = routes.register(method, pattern, target) {
        let stale = previous.handler_id();
        if !routes.references(stale) {
            host.handlers.borrow_mut().remove(stale);
        }
    }
    Ok(())
}

fn register_route(
    _this: &JsValue,
    args: &[JsValue],
    captures: &RouteCaptures,
    _ctx: &mut Context,
) -> JsResult<JsValue> {
    let (method, rest) = match captures.method {
        Some(method) => (method, args),
        None => {
            let name = string_arg(args, 0, "Method")?;
            let method = name.parse::<HttpMethod>().map_err(|e| type_error(e.to_string()))?;
            (method, args.get(1..).unwrap_or_default())
        }
    };

    let pattern = string_arg(rest, 0, "Route pattern")?;
    let handler = callable_arg(rest, 1, "Route handler")?;
    insert_route(&captures.host, method, &pattern, RouteTarget::Handler, handler)?;
    Ok(JsValue::undefined())
}

fn register_static(
    _this: &JsValue,
    args: &[JsValue],
    host: &Host,
    _ctx: &mut Context,
) -> JsResult<JsValue> {
    let pattern = string_arg(args, 0, "Route pattern")?;
    let generator = callable_arg(args, 1, "Static generator")?;
    let content_type = args
        .get_or_undefined(2)
        .as_string()
        .map(|s| s.to_std_string_escaped());

    insert_route(
        host,
        HttpMethod::Get,
        &pattern,
        |id| RouteTarget::Static {
            generator: id,
            content_type,
        },
        generator,
    )?;
    Ok(JsValue::undefined())
}

fn list_routes(
    _this: &JsValue,
    _args: &[JsValue],
    host: &Host,
    ctx: &mut Context,
) -> JsResult<JsValue> {
    let described = host
        .routes
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .describe();
    let json = serde_json::to_value(described).map_err(|e| host_error(e.into()))?;
    json_to_js_value(&json, ctx).map_err(host_error)
}

fn console_write(
    _this: &JsValue,
    args: &[JsValue],
    captures: &ConsoleCaptures,
    ctx: &mut Context,
) -> JsResult<JsValue> {
    let mut parts = Vec::with_capacity(args.len());
    let mut data = Vec::new();

    for arg in args {
        if let Some(s) = arg.as_string() {
            parts.push(s.to_std_string_escaped());
            continue;
        }
        let is_plain_object = arg.as_object().is_some_and(|o| !o.is_callable());
        match is_plain_object.then(|| js_value_to_json(arg, ctx)) {
            Some(Ok(json)) => {
                parts.push(json.to_string());
                data.push(json);
            }
            _ => parts.push(arg.display().to_string()),
        }
    }

    let mut entry = ConsoleEntry::new(captures.level, parts.join(" "));
    if !data.is_empty() {
        entry = entry.with_data(JsonValue::Array(data));
    }
    captures.console.borrow_mut().push(entry);
    Ok(JsValue::undefined())
}

fn sql_params(args: &[JsValue], ctx: &mut Context) -> JsResult<Vec<JsonValue>> {
    let value = args.get_or_undefined(1);
    if value.is_null_or_undefined() {
        return Ok(Vec::new());
    }
    match js_value_to_json(value, ctx).map_err(host_error)? {
        JsonValue::Array(items) => Ok(items),
        _ => Err(type_error("SQL parameters must be an array")),
    }
}

fn db_query(
    _this: &JsValue,
    args: &[JsValue],
    host: &Host,
    ctx: &mut Context,
) -> JsResult<JsValue> {
    let sql = string_arg(args, 0, "SQL")?;
    let params = sql_params(args, ctx)?;
    let rows = host.database.query(&sql, &params).map_err(host_error)?;
    let rows = JsonValue::Array(rows.into_iter().map(JsonValue::Object).collect());
    json_to_js_value(&rows, ctx).map_err(host_error)
}

fn db_exec(
    _this: &JsValue,
    args: &[JsValue],
    host: &Host,
    ctx: &mut Context,
) -> JsResult<JsValue> {
    let sql = string_arg(args, 0, "SQL")?;
    let params = sql_params(args, ctx)?;
    let summary = host.database.exec(&sql, &params).map_err(host_error)?;
    let json = serde_json::to_value(summary).map_err(|e| host_error(e.into()))?;
    json_to_js_value(&json, ctx).map_err(host_error)
}

// ============================================================================
// Response object
// ============================================================================

/// Build the `res` object handed to a route handler. Every method returns
/// `res` so calls can be chained.
pub(crate) fn response_object(
    response: Rc<RefCell<ResponseBuilder>>,
    ctx: &mut Context,
) -> JsResult<JsObject> {
    let res = JsObject::with_object_proto(ctx.intrinsics());
    let handle = ResponseHandle { inner: response };

    define_method(&res, "status", 1, res_status, handle.clone(), ctx)?;
    define_method(&res, "set", 2, res_set, handle.clone(), ctx)?;
    define_method(&res, "header", 2, res_set, handle.clone(), ctx)?;
    define_method(&res, "type", 1, res_type, handle.clone(), ctx)?;
    define_method(&res, "cookie", 3, res_cookie, handle.clone(), ctx)?;
    define_method(&res, "clearCookie", 1, res_clear_cookie, handle.clone(), ctx)?;
    define_method(&res, "send", 1, res_send, handle.clone(), ctx)?;
    define_method(&res, "json", 1, res_json, handle.clone(), ctx)?;
    define_method(&res, "redirect", 2, res_redirect, handle.clone(), ctx)?;
    define_method(&res, "end", 0, res_end, handle, ctx)?;

    Ok(res)
}

fn status_code(value: &JsValue, ctx: &mut Context) -> JsResult<u16> {
    let code = value.to_number(ctx)?;
    if code.fract() != 0.0 || !(100.0..=599.0).contains(&code) {
        return Err(JsNativeError::range()
            .with_message(format!("Invalid status code: {}", value.display()))
            .into());
    }
    Ok(code as u16)
}

fn header_value(value: &JsValue, ctx: &mut Context) -> JsResult<String> {
    Ok(value.to_string(ctx)?.to_std_string_escaped())
}

fn res_status(
    this: &JsValue,
    args: &[JsValue],
    res: &ResponseHandle,
    ctx: &mut Context,
) -> JsResult<JsValue> {
    let code = status_code(args.get_or_undefined(0), ctx)?;
    res.inner.borrow_mut().status(code);
    Ok(this.clone())
}

fn res_set(
    this: &JsValue,
    args: &[JsValue],
    res: &ResponseHandle,
    ctx: &mut Context,
) -> JsResult<JsValue> {
    let first = args.get_or_undefined(0);
    if first.is_object() {
        // res.set({ name: value, ... })
        if let JsonValue::Object(map) = js_value_to_json(first, ctx).map_err(host_error)? {
            let mut builder = res.inner.borrow_mut();
            for (name, value) in map {
                let value = match value {
                    JsonValue::String(s) => s,
                    other => other.to_string(),
                };
                builder.set_header(&name, value);
            }
        }
        return Ok(this.clone());
    }

    let name = string_arg(args, 0, "Header name")?;
    let value = header_value(args.get_or_undefined(1), ctx)?;
    res.inner.borrow_mut().set_header(&name, value);
    Ok(this.clone())
}

fn res_type(
    this: &JsValue,
    args: &[JsValue],
    res: &ResponseHandle,
    _ctx: &mut Context,
) -> JsResult<JsValue> {
    let content_type = string_arg(args, 0, "Content type")?;
    res.inner.borrow_mut().content_type(&content_type);
    Ok(this.clone())
}

fn cookie_options(value: &JsValue, ctx: &mut Context) -> JsResult<CookieOptions> {
    let mut options = CookieOptions::default();
    if value.is_null_or_undefined() {
        return Ok(options);
    }
    let JsonValue::Object(map) = js_value_to_json(value, ctx).map_err(host_error)? else {
        return Err(type_error("Cookie options must be an object"));
    };

    let text = |key: &str| map.get(key).and_then(JsonValue::as_str).map(str::to_string);
    let flag = |key: &str| map.get(key).and_then(JsonValue::as_bool).unwrap_or(false);

    if let Some(path) = text("path") {
        options.path = Some(path);
    }
    options.domain = text("domain");
    options.max_age = map.get("maxAge").and_then(JsonValue::as_f64).map(|s| s as i64);
    options.http_only = flag("httpOnly");
    options.secure = flag("secure");
    options.same_site = text("sameSite");
    Ok(options)
}

fn res_cookie(
    this: &JsValue,
    args: &[JsValue],
    res: &ResponseHandle,
    ctx: &mut Context,
) -> JsResult<JsValue> {
    let name = string_arg(args, 0, "Cookie name")?;
    let value = args.get_or_undefined(1);
    let value = match value.as_string() {
        Some(s) => s.to_std_string_escaped(),
        None => js_value_to_json(value, ctx).map_err(host_error)?.to_string(),
    };
    let options = cookie_options(args.get_or_undefined(2), ctx)?;
    res.inner.borrow_mut().cookie(&name, &value, &options);
    Ok(this.clone())
}

fn res_clear_cookie(
    this: &JsValue,
    args: &[JsValue],
    res: &ResponseHandle,
    _ctx: &mut Context,
) -> JsResult<JsValue> {
    let name = string_arg(args, 0, "Cookie name")?;
    res.inner.borrow_mut().clear_cookie(&name);
    Ok(this.clone())
}

fn res_send(
    this: &JsValue,
    args: &[JsValue],
    res: &ResponseHandle,
    ctx: &mut Context,
) -> JsResult<JsValue> {
    let body = args.get_or_undefined(0);
    let body = if body.is_null_or_undefined() {
        SendBody::Empty
    } else if let Some(text) = body.as_string() {
        SendBody::Text(text.to_std_string_escaped())
    } else {
        SendBody::Json(js_value_to_json(body, ctx).map_err(host_error)?)
    };
    res.inner.borrow_mut().send(body);
    Ok(this.clone())
}

fn res_json(
    this: &JsValue,
    args: &[JsValue],
    res: &ResponseHandle,
    ctx: &mut Context,
) -> JsResult<JsValue> {
    let value = js_value_to_json(args.get_or_undefined(0), ctx).map_err(host_error)?;
    res.inner.borrow_mut().json(&value);
    Ok(this.clone())
}

fn res_redirect(
    this: &JsValue,
    args: &[JsValue],
    res: &ResponseHandle,
    ctx: &mut Context,
) -> JsResult<JsValue> {
    // Both redirect(url, status?) and redirect(status, url) are accepted.
    let (location, status) = if args.get_or_undefined(0).is_number() {
        (string_arg(args, 1, "Redirect target")?, Some(status_code(args.get_or_undefined(0), ctx)?))
    } else {
        let status = match args.get_or_undefined(1) {
            v if v.is_undefined() => None,
            v => Some(status_code(v, ctx)?),
        };
        (string_arg(args, 0, "Redirect target")?, status)
    };
    res.inner.borrow_mut().redirect(&location, status);
    Ok(this.clone())
}

fn res_end(
    this: &JsValue,
    args: &[JsValue],
    res: &ResponseHandle,
    _ctx: &mut Context,
) -> JsResult<JsValue> {
    let mut builder = res.inner.borrow_mut();
    match args.get_or_undefined(0).as_string() {
        Some(text) => {
            builder.send(SendBody::Text(text.to_std_string_escaped()));
        }
        None => {
            builder.end();
        }
    }
    Ok(this.clone())
}
