use hyper::header::{HeaderMap, CONTENT_TYPE, COOKIE};
use hyper::Uri;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use weft_common::HttpMethod;

/// Script-visible snapshot of an inbound HTTP request.
///
/// Built on the HTTP task and moved into the dispatcher. The script receives a
/// fresh copy per invocation, so mutating `req` in a handler never reaches
/// back here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestView {
    pub method: HttpMethod,
    pub path: String,
    /// Repeated keys become arrays in arrival order.
    pub query: Map<String, Value>,
    pub params: BTreeMap<String, String>,
    /// Lower-cased header names; repeated headers are joined with `", "`.
    pub headers: BTreeMap<String, String>,
    /// JSON value for JSON content, an object for form posts, otherwise the
    /// raw text. `null` when the body is empty.
    pub body: Value,
    pub cookies: BTreeMap<String, String>,
    pub ip: Option<String>,
}

impl RequestView {
    /// Builds a view from request parts. Never fails: unparsable JSON and
    /// non-UTF-8 bodies degrade to (lossy) raw text.
    pub fn from_parts(
        method: HttpMethod,
        uri: &Uri,
        headers: &HeaderMap,
        body: &[u8],
        remote: Option<SocketAddr>,
    ) -> Self {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        Self {
            method,
            path: uri.path().to_string(),
            query: parse_query(uri.query().unwrap_or_default()),
            params: BTreeMap::new(),
            headers: collect_headers(headers),
            body: parse_body(content_type, body),
            cookies: parse_cookies(headers),
            ip: remote.map(|addr| addr.ip().to_string()),
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    /// JSON form handed to the script runtime.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Decodes an `application/x-www-form-urlencoded` string into an object,
/// collecting repeated keys into arrays.
pub fn parse_query(query: &str) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let value = Value::String(value.into_owned());
        match map.get_mut(key.as_ref()) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(key.into_owned(), value);
            }
        }
    }
    map
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        out.entry(name.as_str().to_string())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    out
}

/// True for `application/json` and structured suffixes such as
/// `application/vnd.api+json`.
pub fn is_json_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || mime.ends_with("+json") || mime == "text/json"
}

fn parse_body(content_type: &str, body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }

    if is_json_content_type(content_type) {
        if let Ok(value) = serde_json::from_slice(body) {
            return value;
        }
    } else if content_type
        .to_ascii_lowercase()
        .starts_with("application/x-www-form-urlencoded")
    {
        if let Ok(text) = std::str::from_utf8(body) {
            return Value::Object(parse_query(text));
        }
    }

    Value::String(String::from_utf8_lossy(body).into_owned())
}

fn parse_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();
    for header in headers.get_all(COOKIE) {
        let Ok(header) = header.to_str() else {
            continue;
        };
        for pair in header.split(';') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let value = value.trim().trim_matches('"');
            cookies.insert(
                name.to_string(),
                percent_decode_str(value).decode_utf8_lossy().into_owned(),
            );
        }
    }
    cookies
}
