use hyper::body::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::Value;
use tracing::warn;

const COOKIE_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b',')
    .add(b';')
    .add(b'\\')
    .add(b'%');

/// Finished response produced by a handler invocation.
///
/// Carried back to the HTTP task through the job's completion channel and
/// written exactly once there.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpReply {
    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(value.to_string()),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Attributes accepted by `res.cookie(name, value, options)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieOptions {
    pub path: Option<String>,
    pub domain: Option<String>,
    /// Lifetime in seconds.
    pub max_age: Option<i64>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<String>,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            path: Some("/".to_string()),
            domain: None,
            max_age: None,
            http_only: false,
            secure: false,
            same_site: None,
        }
    }
}

/// Serializes one `Set-Cookie` header value.
pub fn serialize_cookie(name: &str, value: &str, options: &CookieOptions) -> String {
    let mut cookie = format!("{}={}", name, utf8_percent_encode(value, COOKIE_VALUE));
    if let Some(path) = &options.path {
        cookie.push_str("; Path=");
        cookie.push_str(path);
    }
    if let Some(domain) = &options.domain {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    if let Some(max_age) = options.max_age {
        cookie.push_str(&format!("; Max-Age={}", max_age));
    }
    if options.http_only {
        cookie.push_str("; HttpOnly");
    }
    if options.secure {
        cookie.push_str("; Secure");
    }
    if let Some(same_site) = &options.same_site {
        cookie.push_str("; SameSite=");
        cookie.push_str(same_site);
    }
    cookie
}

/// Body accepted by `res.send`.
#[derive(Debug, Clone, PartialEq)]
pub enum SendBody {
    Empty,
    Text(String),
    Json(Value),
}

/// Script-side response state for one handler invocation.
///
/// Setters may be called any number of times (last write per header wins).
/// The first terminal operation (`send`, `json`, `redirect`, `end`) freezes
/// the body; later ones are ignored with a warning and return `false`.
#[derive(Debug)]
pub struct ResponseBuilder {
    status: u16,
    headers: Vec<(String, String)>,
    cookies: Vec<String>,
    body: Bytes,
    finished: bool,
    context: String,
}

impl ResponseBuilder {
    /// `context` names the request in warnings, e.g. `"GET /users/1"`.
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            cookies: Vec::new(),
            body: Bytes::new(),
            finished: false,
            context: context.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_ascii_lowercase(), value)),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Sets `content-type`, expanding the short names `json`, `html`, `text`
    /// and `js`.
    pub fn content_type(&mut self, content_type: &str) {
        let expanded = match content_type {
            "json" => "application/json",
            "html" => "text/html; charset=utf-8",
            "text" | "txt" => "text/plain; charset=utf-8",
            "js" => "application/javascript",
            other => other,
        };
        self.set_header("content-type", expanded);
    }

    pub fn cookie(&mut self, name: &str, value: &str, options: &CookieOptions) {
        self.cookies.push(serialize_cookie(name, value, options));
    }

    pub fn clear_cookie(&mut self, name: &str) {
        let options = CookieOptions {
            max_age: Some(0),
            ..CookieOptions::default()
        };
        self.cookies.push(serialize_cookie(name, "", &options));
    }

    fn begin_terminal(&mut self, operation: &str) -> bool {
        if self.finished {
            warn!(
                "Ignoring res.{}() for {}: response already sent",
                operation, self.context
            );
            return false;
        }
        self.finished = true;
        true
    }

    /// Strings go out as-is (HTML unless a content type was set), anything
    /// else as JSON.
    pub fn send(&mut self, body: SendBody) -> bool {
        if !self.begin_terminal("send") {
            return false;
        }
        match body {
            SendBody::Empty => {}
            SendBody::Text(text) => {
                if self.header("content-type").is_none() {
                    self.set_header("content-type", "text/html; charset=utf-8");
                }
                self.body = Bytes::from(text);
            }
            SendBody::Json(value) => self.write_json(&value),
        }
        true
    }

    pub fn json(&mut self, value: &Value) -> bool {
        if !self.begin_terminal("json") {
            return false;
        }
        self.write_json(value);
        true
    }

    pub fn redirect(&mut self, location: &str, status: Option<u16>) -> bool {
        if !self.begin_terminal("redirect") {
            return false;
        }
        self.status = status.unwrap_or(302);
        self.set_header("location", location);
        true
    }

    pub fn end(&mut self) -> bool {
        self.begin_terminal("end")
    }

    /// Applies the implicit terminal step for handlers that returned without
    /// finishing: a returned value is sent as JSON, otherwise the response
    /// ends with no body. No-op once finished.
    pub fn finish_with(&mut self, returned: Option<Value>) {
        if self.finished {
            return;
        }
        match returned {
            Some(value) => {
                self.json(&value);
            }
            None => {
                self.end();
            }
        }
    }

    fn write_json(&mut self, value: &Value) {
        if self.header("content-type").is_none() {
            self.set_header("content-type", "application/json");
        }
        self.body = Bytes::from(value.to_string());
    }

    /// Moves the accumulated response out, leaving the builder finished so
    /// a `res` kept alive by script code can no longer write.
    pub fn take_reply(&mut self) -> HttpReply {
        self.finished = true;
        let mut headers = std::mem::take(&mut self.headers);
        headers.extend(
            self.cookies
                .drain(..)
                .map(|cookie| ("set-cookie".to_string(), cookie)),
        );
        HttpReply {
            status: self.status,
            headers,
            body: std::mem::take(&mut self.body),
        }
    }

    #[cfg(test)]
    pub(crate) fn into_reply(mut self) -> HttpReply {
        self.take_reply()
    }
}
