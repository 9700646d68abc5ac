//! Route Table
//!
//! Ordered list of `(method, pattern, target)` registrations made by script
//! code. The HTTP layer consults it for every incoming request; only the
//! dispatcher worker ever writes to it.
//!
//! # Matching Rules
//!
//! - Entries are tried in registration order and the first structural match
//!   for the request method wins. A later, more specific registration does
//!   not shadow an earlier general one, so scripts must register specific
//!   routes first.
//! - A `:name` segment matches any single non-empty path segment and captures
//!   it (percent-decoded) under `name`.
//! - Literal segments must match exactly; segment-count mismatch never matches.
//! - Empty segments are ignored, so `/users/42/` and `/users//42` both match
//!   `/users/:id`.
//!
//! Re-registering the same method and pattern replaces the target in place,
//! keeping its original position.

use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use weft_common::{HttpMethod, Result, WeftError};

/// Route table shared between the worker (writer) and HTTP tasks (readers).
pub type SharedRoutes = Arc<RwLock<RouteTable>>;

/// Opaque reference to a callable held by the script runtime.
///
/// The callable itself never leaves the worker thread; the table only stores
/// this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HandlerId(u64);

impl HandlerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// What a matched route runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// `handler(req, res)`
    Handler(HandlerId),
    /// `generator()` whose return value becomes the body, no request input.
    Static {
        generator: HandlerId,
        content_type: Option<String>,
    },
}

impl RouteTarget {
    pub fn handler_id(&self) -> HandlerId {
        match self {
            RouteTarget::Handler(id) => *id,
            RouteTarget::Static { generator, .. } => *generator,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RouteTarget::Handler(_) => "handler",
            RouteTarget::Static { .. } => "static",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Percent-decoded, compared against decoded request segments.
    Literal(String),
    Param(String),
}

/// A parsed path pattern such as `/users/:id/posts/:postId`.
///
/// Two patterns are equal when they match the same paths, so `/a%20b` and
/// `/a b` name one route.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    segments: Vec<Segment>,
    /// Normalized source text, as written by the script.
    text: String,
}

impl PartialEq for RoutePattern {
    fn eq(&self, other: &Self) -> bool {
        self.segments == other.segments
    }
}

impl Eq for RoutePattern {}

impl RoutePattern {
    /// Parses a pattern. Only basic syntax is checked: a leading `/`,
    /// non-empty parameter names made of ASCII alphanumerics or `_`, and no
    /// parameter name used twice.
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| WeftError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if !pattern.starts_with('/') {
            return Err(invalid("pattern must start with '/'"));
        }

        let mut segments = Vec::new();
        let mut text = String::new();
        for raw in pattern.split('/').filter(|s| !s.is_empty()) {
            text.push('/');
            text.push_str(raw);
            match raw.strip_prefix(':') {
                Some(name) => {
                    if name.is_empty() {
                        return Err(invalid("parameter name is empty"));
                    }
                    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                        return Err(invalid(
                            "parameter names may only contain letters, digits and '_'",
                        ));
                    }
                    if segments.iter().any(|s| matches!(s, Segment::Param(n) if n == name)) {
                        return Err(invalid("duplicate parameter name"));
                    }
                    segments.push(Segment::Param(name.to_string()));
                }
                None => {
                    let decoded = percent_decode_str(raw).decode_utf8_lossy();
                    segments.push(Segment::Literal(decoded.into_owned()));
                }
            }
        }
        if text.is_empty() {
            text.push('/');
        }

        Ok(Self { segments, text })
    }

    fn capture(&self, path: &[&str]) -> Option<BTreeMap<String, String>> {
        if path.len() != self.segments.len() {
            return None;
        }

        let mut params = BTreeMap::new();
        for (segment, part) in self.segments.iter().zip(path) {
            let decoded = percent_decode_str(part).decode_utf8_lossy();
            match segment {
                Segment::Literal(literal) => {
                    if literal.as_str() != decoded.as_ref() {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), decoded.into_owned());
                }
            }
        }
        Some(params)
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub method: HttpMethod,
    pub pattern: RoutePattern,
    pub target: RouteTarget,
}

/// Successful lookup result.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    pub method: HttpMethod,
    pub pattern: String,
    pub target: RouteTarget,
    pub params: BTreeMap<String, String>,
}

/// Serializable view of one entry, used by `weft.routes()` and the admin API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteInfo {
    pub method: HttpMethod,
    pub pattern: String,
    pub kind: &'static str,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRoutes {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Inserts a route or replaces the target of an existing entry with the
    /// same method and pattern. Returns the replaced target, if any.
    pub fn register(
        &mut self,
        method: HttpMethod,
        pattern: RoutePattern,
        target: RouteTarget,
    ) -> Option<RouteTarget> {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.method == method && e.pattern == pattern)
        {
            return Some(std::mem::replace(&mut entry.target, target));
        }

        self.entries.push(RouteEntry {
            method,
            pattern,
            target,
        });
        None
    }

    /// Finds the first entry matching `method` and `path`.
    ///
    /// Any query string on `path` is ignored.
    pub fn find(&self, method: HttpMethod, path: &str) -> Option<RouteMatch> {
        let parts = split_path(path);
        self.entries
            .iter()
            .filter(|entry| entry.method == method)
            .find_map(|entry| {
                entry.pattern.capture(&parts).map(|params| RouteMatch {
                    method,
                    pattern: entry.pattern.to_string(),
                    target: entry.target.clone(),
                    params,
                })
            })
    }

    /// Removes every entry, returning the targets that were dropped.
    pub fn clear(&mut self) -> Vec<RouteTarget> {
        self.entries.drain(..).map(|entry| entry.target).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn describe(&self) -> Vec<RouteInfo> {
        self.entries
            .iter()
            .map(|entry| RouteInfo {
                method: entry.method,
                pattern: entry.pattern.to_string(),
                kind: entry.target.kind(),
            })
            .collect()
    }

    /// True when some entry still points at `id`.
    pub fn references(&self, id: HandlerId) -> bool {
        self.entries.iter().any(|entry| entry.target.handler_id() == id)
    }
}

fn split_path(path: &str) -> Vec<&str> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(id: u64) -> RouteTarget {
        RouteTarget::Handler(HandlerId::new(id))
    }

    fn table(routes: &[(HttpMethod, &str, u64)]) -> RouteTable {
        let mut table = RouteTable::new();
        for (method, pattern, id) in routes {
            table.register(*method, RoutePattern::parse(pattern).unwrap(), handler(*id));
        }
        table
    }

    #[test]
    fn test_path_parameter_extraction() {
        let table = table(&[(HttpMethod::Get, "/users/:id/posts/:postId", 1)]);

        let found = table.find(HttpMethod::Get, "/users/42/posts/7").unwrap();
        assert_eq!(found.target, handler(1));
        assert_eq!(found.params.get("id").map(String::as_str), Some("42"));
        assert_eq!(found.params.get("postId").map(String::as_str), Some("7"));
        assert_eq!(found.params.len(), 2);
    }

    #[test]
    fn test_method_must_match() {
        let table = table(&[(HttpMethod::Post, "/items", 1)]);
        assert!(table.find(HttpMethod::Get, "/items").is_none());
        assert!(table.find(HttpMethod::Post, "/items").is_some());
    }

    #[test]
    fn test_segment_count_mismatch_is_not_a_match() {
        let table = table(&[(HttpMethod::Get, "/users/:id", 1)]);
        assert!(table.find(HttpMethod::Get, "/users").is_none());
        assert!(table.find(HttpMethod::Get, "/users/1/extra").is_none());
    }

    #[test]
    fn test_first_registration_wins() {
        let table = table(&[
            (HttpMethod::Get, "/users/:id", 1),
            (HttpMethod::Get, "/users/me", 2),
        ]);

        let found = table.find(HttpMethod::Get, "/users/me").unwrap();
        assert_eq!(found.target, handler(1));
        assert_eq!(found.params.get("id").map(String::as_str), Some("me"));
    }

    #[test]
    fn test_reregistration_overwrites_in_place() {
        let mut table = table(&[
            (HttpMethod::Get, "/x", 1),
            (HttpMethod::Get, "/:any", 2),
        ]);

        let pattern = RoutePattern::parse("/x/").unwrap();
        let previous = table.register(HttpMethod::Get, pattern, handler(3));
        assert_eq!(previous, Some(handler(1)));
        assert_eq!(table.len(), 2);

        let found = table.find(HttpMethod::Get, "/x").unwrap();
        assert_eq!(found.target, handler(3));
        assert!(!table.references(HandlerId::new(1)));
    }

    #[test]
    fn test_same_pattern_different_method_is_separate() {
        let mut table = table(&[(HttpMethod::Get, "/x", 1)]);
        let pattern = RoutePattern::parse("/x").unwrap();
        let previous = table.register(HttpMethod::Delete, pattern, handler(2));
        assert!(previous.is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_query_string_and_slashes_are_ignored() {
        let table = table(&[(HttpMethod::Get, "/search/:term", 1)]);
        let found = table.find(HttpMethod::Get, "/search//rust/?page=2").unwrap();
        assert_eq!(found.params.get("term").map(String::as_str), Some("rust"));
    }

    #[test]
    fn test_params_are_percent_decoded() {
        let table = table(&[(HttpMethod::Get, "/files/:name", 1)]);
        let found = table.find(HttpMethod::Get, "/files/hello%20world.txt").unwrap();
        assert_eq!(found.params.get("name").map(String::as_str), Some("hello world.txt"));
    }

    #[test]
    fn test_root_pattern() {
        let table = table(&[(HttpMethod::Get, "/", 1)]);
        assert!(table.find(HttpMethod::Get, "/").is_some());
        assert!(table.find(HttpMethod::Get, "/a").is_none());
        assert_eq!(table.describe()[0].pattern, "/");
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(RoutePattern::parse("users").is_err());
        assert!(RoutePattern::parse("/users/:").is_err());
        assert!(RoutePattern::parse("/a/:id/b/:id").is_err());
        assert!(RoutePattern::parse("/a/:bad-name").is_err());
        assert!(RoutePattern::parse("/a/:ok_name1").is_ok());
    }

    #[test]
    fn test_clear_returns_targets() {
        let mut table = table(&[(HttpMethod::Get, "/a", 1), (HttpMethod::Get, "/b", 2)]);
        let removed = table.clear();
        assert_eq!(removed, vec![handler(1), handler(2)]);
        assert!(table.is_empty());
        assert!(table.find(HttpMethod::Get, "/a").is_none());
    }

    #[test]
    fn test_describe_reports_kind_and_order() {
        let mut table = table(&[(HttpMethod::Post, "/a/:id", 1)]);
        table.register(
            HttpMethod::Get,
            RoutePattern::parse("/static").unwrap(),
            RouteTarget::Static {
                generator: HandlerId::new(2),
                content_type: Some("text/plain".into()),
            },
        );

        let info = table.describe();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].pattern, "/a/:id");
        assert_eq!(info[0].kind, "handler");
        assert_eq!(info[1].kind, "static");
        assert_eq!(serde_json::to_value(&info[1]).unwrap()["method"], "GET");
    }

    #[test]
    fn test_literal_segments_are_percent_decoded() {
        let table = table(&[(HttpMethod::Get, "/a%20b/:rest", 1)]);
        let found = table.find(HttpMethod::Get, "/a%20b/x").unwrap();
        assert_eq!(found.params.get("rest").map(String::as_str), Some("x"));
        assert!(table.find(HttpMethod::Get, "/a b/x").is_some());
        assert_eq!(table.describe()[0].pattern, "/a%20b/:rest");

        assert_eq!(
            RoutePattern::parse("/a%20b").unwrap(),
            RoutePattern::parse("/a b").unwrap()
        );
    }
}
