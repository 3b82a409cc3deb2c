//! Request snapshot: the RPC-safe projection of an inbound request.
//!
//! # Responsibilities
//! - Extract routing-relevant information (host, path, first path segment)
//! - Carry headers in a serializable multimap
//! - Hold the terminal error once a stage fails
//!
//! # Design Decisions
//! - Created per inbound request, mutated in place by each pipeline stage
//! - The body never enters the snapshot; it is streamed by the proxier
//! - Hop-by-hop headers are dropped at extraction

use std::collections::BTreeMap;

use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::routing::matcher::normalize_host;
use crate::routing::MatchKind;

/// Request header used for correlation.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Lowercase header name → values, in order of appearance.
pub type HeaderMultimap = BTreeMap<String, Vec<String>>;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Headers that describe a single connection and must not be forwarded.
pub fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("transfer-encoding")
        || HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Copy forwardable headers into a multimap.
pub fn headers_to_multimap(headers: &HeaderMap) -> HeaderMultimap {
    let mut map = HeaderMultimap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

/// Rebuild a `HeaderMap`, skipping entries that are not valid HTTP.
pub fn multimap_to_headers(map: &HeaderMultimap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in map {
        if is_hop_by_hop(name) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::debug!(header = %name, "Dropping invalid header name");
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    headers
}

/// Split `/api/v1/users` into (`/api`, `/v1/users`).
///
/// The root path has no prefix: (`""`, `/`).
pub fn split_prefix(path: &str) -> (String, String) {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return (String::new(), "/".to_string());
    }
    match trimmed.find('/') {
        Some(idx) => (format!("/{}", &trimmed[..idx]), trimmed[idx..].to_string()),
        None => (format!("/{}", trimmed), "/".to_string()),
    }
}

/// Serializable view of one inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub request_id: String,
    pub method: String,
    /// Lowercase host without port.
    pub host: String,
    /// Raw request path.
    pub path: String,
    pub query: Option<String>,
    /// First path segment, e.g. `/api`; empty for `/`.
    pub prefix: String,
    /// `path` with `prefix` removed.
    pub prefixless_path: String,
    pub headers: HeaderMultimap,
    /// How the router matched this request, once routed.
    pub match_kind: Option<MatchKind>,
    /// Terminal error; once set the pipeline goes to error handling.
    pub error: Option<GatewayError>,
}

impl RequestSnapshot {
    pub fn new(method: &str, host: &str, path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path_and_query.to_string(), None),
        };
        let path = if path.is_empty() { "/".to_string() } else { path };
        let (prefix, prefixless_path) = split_prefix(&path);
        Self {
            request_id: String::new(),
            method: method.to_string(),
            host: normalize_host(host),
            path,
            query,
            prefix,
            prefixless_path,
            headers: HeaderMultimap::new(),
            match_kind: None,
            error: None,
        }
    }

    /// Project the head of an inbound request.
    pub fn from_parts(parts: &Parts) -> Self {
        let host = parts
            .headers
            .get(axum::http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut snapshot = Self::new(parts.method.as_str(), &host, path_and_query);
        snapshot.headers = headers_to_multimap(&parts.headers);
        snapshot.request_id = snapshot
            .header(X_REQUEST_ID)
            .unwrap_or_default()
            .to_string();
        snapshot
    }

    /// First value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Replace all values of a header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    /// Path to send upstream: prefix-stripped after a prefix match, raw otherwise.
    pub fn outbound_path(&self) -> &str {
        match self.match_kind {
            Some(MatchKind::Prefix) => &self.prefixless_path,
            _ => &self.path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn test_split_prefix() {
        assert_eq!(split_prefix("/api/v1/users"), ("/api".into(), "/v1/users".into()));
        assert_eq!(split_prefix("/api"), ("/api".into(), "/".into()));
        assert_eq!(split_prefix("/"), ("".into(), "/".into()));
    }

    #[test]
    fn test_from_parts() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/items?limit=5")
            .header("Host", "SVC.local:8080")
            .header("x-request-id", "abc")
            .header("Connection", "keep-alive")
            .header("accept", "a")
            .header("accept", "b")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();
        let snapshot = RequestSnapshot::from_parts(&parts);

        assert_eq!(snapshot.method, "POST");
        assert_eq!(snapshot.host, "svc.local");
        assert_eq!(snapshot.path, "/api/items");
        assert_eq!(snapshot.query.as_deref(), Some("limit=5"));
        assert_eq!(snapshot.prefix, "/api");
        assert_eq!(snapshot.prefixless_path, "/items");
        assert_eq!(snapshot.request_id, "abc");
        assert_eq!(snapshot.headers["accept"], vec!["a", "b"]);
        assert!(!snapshot.headers.contains_key("connection"));
    }

    #[test]
    fn test_outbound_path_follows_match_kind() {
        let mut snapshot = RequestSnapshot::new("GET", "svc.local", "/api/items");
        assert_eq!(snapshot.outbound_path(), "/api/items");
        snapshot.match_kind = Some(MatchKind::Prefix);
        assert_eq!(snapshot.outbound_path(), "/items");
    }

    #[test]
    fn test_multimap_round_trip_drops_invalid() {
        let mut map = HeaderMultimap::new();
        map.insert("x-ok".into(), vec!["1".into(), "2".into()]);
        map.insert("bad header".into(), vec!["x".into()]);
        map.insert("upgrade".into(), vec!["websocket".into()]);
        let headers = multimap_to_headers(&map);
        assert_eq!(headers.get_all("x-ok").iter().count(), 2);
        assert_eq!(headers.len(), 2);
    }
}
