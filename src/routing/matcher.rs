//! Routing key matching.
//!
//! # Responsibilities
//! - Normalize the Host header (case-insensitive, port stripped)
//! - Match exact hostnames and exact first-segment prefixes
//!
//! # Design Decisions
//! - Host matching is case-insensitive (per HTTP spec)
//! - Prefix matching is case-sensitive and compares the whole first path
//!   segment, so `/api` never matches `/apiv2`
//! - No regex to guarantee O(n) matching

use crate::http::request::RequestSnapshot;
use crate::topology::Upstream;

/// Lowercase a host and strip any port.
///
/// IPv6 literals keep their brackets: `[::1]:8080` → `[::1]`.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Does `upstream` own this request's host?
pub fn matches_host(upstream: &Upstream, request: &RequestSnapshot) -> bool {
    !request.host.is_empty() && upstream.hostnames.iter().any(|h| *h == request.host)
}

/// Does `upstream` own this request's first path segment?
pub fn matches_prefix(upstream: &Upstream, request: &RequestSnapshot) -> bool {
    !request.prefix.is_empty() && upstream.prefixes.iter().any(|p| *p == request.prefix)
}
