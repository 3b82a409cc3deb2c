//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path, headers)
//!     → http::RequestSnapshot (normalized host, first path segment)
//!     → Router::route_request
//!         - local.rs: prefix cache → hostname cache → scan (populates cache)
//!         - plugin.rs: RouteRequest on the router plugin
//!     → Return: (Upstream, snapshot with match kind) or RouteNotFound
//!
//! Topology changes:
//!     UpstreamAdded / UpstreamRemoved events
//!     → add_upstream / remove_upstream (caches purged)
//! ```
//!
//! # Design Decisions
//! - No regex in hot path (exact hostname, exact first segment)
//! - Prefix matches win over hostname matches
//! - A prefix match rewrites the outbound path to the prefix-stripped path

pub mod local;
pub mod matcher;
pub mod plugin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::http::RequestSnapshot;
use crate::topology::{Upstream, UpstreamId};

pub use local::LocalRouter;
pub use plugin::PluginRouter;

/// Which routing key selected the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Hostname,
    Prefix,
}

/// Maps an inbound request to an upstream.
#[async_trait]
pub trait Router: Send + Sync + std::fmt::Debug {
    /// Returns the upstream and the request with `match_kind` set.
    async fn route_request(
        &self,
        request: RequestSnapshot,
    ) -> Result<(Upstream, RequestSnapshot), GatewayError>;

    async fn add_upstream(&self, upstream: Upstream) -> Result<(), GatewayError>;

    async fn remove_upstream(&self, id: &UpstreamId) -> Result<(), GatewayError>;
}
