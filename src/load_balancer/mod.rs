//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → upstream identified
//!     → LoadBalancer::get_backend(upstream_id)
//!         - local.rs: backends of the upstream, sorted by id
//!             → SelectionPolicy:
//!                 - round_robin.rs (rotate through backends)
//!                 - random.rs (seedable uniform pick)
//!         - plugin.rs: GetBackend on the load-balancer plugin
//!     → Return backend or BackendNotFound
//!
//! Topology changes:
//!     BackendAdded / BackendRemoved events → add_backend / remove_backend
//! ```
//!
//! # Design Decisions
//! - Selection is an explicit policy, never collection iteration order
//! - Backends kept sorted by id so a seed reproduces the same picks

pub mod local;
pub mod plugin;
pub mod random;
pub mod round_robin;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{BalancingPolicy, LoadBalancerConfig};
use crate::error::GatewayError;
use crate::topology::{Backend, BackendId, UpstreamId};

pub use local::LocalLoadBalancer;
pub use plugin::PluginLoadBalancer;
pub use random::SeededRandom;
pub use round_robin::RoundRobin;

/// Picks one backend for an upstream.
#[async_trait]
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    async fn get_backend(&self, upstream_id: &UpstreamId) -> Result<Backend, GatewayError>;

    async fn add_backend(&self, upstream_id: &UpstreamId, backend: Backend) -> Result<(), GatewayError>;

    async fn remove_backend(&self, backend_id: &BackendId) -> Result<(), GatewayError>;
}

/// Chooses among the candidate backends of one upstream.
pub trait SelectionPolicy: Send + Sync + std::fmt::Debug {
    fn next_backend<'a>(&self, backends: &'a [Backend]) -> Option<&'a Backend>;
}

pub fn policy_from_config(config: &LoadBalancerConfig) -> Arc<dyn SelectionPolicy> {
    match config.policy {
        BalancingPolicy::RoundRobin => Arc::new(RoundRobin::new()),
        BalancingPolicy::Random => Arc::new(SeededRandom::new(config.seed)),
    }
}
