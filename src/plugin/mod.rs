//! Out-of-process plugins.
//!
//! # Data Flow
//! ```text
//! [plugins.*] config
//!     → PluginDescriptor (capability type, command, options, call policy)
//!     → supervisor.rs (start, heartbeat, timeout/retry Call, rebuild)
//!     → process.rs (child process, JSON lines over stdio, handshake)
//!     → capability traits (RouterPlugin, LoadBalancerPlugin, ...)
//!
//! Upstream-discovery plugins push the other way:
//!     child stdout notification → TopologyCommand queue
//!     → discovery.rs drain task → topology::Manager
//! ```
//!
//! # Design Decisions
//! - A plugin exposes its capability through `as_*` casts; a failed cast is
//!   an internal error, never retried
//! - Callers never see process failures directly, only `PluginError`s that
//!   survived the supervisor's retry budget

pub mod discovery;
pub mod process;
pub mod set;
pub mod supervisor;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{PluginConfig, PluginsConfig};
use crate::error::GatewayError;
use crate::http::{RequestSnapshot, ResponseSnapshot};
use crate::observability::MetricRecord;
use crate::topology::{Backend, BackendId, Upstream, UpstreamId};

pub use discovery::{spawn_drain, TopologyCommand};
pub use process::{ProcessLauncher, ProcessPlugin};
pub use set::PluginSet;
pub use supervisor::Supervisor;

/// Options handed to a plugin's `Configure`.
pub type PluginOptions = HashMap<String, serde_json::Value>;

/// Capability implemented by a plugin process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    Upstream,
    Router,
    LoadBalancer,
    Modifier,
    Metric,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::Upstream => "upstream",
            PluginType::Router => "router",
            PluginType::LoadBalancer => "load_balancer",
            PluginType::Modifier => "modifier",
            PluginType::Metric => "metric",
        }
    }

    /// Value both sides must agree on before any call is trusted.
    pub fn handshake_value(&self) -> &'static str {
        match self {
            PluginType::Upstream => "gateway-upstream-v1",
            PluginType::Router => "gateway-router-v1",
            PluginType::LoadBalancer => "gateway-load-balancer-v1",
            PluginType::Modifier => "gateway-modifier-v1",
            PluginType::Metric => "gateway-metric-v1",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plugin failures as seen by callers of the supervisor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginError {
    /// The instance does not implement the expected capability.
    #[error("plugin '{plugin}' does not implement the {expected} capability")]
    Internal { plugin: String, expected: PluginType },

    #[error("plugin call '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// Error returned by the plugin itself.
    #[error("{0}")]
    Remote(String),

    #[error("failed to spawn plugin: {0}")]
    Spawn(String),

    #[error("plugin handshake failed: {0}")]
    Handshake(String),

    #[error("plugin I/O error: {0}")]
    Io(String),

    #[error("plugin protocol error: {0}")]
    Protocol(String),

    #[error("plugin process exited")]
    ProcessExited,

    #[error("plugin is not running")]
    NotRunning,

    #[error("plugin is already running")]
    AlreadyRunning,
}

impl PluginError {
    pub fn internal(plugin: &str, expected: PluginType) -> Self {
        PluginError::Internal {
            plugin: plugin.to_string(),
            expected,
        }
    }

    /// Whether the supervisor may spend another attempt on this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PluginError::Internal { .. }
                | PluginError::Timeout { .. }
                | PluginError::NotRunning
                | PluginError::AlreadyRunning
        )
    }
}

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        PluginError::Io(e.to_string())
    }
}

/// Lifecycle surface shared by every plugin.
#[async_trait]
pub trait Plugin: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn plugin_type(&self) -> PluginType;

    async fn configure(&self, options: &PluginOptions) -> Result<(), PluginError>;

    async fn start(&self) -> Result<(), PluginError>;

    async fn stop(&self) -> Result<(), PluginError>;

    async fn heartbeat(&self) -> Result<(), PluginError>;

    /// Force-terminate whatever backs this instance.
    async fn kill(&self) -> Result<(), PluginError>;

    fn as_router(&self) -> Option<&dyn RouterPlugin> {
        None
    }

    fn as_load_balancer(&self) -> Option<&dyn LoadBalancerPlugin> {
        None
    }

    fn as_modifier(&self) -> Option<&dyn ModifierPlugin> {
        None
    }

    fn as_metric(&self) -> Option<&dyn MetricPlugin> {
        None
    }
}

/// Answer to `RouteRequest`. A missing upstream means no route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResult {
    pub upstream: Option<Upstream>,
    pub request: RequestSnapshot,
}

#[async_trait]
pub trait RouterPlugin: Send + Sync {
    async fn add_upstream(&self, upstream: Upstream) -> Result<(), PluginError>;

    async fn remove_upstream(&self, id: UpstreamId) -> Result<(), PluginError>;

    async fn route_request(&self, request: RequestSnapshot) -> Result<RouteResult, PluginError>;
}

#[async_trait]
pub trait LoadBalancerPlugin: Send + Sync {
    async fn add_backend(&self, upstream_id: UpstreamId, backend: Backend) -> Result<(), PluginError>;

    async fn remove_backend(&self, backend_id: BackendId) -> Result<(), PluginError>;

    /// `None` when the upstream has no backend to offer.
    async fn get_backend(&self, upstream_id: UpstreamId) -> Result<Option<Backend>, PluginError>;
}

#[async_trait]
pub trait ModifierPlugin: Send + Sync {
    async fn modify_request(&self, request: RequestSnapshot) -> Result<RequestSnapshot, PluginError>;

    async fn modify_response(
        &self,
        request: RequestSnapshot,
        response: ResponseSnapshot,
    ) -> Result<ResponseSnapshot, PluginError>;

    async fn modify_error_response(
        &self,
        error: GatewayError,
        request: RequestSnapshot,
        response: ResponseSnapshot,
    ) -> Result<ResponseSnapshot, PluginError>;
}

#[async_trait]
pub trait MetricPlugin: Send + Sync {
    /// One error slot per record, `None` on success.
    async fn write_metrics(&self, records: Vec<MetricRecord>) -> Result<Vec<Option<String>>, PluginError>;
}

/// Everything the supervisor needs to build and drive one plugin.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub plugin_type: PluginType,
    pub command: String,
    pub options: PluginOptions,
    pub call_timeout: Duration,
    /// Attempts per call, including the first.
    pub retries: u32,
    pub heartbeat_interval: Duration,
    /// Terminate the process on a capability-cast failure.
    pub fail_hard: bool,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, plugin_type: PluginType, command: impl Into<String>) -> Self {
        let defaults = PluginsConfig::default();
        Self {
            name: name.into(),
            plugin_type,
            command: command.into(),
            options: PluginOptions::new(),
            call_timeout: Duration::from_millis(defaults.call_timeout_ms),
            retries: defaults.retries,
            heartbeat_interval: Duration::from_millis(defaults.heartbeat_interval_ms),
            fail_hard: defaults.fail_hard,
        }
    }

    /// Per-plugin settings fall back to the `[plugins]` defaults.
    pub fn from_config(plugin_type: PluginType, plugin: &PluginConfig, defaults: &PluginsConfig) -> Self {
        Self {
            name: plugin.name.clone(),
            plugin_type,
            command: plugin.command.clone(),
            options: plugin.args.clone(),
            call_timeout: Duration::from_millis(plugin.call_timeout_ms.unwrap_or(defaults.call_timeout_ms)),
            retries: plugin.retries.unwrap_or(defaults.retries).max(1),
            heartbeat_interval: Duration::from_millis(
                plugin
                    .heartbeat_interval_ms
                    .unwrap_or(defaults.heartbeat_interval_ms),
            ),
            fail_hard: defaults.fail_hard,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Builds a fresh plugin instance for a descriptor.
#[async_trait]
pub trait PluginLauncher: Send + Sync + fmt::Debug {
    async fn launch(&self, descriptor: &PluginDescriptor) -> Result<Arc<dyn Plugin>, PluginError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_falls_back_to_defaults() {
        let defaults = PluginsConfig {
            call_timeout_ms: 100,
            retries: 5,
            ..PluginsConfig::default()
        };
        let plugin = PluginConfig {
            name: "lb".into(),
            command: "lb-plugin".into(),
            args: Default::default(),
            call_timeout_ms: None,
            retries: Some(2),
            heartbeat_interval_ms: None,
        };
        let descriptor = PluginDescriptor::from_config(PluginType::LoadBalancer, &plugin, &defaults);
        assert_eq!(descriptor.call_timeout, Duration::from_millis(100));
        assert_eq!(descriptor.retries, 2);
        assert_eq!(descriptor.heartbeat_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_timeouts_and_casts_are_not_retried() {
        assert!(!PluginError::internal("x", PluginType::Router).is_retryable());
        assert!(!PluginError::Timeout {
            method: "Heartbeat".into(),
            timeout_ms: 1
        }
        .is_retryable());
        assert!(PluginError::Remote("boom".into()).is_retryable());
        assert!(PluginError::ProcessExited.is_retryable());
    }
}
