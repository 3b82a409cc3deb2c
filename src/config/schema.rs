//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::topology::{HealthCheck, Protocol, Upstream};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Public (traffic) and internal (admin) listeners.
    pub listeners: ListenersConfig,

    /// Proxy call settings.
    pub proxy: ProxyConfig,

    /// Local load balancer policy.
    pub load_balancer: LoadBalancerConfig,

    /// Admin API settings.
    pub admin: AdminConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Plugin processes and supervisor defaults.
    pub plugins: PluginsConfig,

    /// Static topology seeded into the manager.
    pub upstreams: Vec<UpstreamConfig>,
}

/// Both HTTP listeners.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenersConfig {
    pub public: ListenerConfig,
    pub internal: ListenerConfig,
}

impl Default for ListenersConfig {
    fn default() -> Self {
        Self {
            public: ListenerConfig {
                enabled: true,
                bind_address: "0.0.0.0:8080".to_string(),
            },
            internal: ListenerConfig {
                enabled: true,
                bind_address: "127.0.0.1:8081".to_string(),
            },
        }
    }
}

/// A single listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Independently toggleable.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

fn default_true() -> bool {
    true
}

/// Proxy call settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Deadline for upstreams that declare no timeout of their own.
    pub default_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}

impl ProxyConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Backend selection policy for the local load balancer.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalancingPolicy {
    #[default]
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub policy: BalancingPolicy,

    /// Seed for the random policy; unseeded when absent.
    pub seed: Option<u64>,
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API on the internal listener.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Plugin processes, grouped by capability.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Per-call deadline in milliseconds.
    pub call_timeout_ms: u64,

    /// Attempts per call, including the first.
    pub retries: u32,

    /// Heartbeat period in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Terminate the process on a capability-cast failure.
    pub fail_hard: bool,

    /// Upstream-discovery plugins.
    pub upstream: Vec<PluginConfig>,

    pub router: Option<PluginConfig>,

    pub load_balancer: Option<PluginConfig>,

    /// Modifier stages, applied in order.
    pub modifiers: Vec<PluginConfig>,

    pub metrics: Vec<PluginConfig>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            retries: 3,
            heartbeat_interval_ms: 10_000,
            fail_hard: false,
            upstream: Vec::new(),
            router: None,
            load_balancer: None,
            modifiers: Vec::new(),
            metrics: Vec::new(),
        }
    }
}

impl PluginsConfig {
    /// Every configured plugin, for validation.
    pub fn all(&self) -> impl Iterator<Item = &PluginConfig> {
        self.upstream
            .iter()
            .chain(self.router.iter())
            .chain(self.load_balancer.iter())
            .chain(self.modifiers.iter())
            .chain(self.metrics.iter())
    }
}

/// One plugin process.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginConfig {
    /// Name used in logs and metrics.
    pub name: String,

    /// Command line; split on whitespace.
    pub command: String,

    /// Options passed to the plugin's `Configure`.
    #[serde(default)]
    pub args: HashMap<String, serde_json::Value>,

    pub call_timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub heartbeat_interval_ms: Option<u64>,
}

/// A statically configured upstream.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub protocols: BTreeSet<Protocol>,

    #[serde(default)]
    pub hostnames: Vec<String>,

    #[serde(default)]
    pub prefixes: Vec<String>,

    /// 0 = use `proxy.default_timeout_ms`.
    #[serde(default)]
    pub timeout_ms: u64,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl UpstreamConfig {
    pub fn to_upstream(&self) -> Upstream {
        Upstream {
            id: self.id.as_str().into(),
            name: self.name.clone(),
            protocols: self.protocols.clone(),
            hostnames: self.hostnames.clone(),
            prefixes: self.prefixes.clone(),
            timeout_ms: self.timeout_ms,
        }
    }
}

/// A statically configured backend.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Unique backend identifier.
    pub id: String,

    /// Backend URL (e.g., "http://127.0.0.1:3000").
    pub address: String,

    #[serde(default)]
    pub health_check: Option<HealthCheck>,
}
