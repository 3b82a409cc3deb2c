//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, retries >= 1, addresses parse)
//! - Detect conflicting routing keys and duplicate IDs
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{GatewayConfig, ListenerConfig, PluginConfig};
use crate::topology::Backend;

/// A single semantic problem, tagged with the offending field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check `config` and report every problem found.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_listener("listeners.public", &config.listeners.public, &mut errors);
    check_listener("listeners.internal", &config.listeners.internal, &mut errors);

    if config.proxy.default_timeout_ms == 0 {
        errors.push(ValidationError::new("proxy.default_timeout_ms", "must be > 0"));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }
    if config.admin.enabled && config.admin.api_key.is_empty() {
        errors.push(ValidationError::new("admin.api_key", "required when admin is enabled"));
    }

    let plugins = &config.plugins;
    if plugins.call_timeout_ms == 0 {
        errors.push(ValidationError::new("plugins.call_timeout_ms", "must be > 0"));
    }
    if plugins.retries == 0 {
        errors.push(ValidationError::new("plugins.retries", "must be >= 1"));
    }
    if plugins.heartbeat_interval_ms == 0 {
        errors.push(ValidationError::new("plugins.heartbeat_interval_ms", "must be > 0"));
    }
    let mut plugin_names = HashMap::new();
    for plugin in plugins.all() {
        check_plugin(plugin, &mut errors);
        if plugin_names.insert(plugin.name.as_str(), ()).is_some() {
            errors.push(ValidationError::new(
                format!("plugins.{}", plugin.name),
                "duplicate plugin name",
            ));
        }
    }

    let mut upstream_ids = HashMap::new();
    let mut backend_ids = HashMap::new();
    let mut routing_keys: HashMap<String, &str> = HashMap::new();
    for (i, upstream) in config.upstreams.iter().enumerate() {
        let field = format!("upstreams[{}]", i);
        if upstream.id.is_empty() {
            errors.push(ValidationError::new(format!("{}.id", field), "must not be empty"));
        } else if upstream_ids.insert(upstream.id.as_str(), ()).is_some() {
            errors.push(ValidationError::new(
                format!("{}.id", field),
                format!("duplicate upstream id '{}'", upstream.id),
            ));
        }

        let normalized = upstream.to_upstream().normalized();
        for key in normalized.hostnames.iter().chain(normalized.prefixes.iter()) {
            if let Some(owner) = routing_keys.insert(key.clone(), upstream.id.as_str()) {
                if owner != upstream.id {
                    errors.push(ValidationError::new(
                        format!("{}.routing", field),
                        format!("routing key '{}' already used by upstream '{}'", key, owner),
                    ));
                }
            }
        }

        for (j, backend) in upstream.backends.iter().enumerate() {
            let field = format!("{}.backends[{}]", field, j);
            if let Err(e) = Backend::new(backend.id.as_str(), &backend.address) {
                errors.push(ValidationError::new(
                    format!("{}.address", field),
                    format!("'{}': {}", backend.address, e),
                ));
            }
            if !backend.id.is_empty() && backend_ids.insert(backend.id.as_str(), ()).is_some() {
                errors.push(ValidationError::new(
                    format!("{}.id", field),
                    format!("duplicate backend id '{}'", backend.id),
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_listener(field: &str, listener: &ListenerConfig, errors: &mut Vec<ValidationError>) {
    if listener.enabled && listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            format!("{}.bind_address", field),
            format!("'{}' is not a socket address", listener.bind_address),
        ));
    }
}

fn check_plugin(plugin: &PluginConfig, errors: &mut Vec<ValidationError>) {
    let field = format!("plugins.{}", plugin.name);
    if plugin.name.is_empty() {
        errors.push(ValidationError::new("plugins", "plugin name must not be empty"));
    }
    if plugin.command.split_whitespace().next().is_none() {
        errors.push(ValidationError::new(format!("{}.command", field), "must not be empty"));
    }
    if plugin.call_timeout_ms == Some(0) {
        errors.push(ValidationError::new(format!("{}.call_timeout_ms", field), "must be > 0"));
    }
    if plugin.retries == Some(0) {
        errors.push(ValidationError::new(format!("{}.retries", field), "must be >= 1"));
    }
    if plugin.heartbeat_interval_ms == Some(0) {
        errors.push(ValidationError::new(
            format!("{}.heartbeat_interval_ms", field),
            "must be > 0",
        ));
    }
}
