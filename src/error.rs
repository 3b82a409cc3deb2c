//! Error taxonomy shared across the request pipeline.
//!
//! # Design Decisions
//! - Per-request errors (`GatewayError`) are never fatal to the process; they
//!   are turned into a client-facing response through the modifier error path
//! - `GatewayError` is `Clone + Serialize` so it can ride inside a snapshot
//!   that crosses the plugin boundary
//! - Fan-out operations collect every failure instead of stopping at the first

use std::fmt;
use std::sync::Mutex;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plugin::PluginError;

/// Errors that terminate a single request.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayError {
    #[error("no route for host '{host}' and path '{path}'")]
    RouteNotFound { host: String, path: String },

    #[error("no backend available for upstream '{upstream_id}'")]
    BackendNotFound { upstream_id: String },

    #[error("backend address '{address}' is invalid: {reason}")]
    InvalidBackendAddress { address: String, reason: String },

    #[error("backend did not respond within {timeout_ms}ms")]
    ProxyTimeout { timeout_ms: u64 },

    #[error("backend request failed: {reason}")]
    BackendUnavailable { reason: String },

    #[error("plugin failure: {reason}")]
    Plugin { reason: String },
}

impl GatewayError {
    /// Stable machine-readable code, exposed to clients.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound { .. } => "route_not_found",
            GatewayError::BackendNotFound { .. } => "backend_not_found",
            GatewayError::InvalidBackendAddress { .. } => "invalid_backend_address",
            GatewayError::ProxyTimeout { .. } => "proxy_timeout",
            GatewayError::BackendUnavailable { .. } => "backend_unavailable",
            GatewayError::Plugin { .. } => "plugin_error",
        }
    }

    /// Status code used for the placeholder response of this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::BackendNotFound { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidBackendAddress { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::ProxyTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BackendUnavailable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Plugin { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PluginError> for GatewayError {
    fn from(err: PluginError) -> Self {
        GatewayError::Plugin {
            reason: err.to_string(),
        }
    }
}

/// A composite error exposing every underlying failure.
#[derive(Debug)]
pub struct MultiError<E> {
    errors: Vec<E>,
}

impl<E> MultiError<E> {
    pub fn new(errors: Vec<E>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[E] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<E> {
        self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl<E: fmt::Display> fmt::Display for MultiError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred: ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for MultiError<E> {}

/// Lock-guarded accumulator used by concurrent fan-out operations.
#[derive(Debug)]
pub struct ErrorCollector<E> {
    errors: Mutex<Vec<E>>,
}

impl<E> Default for ErrorCollector<E> {
    fn default() -> Self {
        Self {
            errors: Mutex::new(Vec::new()),
        }
    }
}

impl<E> ErrorCollector<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, err: E) {
        // A poisoned collector still holds valid errors.
        let mut errors = match self.errors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        errors.push(err);
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), MultiError<E>> {
        let errors = match self.errors.into_inner() {
            Ok(errors) => errors,
            Err(poisoned) => poisoned.into_inner(),
        };
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MultiError::new(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err = GatewayError::RouteNotFound {
            host: "x".into(),
            path: "/".into(),
        };
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "route_not_found");

        let err = GatewayError::ProxyTimeout { timeout_ms: 10 };
        assert!(err.status_code().is_server_error());
    }

    #[test]
    fn test_collector_aggregates_all() {
        let collector = ErrorCollector::new();
        assert!(ErrorCollector::<String>::new().into_result().is_ok());

        collector.push("first".to_string());
        collector.push("second".to_string());
        let err = collector.into_result().unwrap_err();
        assert_eq!(err.len(), 2);
        assert_eq!(err.to_string(), "2 error(s) occurred: first; second");
    }

    #[test]
    fn test_gateway_error_serializes_with_kind() {
        let err = GatewayError::BackendNotFound {
            upstream_id: "a".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "backend_not_found");
        let back: GatewayError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }
}
