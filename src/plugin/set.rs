//! Fan-out over several supervised plugins.

use std::time::Duration;

use futures_util::future::join_all;

use crate::error::{ErrorCollector, MultiError};
use crate::plugin::{PluginError, Supervisor};

/// Supervisors started and stopped together.
#[derive(Debug, Clone, Default)]
pub struct PluginSet {
    supervisors: Vec<Supervisor>,
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, supervisor: Supervisor) {
        self.supervisors.push(supervisor);
    }

    pub fn len(&self) -> usize {
        self.supervisors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Supervisor> {
        self.supervisors.iter()
    }

    /// Start every plugin concurrently; failures are collected, not fatal
    /// to the others.
    pub async fn start_all(&self) -> Result<(), MultiError<PluginError>> {
        let errors = ErrorCollector::new();
        join_all(self.supervisors.iter().map(|supervisor| {
            let errors = &errors;
            async move {
                if let Err(e) = supervisor.start().await {
                    tracing::error!(plugin = %supervisor.name(), error = %e, "Plugin failed to start");
                    errors.push(e);
                }
            }
        }))
        .await;
        errors.into_result()
    }

    /// Stop every plugin concurrently, each bounded by `deadline`.
    pub async fn stop_all(&self, deadline: Duration) -> Result<(), MultiError<PluginError>> {
        let errors = ErrorCollector::new();
        join_all(self.supervisors.iter().map(|supervisor| {
            let errors = &errors;
            async move {
                if let Err(e) = supervisor.stop(deadline).await {
                    for err in e.into_errors() {
                        errors.push(err);
                    }
                }
            }
        }))
        .await;
        errors.into_result()
    }
}
