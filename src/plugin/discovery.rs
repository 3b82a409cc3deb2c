//! Upstream discovery: commands pushed by discovery plugins.
//!
//! A discovery plugin never answers calls about topology; it pushes
//! `TopologyCommand`s onto a queue and a single drain task applies them to
//! the manager in arrival order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::topology::{Backend, BackendId, Manager, TopologyError, Upstream, UpstreamId};

/// One topology mutation requested by a discovery plugin.
///
/// On the wire: `{"method": "AddBackend", "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum TopologyCommand {
    AddUpstream(Upstream),
    RemoveUpstream(UpstreamId),
    AddBackend {
        upstream_id: UpstreamId,
        backend: Backend,
    },
    RemoveBackend(BackendId),
}

impl TopologyCommand {
    pub fn method(&self) -> &'static str {
        match self {
            TopologyCommand::AddUpstream(_) => "AddUpstream",
            TopologyCommand::RemoveUpstream(_) => "RemoveUpstream",
            TopologyCommand::AddBackend { .. } => "AddBackend",
            TopologyCommand::RemoveBackend(_) => "RemoveBackend",
        }
    }

    pub fn apply(self, manager: &Manager) -> Result<(), TopologyError> {
        match self {
            TopologyCommand::AddUpstream(upstream) => manager.add_upstream(upstream).map(drop),
            TopologyCommand::RemoveUpstream(id) => manager.remove_upstream(&id).map(drop),
            TopologyCommand::AddBackend {
                upstream_id,
                backend,
            } => manager.add_backend(&upstream_id, backend).map(drop),
            TopologyCommand::RemoveBackend(id) => manager.remove_backend(&id).map(drop),
        }
    }
}

/// Apply every queued command until all senders are gone.
pub async fn drain_commands(manager: Arc<Manager>, mut commands: mpsc::Receiver<TopologyCommand>) {
    while let Some(command) = commands.recv().await {
        let method = command.method();
        if let Err(e) = command.apply(&manager) {
            tracing::warn!(method, error = %e, "Discovery command rejected");
        }
    }
    tracing::debug!("Discovery queue closed");
}

pub fn spawn_drain(manager: Arc<Manager>, commands: mpsc::Receiver<TopologyCommand>) -> JoinHandle<()> {
    tokio::spawn(drain_commands(manager, commands))
}
