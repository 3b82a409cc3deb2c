//! Topology change events.

use serde::{Deserialize, Serialize};

use crate::topology::types::{Backend, BackendId, Upstream, UpstreamId};

/// Discriminant used to register interest with the broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UpstreamAdded,
    UpstreamRemoved,
    BackendAdded,
    BackendRemoved,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::UpstreamAdded,
        EventType::UpstreamRemoved,
        EventType::BackendAdded,
        EventType::BackendRemoved,
    ];

    pub const UPSTREAM: [EventType; 2] = [EventType::UpstreamAdded, EventType::UpstreamRemoved];

    pub const BACKEND: [EventType; 2] = [EventType::BackendAdded, EventType::BackendRemoved];
}

/// An immutable record of one topology mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    UpstreamAdded { upstream: Upstream },
    UpstreamRemoved { upstream: Upstream },
    BackendAdded { upstream_id: UpstreamId, backend: Backend },
    BackendRemoved { upstream_id: UpstreamId, backend: Backend },
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::UpstreamAdded { .. } => EventType::UpstreamAdded,
            Event::UpstreamRemoved { .. } => EventType::UpstreamRemoved,
            Event::BackendAdded { .. } => EventType::BackendAdded,
            Event::BackendRemoved { .. } => EventType::BackendRemoved,
        }
    }

    pub fn upstream_id(&self) -> &UpstreamId {
        match self {
            Event::UpstreamAdded { upstream } | Event::UpstreamRemoved { upstream } => &upstream.id,
            Event::BackendAdded { upstream_id, .. } | Event::BackendRemoved { upstream_id, .. } => {
                upstream_id
            }
        }
    }

    /// `None` for upstream events.
    pub fn backend_id(&self) -> Option<&BackendId> {
        match self {
            Event::BackendAdded { backend, .. } | Event::BackendRemoved { backend, .. } => {
                Some(&backend.id)
            }
            _ => None,
        }
    }
}
