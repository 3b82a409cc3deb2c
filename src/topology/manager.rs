//! Single writer of upstream/backend topology.
//!
//! # Responsibilities
//! - Validate and store upstreams and their backends
//! - Maintain the reverse index `BackendID → UpstreamID`
//! - Publish exactly one event per mutation, in mutation order
//!
//! # Design Decisions
//! - One lock guards the whole topology so the reverse index never drifts
//! - Events are published while the write lock is held; `publish` never blocks
//! - Routing keys are unique across upstreams; conflicts are rejected here
//!   instead of being resolved by scan order later

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use crate::events::Broadcaster;
use crate::topology::event::Event;
use crate::topology::ids::IdGenerator;
use crate::topology::types::{Backend, BackendId, Upstream, UpstreamId};

/// Errors returned by topology mutations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("invalid upstream: {0}")]
    InvalidUpstream(String),

    #[error("upstream '{0}' not found")]
    UpstreamNotFound(UpstreamId),

    #[error("backend '{0}' not found")]
    BackendNotFound(BackendId),

    #[error("backend '{backend_id}' references missing upstream '{upstream_id}'")]
    OrphanedBackend {
        backend_id: BackendId,
        upstream_id: UpstreamId,
    },

    #[error("backend address '{address}' is invalid: {reason}")]
    InvalidBackendAddress { address: String, reason: String },

    #[error("routing key '{key}' already belongs to upstream '{owner}'")]
    RoutingKeyConflict { key: String, owner: UpstreamId },

    #[error("backend '{backend_id}' already belongs to upstream '{owner}'")]
    BackendConflict {
        backend_id: BackendId,
        owner: UpstreamId,
    },
}

#[derive(Debug)]
struct UpstreamEntry {
    upstream: Upstream,
    backends: BTreeMap<BackendId, Backend>,
}

#[derive(Debug, Default)]
struct Topology {
    upstreams: BTreeMap<UpstreamId, UpstreamEntry>,
    backend_index: HashMap<BackendId, UpstreamId>,
}

/// Accepts add/remove operations from discovery, admin and config sources.
#[derive(Debug)]
pub struct Manager {
    state: RwLock<Topology>,
    broadcaster: Arc<Broadcaster>,
    ids: Arc<dyn IdGenerator>,
}

impl Manager {
    pub fn new(broadcaster: Arc<Broadcaster>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: RwLock::new(Topology::default()),
            broadcaster,
            ids,
        }
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    fn read(&self) -> RwLockReadGuard<'_, Topology> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Topology> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `upstream`, replacing any upstream with the same ID.
    ///
    /// An empty ID is filled from the injected generator. Replacement keeps
    /// the upstream's backends.
    pub fn add_upstream(&self, upstream: Upstream) -> Result<Upstream, TopologyError> {
        let mut upstream = upstream.normalized();
        if upstream.id.is_empty() {
            upstream.id = UpstreamId(self.ids.next_id());
        }
        if upstream.name.is_empty() {
            upstream.name = upstream.id.0.clone();
        }

        let mut state = self.write();
        for (id, entry) in &state.upstreams {
            if *id == upstream.id {
                continue;
            }
            let owned = &entry.upstream;
            let conflict = upstream
                .hostnames
                .iter()
                .find(|h| owned.hostnames.contains(*h))
                .or_else(|| upstream.prefixes.iter().find(|p| owned.prefixes.contains(*p)));
            if let Some(key) = conflict {
                return Err(TopologyError::RoutingKeyConflict {
                    key: key.clone(),
                    owner: id.clone(),
                });
            }
        }

        let replaced = match state.upstreams.get_mut(&upstream.id) {
            Some(entry) => {
                entry.upstream = upstream.clone();
                true
            }
            None => {
                state.upstreams.insert(
                    upstream.id.clone(),
                    UpstreamEntry {
                        upstream: upstream.clone(),
                        backends: BTreeMap::new(),
                    },
                );
                false
            }
        };

        tracing::info!(
            upstream_id = %upstream.id,
            hostnames = ?upstream.hostnames,
            prefixes = ?upstream.prefixes,
            replaced,
            "Upstream added"
        );
        self.broadcaster.publish(Event::UpstreamAdded {
            upstream: upstream.clone(),
        });
        Ok(upstream)
    }

    /// Remove an upstream and, first, every backend it owns.
    pub fn remove_upstream(&self, id: &UpstreamId) -> Result<Upstream, TopologyError> {
        let mut state = self.write();
        let entry = state
            .upstreams
            .remove(id)
            .ok_or_else(|| TopologyError::UpstreamNotFound(id.clone()))?;

        for (backend_id, backend) in entry.backends {
            state.backend_index.remove(&backend_id);
            self.broadcaster.publish(Event::BackendRemoved {
                upstream_id: id.clone(),
                backend,
            });
        }

        tracing::info!(upstream_id = %id, "Upstream removed");
        self.broadcaster.publish(Event::UpstreamRemoved {
            upstream: entry.upstream.clone(),
        });
        Ok(entry.upstream)
    }

    /// Attach `backend` to an existing upstream.
    pub fn add_backend(&self, upstream_id: &UpstreamId, backend: Backend) -> Result<Backend, TopologyError> {
        let mut backend = backend;
        Backend::check_address(&backend.address).map_err(|e| TopologyError::InvalidBackendAddress {
            address: backend.address.to_string(),
            reason: e.to_string(),
        })?;
        if backend.id.is_empty() {
            backend.id = BackendId(self.ids.next_id());
        }

        let mut state = self.write();
        if let Some(owner) = state.backend_index.get(&backend.id) {
            if owner != upstream_id {
                return Err(TopologyError::BackendConflict {
                    backend_id: backend.id.clone(),
                    owner: owner.clone(),
                });
            }
        }

        let entry = state
            .upstreams
            .get_mut(upstream_id)
            .ok_or_else(|| TopologyError::UpstreamNotFound(upstream_id.clone()))?;
        entry.backends.insert(backend.id.clone(), backend.clone());
        state
            .backend_index
            .insert(backend.id.clone(), upstream_id.clone());

        tracing::info!(
            upstream_id = %upstream_id,
            backend_id = %backend.id,
            address = %backend.address,
            "Backend added"
        );
        self.broadcaster.publish(Event::BackendAdded {
            upstream_id: upstream_id.clone(),
            backend: backend.clone(),
        });
        Ok(backend)
    }

    /// Parse `address` and attach the resulting backend.
    pub fn add_backend_address(
        &self,
        upstream_id: &UpstreamId,
        backend_id: BackendId,
        address: &str,
    ) -> Result<Backend, TopologyError> {
        let backend = Backend::new(backend_id, address).map_err(|e| TopologyError::InvalidBackendAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        self.add_backend(upstream_id, backend)
    }

    /// Detach a backend from its owning upstream.
    pub fn remove_backend(&self, backend_id: &BackendId) -> Result<Backend, TopologyError> {
        let mut state = self.write();
        let upstream_id = state
            .backend_index
            .remove(backend_id)
            .ok_or_else(|| TopologyError::BackendNotFound(backend_id.clone()))?;

        let Some(entry) = state.upstreams.get_mut(&upstream_id) else {
            tracing::error!(
                backend_id = %backend_id,
                upstream_id = %upstream_id,
                "Backend index references a missing upstream"
            );
            return Err(TopologyError::OrphanedBackend {
                backend_id: backend_id.clone(),
                upstream_id,
            });
        };
        let backend = entry
            .backends
            .remove(backend_id)
            .ok_or_else(|| TopologyError::BackendNotFound(backend_id.clone()))?;

        tracing::info!(upstream_id = %upstream_id, backend_id = %backend_id, "Backend removed");
        self.broadcaster.publish(Event::BackendRemoved {
            upstream_id,
            backend: backend.clone(),
        });
        Ok(backend)
    }

    pub fn upstream(&self, id: &UpstreamId) -> Option<Upstream> {
        self.read().upstreams.get(id).map(|e| e.upstream.clone())
    }

    pub fn upstreams(&self) -> Vec<Upstream> {
        self.read()
            .upstreams
            .values()
            .map(|e| e.upstream.clone())
            .collect()
    }

    pub fn backends(&self, upstream_id: &UpstreamId) -> Result<Vec<Backend>, TopologyError> {
        self.read()
            .upstreams
            .get(upstream_id)
            .map(|e| e.backends.values().cloned().collect())
            .ok_or_else(|| TopologyError::UpstreamNotFound(upstream_id.clone()))
    }

    /// Owning upstream of a registered backend.
    pub fn owner_of(&self, backend_id: &BackendId) -> Option<UpstreamId> {
        self.read().backend_index.get(backend_id).cloned()
    }
}
