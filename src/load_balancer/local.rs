//! In-memory load balancer.
//!
//! Keeps `UpstreamID → backends` current from backend events and delegates
//! the pick to a `SelectionPolicy`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::events::{Broadcaster, Subscriber, Subscription};
use crate::load_balancer::{LoadBalancer, RoundRobin, SelectionPolicy};
use crate::topology::{Backend, BackendId, Event, EventType, UpstreamId};

/// Backends per upstream, each list sorted by backend id.
type Pools = HashMap<UpstreamId, Vec<Backend>>;

#[derive(Debug)]
pub struct LocalLoadBalancer {
    pools: RwLock<Pools>,
    policy: Arc<dyn SelectionPolicy>,
}

impl Default for LocalLoadBalancer {
    fn default() -> Self {
        Self::new(Arc::new(RoundRobin::new()))
    }
}

impl LocalLoadBalancer {
    pub fn new(policy: Arc<dyn SelectionPolicy>) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Keep pools in sync with backend events.
    pub fn subscribe(self: &Arc<Self>, broadcaster: &Arc<Broadcaster>) -> Subscription {
        let lb = self.clone();
        Subscriber::new()
            .on(EventType::BackendAdded, {
                let lb = lb.clone();
                move |event| {
                    let lb = lb.clone();
                    async move {
                        if let Event::BackendAdded {
                            upstream_id,
                            backend,
                        } = event
                        {
                            lb.insert(&upstream_id, backend);
                        }
                    }
                }
            })
            .on(EventType::BackendRemoved, {
                let lb = lb.clone();
                move |event| {
                    let lb = lb.clone();
                    async move {
                        if let Event::BackendRemoved { backend, .. } = event {
                            lb.remove(&backend.id);
                        }
                    }
                }
            })
            .on(EventType::UpstreamRemoved, move |event| {
                let lb = lb.clone();
                async move {
                    if let Event::UpstreamRemoved { upstream } = event {
                        lb.write().remove(&upstream.id);
                    }
                }
            })
            .subscribe(broadcaster)
    }

    pub fn backend_count(&self, upstream_id: &UpstreamId) -> usize {
        self.read().get(upstream_id).map_or(0, Vec::len)
    }

    fn read(&self) -> RwLockReadGuard<'_, Pools> {
        self.pools.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Pools> {
        self.pools.write().unwrap_or_else(|p| p.into_inner())
    }

    fn insert(&self, upstream_id: &UpstreamId, backend: Backend) {
        let mut pools = self.write();
        let pool = pools.entry(upstream_id.clone()).or_default();
        match pool.binary_search_by(|b| b.id.cmp(&backend.id)) {
            Ok(index) => pool[index] = backend,
            Err(index) => pool.insert(index, backend),
        }
    }

    fn remove(&self, backend_id: &BackendId) -> bool {
        let mut pools = self.write();
        let mut removed = false;
        pools.retain(|_, pool| {
            if let Ok(index) = pool.binary_search_by(|b| b.id.cmp(backend_id)) {
                pool.remove(index);
                removed = true;
            }
            !pool.is_empty()
        });
        removed
    }
}

#[async_trait]
impl LoadBalancer for LocalLoadBalancer {
    async fn get_backend(&self, upstream_id: &UpstreamId) -> Result<Backend, GatewayError> {
        let pools = self.read();
        pools
            .get(upstream_id)
            .and_then(|pool| self.policy.next_backend(pool))
            .cloned()
            .ok_or_else(|| GatewayError::BackendNotFound {
                upstream_id: upstream_id.to_string(),
            })
    }

    async fn add_backend(&self, upstream_id: &UpstreamId, backend: Backend) -> Result<(), GatewayError> {
        self.insert(upstream_id, backend);
        Ok(())
    }

    async fn remove_backend(&self, backend_id: &BackendId) -> Result<(), GatewayError> {
        self.remove(backend_id);
        Ok(())
    }
}
