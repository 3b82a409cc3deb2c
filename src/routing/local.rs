//! In-memory router.
//!
//! # Responsibilities
//! - Own the upstream registry and two lookaside caches
//!   (exact hostname → upstream, exact prefix → upstream)
//! - Keep both current from topology events
//!
//! # Design Decisions
//! - Cache hits only take the read lock
//! - A miss scans under the write lock and populates the cache in the same
//!   critical section, so a concurrent removal can never leave a stale entry
//! - Adding, replacing or removing an upstream purges every cache entry that
//!   points at it

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::events::{Broadcaster, Subscriber, Subscription};
use crate::http::RequestSnapshot;
use crate::routing::matcher::{matches_host, matches_prefix};
use crate::routing::{MatchKind, Router};
use crate::topology::{Event, EventType, Upstream, UpstreamId};

#[derive(Debug, Default)]
struct RouterState {
    upstreams: BTreeMap<UpstreamId, Upstream>,
    hostname_cache: HashMap<String, Upstream>,
    prefix_cache: HashMap<String, Upstream>,
}

impl RouterState {
    fn purge(&mut self, id: &UpstreamId) {
        self.hostname_cache.retain(|_, upstream| upstream.id != *id);
        self.prefix_cache.retain(|_, upstream| upstream.id != *id);
    }
}

#[derive(Debug, Default)]
pub struct LocalRouter {
    state: RwLock<RouterState>,
    scans: AtomicU64,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the registry in sync with upstream events.
    pub fn subscribe(self: &Arc<Self>, broadcaster: &Arc<Broadcaster>) -> Subscription {
        let on_added = self.clone();
        let on_removed = self.clone();
        Subscriber::new()
            .on(EventType::UpstreamAdded, move |event| {
                let router = on_added.clone();
                async move {
                    if let Event::UpstreamAdded { upstream } = event {
                        router.insert(upstream);
                    }
                }
            })
            .on(EventType::UpstreamRemoved, move |event| {
                let router = on_removed.clone();
                async move {
                    if let Event::UpstreamRemoved { upstream } = event {
                        router.remove(&upstream.id);
                    }
                }
            })
            .subscribe(broadcaster)
    }

    /// Number of full scans performed (cache misses).
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    pub fn cached_entries(&self) -> usize {
        let state = self.read();
        state.hostname_cache.len() + state.prefix_cache.len()
    }

    pub fn upstream_count(&self) -> usize {
        self.read().upstreams.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, RouterState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RouterState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    fn insert(&self, upstream: Upstream) {
        let upstream = upstream.normalized();
        let mut state = self.write();
        state.purge(&upstream.id);
        tracing::debug!(upstream_id = %upstream.id, "Router registered upstream");
        state.upstreams.insert(upstream.id.clone(), upstream);
    }

    fn remove(&self, id: &UpstreamId) -> bool {
        let mut state = self.write();
        state.purge(id);
        let removed = state.upstreams.remove(id).is_some();
        tracing::debug!(upstream_id = %id, removed, "Router dropped upstream");
        removed
    }

    fn lookup(&self, request: &RequestSnapshot) -> Option<(Upstream, MatchKind)> {
        {
            let state = self.read();
            if let Some(upstream) = state.prefix_cache.get(&request.prefix) {
                return Some((upstream.clone(), MatchKind::Prefix));
            }
            if let Some(upstream) = state.hostname_cache.get(&request.host) {
                return Some((upstream.clone(), MatchKind::Hostname));
            }
        }

        let mut state = self.write();
        self.scans.fetch_add(1, Ordering::Relaxed);

        let by_prefix = state
            .upstreams
            .values()
            .find(|u| matches_prefix(u, request))
            .cloned();
        if let Some(upstream) = by_prefix {
            state
                .prefix_cache
                .insert(request.prefix.clone(), upstream.clone());
            return Some((upstream, MatchKind::Prefix));
        }

        let by_host = state
            .upstreams
            .values()
            .find(|u| matches_host(u, request))
            .cloned();
        if let Some(upstream) = by_host {
            state
                .hostname_cache
                .insert(request.host.clone(), upstream.clone());
            return Some((upstream, MatchKind::Hostname));
        }
        None
    }
}

#[async_trait]
impl Router for LocalRouter {
    async fn route_request(
        &self,
        mut request: RequestSnapshot,
    ) -> Result<(Upstream, RequestSnapshot), GatewayError> {
        match self.lookup(&request) {
            Some((upstream, kind)) => {
                request.match_kind = Some(kind);
                Ok((upstream, request))
            }
            None => Err(GatewayError::RouteNotFound {
                host: request.host.clone(),
                path: request.path.clone(),
            }),
        }
    }

    async fn add_upstream(&self, upstream: Upstream) -> Result<(), GatewayError> {
        self.insert(upstream);
        Ok(())
    }

    async fn remove_upstream(&self, id: &UpstreamId) -> Result<(), GatewayError> {
        self.remove(id);
        Ok(())
    }
}
