//! Router backed by a router plugin.
//!
//! Upstream events are forwarded to the plugin as `AddUpstream` /
//! `RemoveUpstream` calls; `RouteRequest` is answered by the plugin. A
//! rebuilt plugin process starts empty, so the manager's upstreams are
//! replayed into it before it serves any call.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::events::{Broadcaster, Subscriber, Subscription};
use crate::http::RequestSnapshot;
use crate::plugin::{PluginError, PluginType, Supervisor};
use crate::routing::Router;
use crate::topology::{Event, EventType, Manager, Upstream, UpstreamId};

#[derive(Debug, Clone)]
pub struct PluginRouter {
    supervisor: Supervisor,
}

impl PluginRouter {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    /// Forward upstream events to the plugin.
    pub fn subscribe(self: &Arc<Self>, broadcaster: &Arc<Broadcaster>) -> Subscription {
        let router = self.clone();
        Subscriber::new()
            .on(EventType::UpstreamAdded, {
                let router = router.clone();
                move |event| {
                    let router = router.clone();
                    async move {
                        if let Event::UpstreamAdded { upstream } = event {
                            let id = upstream.id.clone();
                            if let Err(e) = router.add_upstream(upstream).await {
                                tracing::warn!(upstream_id = %id, error = %e, "Router plugin rejected upstream");
                            }
                        }
                    }
                }
            })
            .on(EventType::UpstreamRemoved, move |event| {
                let router = router.clone();
                async move {
                    if let Event::UpstreamRemoved { upstream } = event {
                        if let Err(e) = router.remove_upstream(&upstream.id).await {
                            tracing::warn!(upstream_id = %upstream.id, error = %e, "Router plugin failed to remove upstream");
                        }
                    }
                }
            })
            .subscribe(broadcaster)
    }

    /// Re-send every upstream `manager` knows to a rebuilt plugin.
    pub fn replay_on_restart(&self, manager: &Arc<Manager>) {
        let manager: Weak<Manager> = Arc::downgrade(manager);
        let name = self.name();
        self.supervisor.on_restart(move |plugin| {
            let manager = manager.clone();
            let name = name.clone();
            async move {
                let Some(manager) = manager.upgrade() else {
                    return Ok::<(), PluginError>(());
                };
                let router = plugin
                    .as_router()
                    .ok_or_else(|| PluginError::internal(&name, PluginType::Router))?;
                let upstreams = manager.upstreams();
                let count = upstreams.len();
                for upstream in upstreams {
                    router.add_upstream(upstream).await?;
                }
                tracing::info!(plugin = %name, upstreams = count, "Replayed upstreams into router plugin");
                Ok(())
            }
        });
    }

    fn name(&self) -> String {
        self.supervisor.name().to_string()
    }
}

#[async_trait]
impl Router for PluginRouter {
    async fn route_request(
        &self,
        request: RequestSnapshot,
    ) -> Result<(Upstream, RequestSnapshot), GatewayError> {
        let name = self.name();
        let outbound = request.clone();
        let result = self
            .supervisor
            .call("RouteRequest", move |plugin| {
                let request = outbound.clone();
                let name = name.clone();
                async move {
                    plugin
                        .as_router()
                        .ok_or_else(|| PluginError::internal(&name, PluginType::Router))?
                        .route_request(request)
                        .await
                }
            })
            .await?;

        if let Some(err) = result.request.error.clone() {
            return Err(err);
        }
        match result.upstream {
            Some(upstream) => Ok((upstream, result.request)),
            None => Err(GatewayError::RouteNotFound {
                host: request.host,
                path: request.path,
            }),
        }
    }

    async fn add_upstream(&self, upstream: Upstream) -> Result<(), GatewayError> {
        let name = self.name();
        self.supervisor
            .call("AddUpstream", move |plugin| {
                let upstream = upstream.clone();
                let name = name.clone();
                async move {
                    plugin
                        .as_router()
                        .ok_or_else(|| PluginError::internal(&name, PluginType::Router))?
                        .add_upstream(upstream)
                        .await
                }
            })
            .await?;
        Ok(())
    }

    async fn remove_upstream(&self, id: &UpstreamId) -> Result<(), GatewayError> {
        let name = self.name();
        let id = id.clone();
        self.supervisor
            .call("RemoveUpstream", move |plugin| {
                let id = id.clone();
                let name = name.clone();
                async move {
                    plugin
                        .as_router()
                        .ok_or_else(|| PluginError::internal(&name, PluginType::Router))?
                        .remove_upstream(id)
                        .await
                }
            })
            .await?;
        Ok(())
    }
}
