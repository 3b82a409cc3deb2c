//! Load balancer backed by a load-balancer plugin.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::events::{Broadcaster, Subscriber, Subscription};
use crate::load_balancer::LoadBalancer;
use crate::plugin::{PluginError, PluginType, Supervisor};
use crate::topology::{Backend, BackendId, Event, EventType, Manager, UpstreamId};

#[derive(Debug, Clone)]
pub struct PluginLoadBalancer {
    supervisor: Supervisor,
}

impl PluginLoadBalancer {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    /// Forward backend events to the plugin.
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
                            let backend_id = backend.id.clone();
                            if let Err(e) = lb.add_backend(&upstream_id, backend).await {
                                tracing::warn!(%upstream_id, %backend_id, error = %e, "Load balancer plugin rejected backend");
                            }
                        }
                    }
                }
            })
            .on(EventType::BackendRemoved, move |event| {
                let lb = lb.clone();
                async move {
                    if let Event::BackendRemoved { backend, .. } = event {
                        if let Err(e) = lb.remove_backend(&backend.id).await {
                            tracing::warn!(backend_id = %backend.id, error = %e, "Load balancer plugin failed to remove backend");
                        }
                    }
                }
            })
            .subscribe(broadcaster)
    }

    /// Re-send every backend `manager` knows to a rebuilt plugin.
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
                let lb = plugin
                    .as_load_balancer()
                    .ok_or_else(|| PluginError::internal(&name, PluginType::LoadBalancer))?;
                let mut count = 0;
                for upstream in manager.upstreams() {
                    // Removed since the listing; its events handle the rest.
                    let Ok(backends) = manager.backends(&upstream.id) else {
                        continue;
                    };
                    for backend in backends {
                        lb.add_backend(upstream.id.clone(), backend).await?;
                        count += 1;
                    }
                }
                tracing::info!(plugin = %name, backends = count, "Replayed backends into load balancer plugin");
                Ok(())
            }
        });
    }

    fn name(&self) -> String {
        self.supervisor.name().to_string()
    }
}

#[async_trait]
impl LoadBalancer for PluginLoadBalancer {
    async fn get_backend(&self, upstream_id: &UpstreamId) -> Result<Backend, GatewayError> {
        let name = self.name();
        let id = upstream_id.clone();
        let backend = self
            .supervisor
            .call("GetBackend", move |plugin| {
                let id = id.clone();
                let name = name.clone();
                async move {
                    plugin
                        .as_load_balancer()
                        .ok_or_else(|| PluginError::internal(&name, PluginType::LoadBalancer))?
                        .get_backend(id)
                        .await
                }
            })
            .await?;
        backend.ok_or_else(|| GatewayError::BackendNotFound {
            upstream_id: upstream_id.to_string(),
        })
    }

    async fn add_backend(&self, upstream_id: &UpstreamId, backend: Backend) -> Result<(), GatewayError> {
        let name = self.name();
        let upstream_id = upstream_id.clone();
        self.supervisor
            .call("AddBackend", move |plugin| {
                let upstream_id = upstream_id.clone();
                let backend = backend.clone();
                let name = name.clone();
                async move {
                    plugin
                        .as_load_balancer()
                        .ok_or_else(|| PluginError::internal(&name, PluginType::LoadBalancer))?
                        .add_backend(upstream_id, backend)
                        .await
                }
            })
            .await?;
        Ok(())
    }

    async fn remove_backend(&self, backend_id: &BackendId) -> Result<(), GatewayError> {
        let name = self.name();
        let backend_id = backend_id.clone();
        self.supervisor
            .call("RemoveBackend", move |plugin| {
                let backend_id = backend_id.clone();
                let name = name.clone();
                async move {
                    plugin
                        .as_load_balancer()
                        .ok_or_else(|| PluginError::internal(&name, PluginType::LoadBalancer))?
                        .remove_backend(backend_id)
                        .await
                }
            })
            .await?;
        Ok(())
    }
}
