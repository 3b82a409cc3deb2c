//! Startup orchestration.
//!
//! # Responsibilities
//! - Assemble topology, broadcaster and serving components from config
//! - Start plugins before anything can depend on them
//! - Subscribe router and load balancer before topology starts to flow
//! - Seed the static topology from `[[upstreams]]`
//!
//! # Design Decisions
//! - Fail fast: a plugin that cannot start is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listeners start last (traffic only when ready)

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::admin::{setup_admin_router, AdminState};
use crate::config::GatewayConfig;
use crate::error::MultiError;
use crate::events::{Broadcaster, Subscription};
use crate::http::{AppState, HttpServer, Proxier};
use crate::load_balancer::{policy_from_config, LoadBalancer, LocalLoadBalancer, PluginLoadBalancer};
use crate::modifier::{Modifier, ModifierChain, NoopModifier, PluginModifier};
use crate::observability::{FanoutSink, MetricSink, PluginSink};
use crate::plugin::{
    spawn_drain, PluginDescriptor, PluginError, PluginLauncher, PluginSet, PluginType, ProcessLauncher,
    Supervisor, TopologyCommand,
};
use crate::routing::{LocalRouter, PluginRouter, Router};
use crate::topology::{IdGenerator, Manager, StaticSource, TopologyError, UuidGenerator};

const DISCOVERY_QUEUE: usize = 256;

/// Deadline for tearing down plugins after a failed startup.
const ABORT_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("plugins failed to start: {0}")]
    Plugins(#[from] MultiError<PluginError>),

    #[error("static topology rejected: {0}")]
    Topology(#[from] MultiError<TopologyError>),
}

/// How plugin processes are launched.
#[derive(Debug, Clone)]
pub struct Launchers {
    /// For upstream-discovery plugins; their notifications feed the manager.
    pub discovery: Arc<dyn PluginLauncher>,
    /// For every other capability.
    pub plugins: Arc<dyn PluginLauncher>,
}

/// The assembled gateway: topology, plugins and serving components.
#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
    manager: Arc<Manager>,
    static_source: StaticSource,
    plugins: PluginSet,
    router: Arc<dyn Router>,
    load_balancer: Arc<dyn LoadBalancer>,
    proxier: Proxier,
    subscriptions: Vec<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Assemble with child-process plugins and UUID identifiers.
    pub async fn start(config: GatewayConfig, metrics: Arc<dyn MetricSink>) -> Result<Self, StartupError> {
        let (commands, queue) = mpsc::channel(DISCOVERY_QUEUE);
        let launchers = Launchers {
            discovery: Arc::new(ProcessLauncher::new().with_discovery(commands)),
            plugins: Arc::new(ProcessLauncher::new()),
        };
        Self::assemble(config, metrics, Arc::new(UuidGenerator), launchers, queue).await
    }

    /// Assemble from explicit parts.
    ///
    /// `base_metrics` must not route back into metric plugins; it is the
    /// sink the metric plugins' own supervisors report to.
    pub async fn assemble(
        config: GatewayConfig,
        base_metrics: Arc<dyn MetricSink>,
        ids: Arc<dyn IdGenerator>,
        launchers: Launchers,
        discovery_queue: mpsc::Receiver<TopologyCommand>,
    ) -> Result<Self, StartupError> {
        let plugins_config = &config.plugins;
        let broadcaster = Arc::new(Broadcaster::new());
        let manager = Arc::new(Manager::new(broadcaster.clone(), ids));
        let mut plugins = PluginSet::new();
        let mut tasks = Vec::new();

        // 1. Metric plugins report through the base sink only.
        let metric_supervisors: Vec<Supervisor> = plugins_config
            .metrics
            .iter()
            .map(|p| {
                Supervisor::new(
                    PluginDescriptor::from_config(PluginType::Metric, p, plugins_config),
                    launchers.plugins.clone(),
                    base_metrics.clone(),
                )
            })
            .collect();
        let metrics: Arc<dyn MetricSink> = if metric_supervisors.is_empty() {
            base_metrics
        } else {
            let (plugin_sink, handle) = PluginSink::spawn(metric_supervisors.clone());
            tasks.push(handle);
            Arc::new(FanoutSink::new(vec![base_metrics, Arc::new(plugin_sink)]))
        };
        for supervisor in metric_supervisors {
            plugins.push(supervisor);
        }

        let supervise = |plugin_type: PluginType, config: &crate::config::PluginConfig, launcher: &Arc<dyn PluginLauncher>| {
            Supervisor::new(
                PluginDescriptor::from_config(plugin_type, config, plugins_config),
                launcher.clone(),
                metrics.clone(),
            )
        };

        // 2. Serving plugins.
        let router_supervisor = plugins_config
            .router
            .as_ref()
            .map(|p| supervise(PluginType::Router, p, &launchers.plugins));
        let lb_supervisor = plugins_config
            .load_balancer
            .as_ref()
            .map(|p| supervise(PluginType::LoadBalancer, p, &launchers.plugins));
        let modifier_supervisors: Vec<Supervisor> = plugins_config
            .modifiers
            .iter()
            .map(|p| supervise(PluginType::Modifier, p, &launchers.plugins))
            .collect();
        for supervisor in router_supervisor
            .iter()
            .chain(lb_supervisor.iter())
            .chain(modifier_supervisors.iter())
        {
            plugins.push(supervisor.clone());
        }

        if let Err(e) = plugins.start_all().await {
            let _ = plugins.stop_all(ABORT_DEADLINE).await;
            abort_all(&tasks);
            return Err(e.into());
        }

        // 3. Router and load balancer follow topology from here on.
        let mut subscriptions = Vec::new();
        let router: Arc<dyn Router> = match router_supervisor {
            Some(supervisor) => {
                let router = Arc::new(PluginRouter::new(supervisor));
                subscriptions.push(router.subscribe(&broadcaster));
                router.replay_on_restart(&manager);
                router
            }
            None => {
                let router = Arc::new(LocalRouter::new());
                subscriptions.push(router.subscribe(&broadcaster));
                router
            }
        };
        let load_balancer: Arc<dyn LoadBalancer> = match lb_supervisor {
            Some(supervisor) => {
                let lb = Arc::new(PluginLoadBalancer::new(supervisor));
                subscriptions.push(lb.subscribe(&broadcaster));
                lb.replay_on_restart(&manager);
                lb
            }
            None => {
                let lb = Arc::new(LocalLoadBalancer::new(policy_from_config(&config.load_balancer)));
                subscriptions.push(lb.subscribe(&broadcaster));
                lb
            }
        };

        let modifier: Arc<dyn Modifier> = if modifier_supervisors.is_empty() {
            Arc::new(NoopModifier)
        } else {
            Arc::new(ModifierChain::new(
                modifier_supervisors
                    .into_iter()
                    .map(|s| Arc::new(PluginModifier::new(s)) as Arc<dyn Modifier>)
                    .collect(),
            ))
        };
        let proxier = Proxier::new(modifier, config.proxy.default_timeout(), metrics.clone());

        // 4. Discovery plugins feed the manager through the queue.
        tasks.push(spawn_drain(manager.clone(), discovery_queue));
        let mut discovery = PluginSet::new();
        for p in &plugins_config.upstream {
            let supervisor = supervise(PluginType::Upstream, p, &launchers.discovery);
            discovery.push(supervisor.clone());
            plugins.push(supervisor);
        }
        if let Err(e) = discovery.start_all().await {
            let _ = plugins.stop_all(ABORT_DEADLINE).await;
            abort_all(&tasks);
            return Err(e.into());
        }

        // 5. Static topology.
        let static_source = StaticSource::new(manager.clone());
        if let Err(e) = static_source.apply(&config.upstreams) {
            let _ = plugins.stop_all(ABORT_DEADLINE).await;
            abort_all(&tasks);
            return Err(e.into());
        }

        tracing::info!(
            plugins = plugins.len(),
            upstreams = manager.upstreams().len(),
            "Gateway assembled"
        );

        Ok(Self {
            config,
            manager,
            static_source,
            plugins,
            router,
            load_balancer,
            proxier,
            subscriptions,
            tasks,
        })
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn plugins(&self) -> &PluginSet {
        &self.plugins
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            router: self.router.clone(),
            load_balancer: self.load_balancer.clone(),
            proxier: self.proxier.clone(),
        }
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState::new(self.manager.clone(), self.plugins.clone(), &self.config.admin.api_key)
    }

    /// Enabled listeners paired with their bind addresses.
    pub fn servers(&self) -> Vec<(HttpServer, String)> {
        let listeners = &self.config.listeners;
        let mut servers = Vec::new();
        if listeners.public.enabled {
            servers.push((
                HttpServer::public(self.app_state()),
                listeners.public.bind_address.clone(),
            ));
        }
        if listeners.internal.enabled {
            if self.config.admin.enabled {
                servers.push((
                    HttpServer::internal(setup_admin_router(self.admin_state())),
                    listeners.internal.bind_address.clone(),
                ));
            } else {
                tracing::info!("Internal listener enabled but admin API disabled, not binding");
            }
        }
        servers
    }

    /// Reconcile the static topology against a reloaded config.
    pub fn reload(&self, config: &GatewayConfig) -> Result<(), MultiError<TopologyError>> {
        self.static_source.apply(&config.upstreams)
    }

    /// Stop plugins within `deadline` and release background tasks.
    pub async fn shutdown(self, deadline: Duration) -> Result<(), MultiError<PluginError>> {
        for subscription in self.subscriptions {
            subscription.unsubscribe().await;
        }
        let result = self.plugins.stop_all(deadline).await;
        abort_all(&self.tasks);
        result
    }
}

fn abort_all(tasks: &[JoinHandle<()>]) {
    for task in tasks {
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, PluginConfig};
    use crate::observability::NoopSink;
    use crate::plugin::{Plugin, PluginOptions, RouteResult, RouterPlugin};
    use crate::http::RequestSnapshot;
    use crate::topology::{SequentialIds, Upstream, UpstreamId};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Routes every request to the single upstream it knows.
    #[derive(Debug, Default)]
    struct CatchAll {
        upstream: std::sync::Mutex<Option<Upstream>>,
    }

    #[async_trait]
    impl Plugin for CatchAll {
        fn name(&self) -> &str {
            "catch-all"
        }

        fn plugin_type(&self) -> PluginType {
            PluginType::Router
        }

        async fn configure(&self, _options: &PluginOptions) -> Result<(), PluginError> {
            Ok(())
        }

        async fn start(&self) -> Result<(), PluginError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), PluginError> {
            Ok(())
        }

        async fn heartbeat(&self) -> Result<(), PluginError> {
            Ok(())
        }

        async fn kill(&self) -> Result<(), PluginError> {
            Ok(())
        }

        fn as_router(&self) -> Option<&dyn RouterPlugin> {
            Some(self)
        }
    }

    #[async_trait]
    impl RouterPlugin for CatchAll {
        async fn add_upstream(&self, upstream: Upstream) -> Result<(), PluginError> {
            *self.upstream.lock().unwrap() = Some(upstream);
            Ok(())
        }

        async fn remove_upstream(&self, _id: UpstreamId) -> Result<(), PluginError> {
            *self.upstream.lock().unwrap() = None;
            Ok(())
        }

        async fn route_request(&self, request: RequestSnapshot) -> Result<RouteResult, PluginError> {
            Ok(RouteResult {
                upstream: self.upstream.lock().unwrap().clone(),
                request,
            })
        }
    }

    #[derive(Debug)]
    struct Fake;

    #[async_trait]
    impl PluginLauncher for Fake {
        async fn launch(&self, descriptor: &PluginDescriptor) -> Result<Arc<dyn Plugin>, PluginError> {
            match descriptor.plugin_type {
                PluginType::Router => Ok(Arc::new(CatchAll::default())),
                _ => Err(PluginError::Spawn(format!("no fake for {}", descriptor.name))),
            }
        }
    }

    fn launchers() -> Launchers {
        Launchers {
            discovery: Arc::new(Fake),
            plugins: Arc::new(Fake),
        }
    }

    async fn assemble(config: GatewayConfig) -> Result<Gateway, StartupError> {
        let (_commands, queue) = mpsc::channel(8);
        Gateway::assemble(
            config,
            Arc::new(NoopSink),
            Arc::new(SequentialIds::new("id")),
            launchers(),
            queue,
        )
        .await
    }

    fn plugin(name: &str) -> PluginConfig {
        PluginConfig {
            name: name.to_string(),
            command: name.to_string(),
            args: HashMap::new(),
            call_timeout_ms: None,
            retries: None,
            heartbeat_interval_ms: None,
        }
    }

    #[tokio::test]
    async fn test_local_gateway_seeds_static_topology() {
        let config = parse_config(
            r#"
            [[upstreams]]
            id = "a"
            hostnames = ["svc.local"]

            [[upstreams.backends]]
            id = "b1"
            address = "http://127.0.0.1:9001"
            "#,
        )
        .unwrap();
        let gateway = assemble(config).await.unwrap();
        assert_eq!(gateway.manager().upstreams().len(), 1);
        assert!(gateway.plugins().is_empty());
        gateway.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_plugin_router_receives_topology() {
        let mut config = GatewayConfig::default();
        config.plugins.router = Some(plugin("router"));
        let gateway = assemble(config).await.unwrap();
        gateway.manager().add_upstream(Upstream::new("a")).unwrap();

        let state = gateway.app_state();
        let mut routed = None;
        for _ in 0..100 {
            if let Ok((upstream, _)) = state
                .router
                .route_request(RequestSnapshot::new("GET", "anything", "/"))
                .await
            {
                routed = Some(upstream);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(routed.map(|u| u.id), Some(UpstreamId::from("a")));
        gateway.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_plugin_start_failure_is_fatal() {
        let mut config = GatewayConfig::default();
        config.plugins.modifiers.push(plugin("headers"));
        let err = assemble(config).await.unwrap_err();
        assert!(matches!(err, StartupError::Plugins(ref e) if e.len() == 1));
    }
}
