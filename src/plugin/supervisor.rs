//! Plugin supervisor.
//!
//! # Responsibilities
//! - Keep exactly one instance of a plugin alive, configured and callable
//! - Wrap every call in a timeout and a retry budget, emitting metrics
//! - Heartbeat the instance and rebuild it after repeated failures
//!
//! # Design Decisions
//! - One read/write lock guards the live instance; calls hold the read lock
//!   while they wait, rebuild and stop take the write lock
//! - Each attempt runs as its own task so a timed-out call is abandoned,
//!   never awaited
//! - Timeouts and capability-cast failures are not retried
//! - State a caller pushed into the old instance is replayed into a rebuilt
//!   one through restart hooks, before the new instance becomes callable

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{ErrorCollector, MultiError};
use crate::observability::{Metric, MetricSink};
use crate::plugin::{Plugin, PluginDescriptor, PluginError, PluginLauncher, PluginType};

/// Consecutive failed heartbeat calls before the instance is rebuilt.
const HEARTBEAT_ATTEMPTS: u32 = 3;

/// Runs against a freshly rebuilt instance before it replaces the old one.
pub type RestartHook = Arc<dyn Fn(Arc<dyn Plugin>) -> BoxFuture<'static, Result<(), PluginError>> + Send + Sync>;

/// Supervises one plugin. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    descriptor: PluginDescriptor,
    launcher: Arc<dyn PluginLauncher>,
    metrics: Arc<dyn MetricSink>,
    instance: RwLock<Option<Arc<dyn Plugin>>>,
    heartbeat: Mutex<Option<HeartbeatWorker>>,
    restart_hooks: RestartHooks,
}

#[derive(Default)]
struct RestartHooks(Mutex<Vec<RestartHook>>);

impl RestartHooks {
    fn push(&self, hook: RestartHook) {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).push(hook);
    }

    fn snapshot(&self) -> Vec<RestartHook> {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl fmt::Debug for RestartHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestartHooks")
            .field("count", &self.snapshot().len())
            .finish()
    }
}

#[derive(Debug)]
struct HeartbeatWorker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Supervisor {
    pub fn new(
        descriptor: PluginDescriptor,
        launcher: Arc<dyn PluginLauncher>,
        metrics: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                descriptor,
                launcher,
                metrics,
                instance: RwLock::new(None),
                heartbeat: Mutex::new(None),
                restart_hooks: RestartHooks::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.descriptor.name
    }

    pub fn plugin_type(&self) -> PluginType {
        self.inner.descriptor.plugin_type
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.inner.descriptor
    }

    pub async fn is_running(&self) -> bool {
        self.inner.instance.read().await.is_some()
    }

    /// Build the instance (launch, `Configure`, `Start`) and start heartbeats.
    pub async fn start(&self) -> Result<(), PluginError> {
        {
            let mut slot = self.inner.instance.write().await;
            if slot.is_some() || self.inner.heartbeat_running() {
                return Err(PluginError::AlreadyRunning);
            }
            *slot = Some(self.inner.build().await?);
        }

        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(heartbeat_loop(
            Arc::downgrade(&self.inner),
            self.inner.descriptor.heartbeat_interval,
            stop_rx,
        ));
        *self.inner.lock_heartbeat() = Some(HeartbeatWorker { stop, handle });

        tracing::info!(
            plugin = %self.name(),
            plugin_type = %self.plugin_type(),
            "Plugin started"
        );
        Ok(())
    }

    /// Stop heartbeats, then the plugin, then its process.
    ///
    /// Every step runs even if an earlier one failed; all failures are
    /// returned together. Stopping a stopped supervisor yields `NotRunning`.
    pub async fn stop(&self, deadline: Duration) -> Result<(), MultiError<PluginError>> {
        let errors = ErrorCollector::new();

        let worker = self.inner.lock_heartbeat().take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(());
            let abort = worker.handle.abort_handle();
            if tokio::time::timeout(deadline, worker.handle).await.is_err() {
                abort.abort();
                errors.push(PluginError::Timeout {
                    method: "HeartbeatShutdown".to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                });
            }
        }

        let mut slot = self.inner.instance.write().await;
        match slot.take() {
            Some(plugin) => {
                match tokio::time::timeout(deadline, plugin.stop()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => errors.push(e),
                    Err(_) => errors.push(PluginError::Timeout {
                        method: "Stop".to_string(),
                        timeout_ms: deadline.as_millis() as u64,
                    }),
                }
                if let Err(e) = plugin.kill().await {
                    errors.push(e);
                }
                tracing::info!(plugin = %self.name(), "Plugin stopped");
            }
            None => errors.push(PluginError::NotRunning),
        }

        errors.into_result()
    }

    /// Register `hook` to run against every rebuilt instance.
    ///
    /// Hooks run in registration order while calls are held back; a failing
    /// hook fails the rebuild and the next heartbeat tries again.
    pub fn on_restart<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<dyn Plugin>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
    {
        let hook: RestartHook = Arc::new(move |plugin| -> BoxFuture<'static, Result<(), PluginError>> {
            Box::pin(hook(plugin))
        });
        self.inner.restart_hooks.push(hook);
    }

    /// Run `f` against the live instance with timeout and retries.
    ///
    /// `f` is invoked once per attempt. A timed-out attempt is left running
    /// in the background and the caller gets `PluginError::Timeout` at once.
    pub async fn call<T, F, Fut>(&self, method: &str, f: F) -> Result<T, PluginError>
    where
        F: Fn(Arc<dyn Plugin>) -> Fut,
        Fut: Future<Output = Result<T, PluginError>> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.call(method, f).await
    }
}

impl Inner {
    fn lock_heartbeat(&self) -> std::sync::MutexGuard<'_, Option<HeartbeatWorker>> {
        self.heartbeat.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn heartbeat_running(&self) -> bool {
        self.lock_heartbeat().is_some()
    }

    /// Launch a fresh instance; on a failed `Configure`/`Start` it is torn
    /// down before the error is returned.
    async fn build(&self) -> Result<Arc<dyn Plugin>, PluginError> {
        let descriptor = &self.descriptor;
        let plugin = self.launcher.launch(descriptor).await?;
        if plugin.plugin_type() != descriptor.plugin_type {
            let err = PluginError::internal(&descriptor.name, descriptor.plugin_type);
            self.internal_error(&err);
            let _ = plugin.kill().await;
            return Err(err);
        }

        let bring_up = async {
            plugin.configure(&descriptor.options).await?;
            plugin.start().await
        };
        let result = match tokio::time::timeout(descriptor.call_timeout * 2, bring_up).await {
            Ok(result) => result,
            Err(_) => Err(PluginError::Timeout {
                method: "Start".to_string(),
                timeout_ms: (descriptor.call_timeout * 2).as_millis() as u64,
            }),
        };
        if let Err(e) = result {
            tracing::warn!(plugin = %descriptor.name, error = %e, "Plugin failed to start");
            let _ = plugin.stop().await;
            let _ = plugin.kill().await;
            return Err(e);
        }
        Ok(plugin)
    }

    async fn call<T, F, Fut>(&self, method: &str, f: F) -> Result<T, PluginError>
    where
        F: Fn(Arc<dyn Plugin>) -> Fut,
        Fut: Future<Output = Result<T, PluginError>> + Send + 'static,
        T: Send + 'static,
    {
        let plugin_name = &self.descriptor.name;
        let budget = self.descriptor.retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = self.attempt(method, &f).await;
            self.metrics.emit(Metric::PluginCall {
                plugin: plugin_name.clone(),
                method: method.to_string(),
                duration: started.elapsed(),
                success: result.is_ok(),
            });

            let err = match result {
                Ok(value) => {
                    self.record_retries(method, attempt);
                    return Ok(value);
                }
                Err(err) => err,
            };
            if matches!(err, PluginError::Internal { .. }) {
                self.internal_error(&err);
            }
            if !err.is_retryable() || attempt >= budget {
                self.record_retries(method, attempt);
                return Err(err);
            }
            tracing::debug!(
                plugin = %plugin_name,
                method,
                attempt,
                error = %err,
                "Plugin call failed, retrying"
            );
        }
    }

    async fn attempt<T, F, Fut>(&self, method: &str, f: &F) -> Result<T, PluginError>
    where
        F: Fn(Arc<dyn Plugin>) -> Fut,
        Fut: Future<Output = Result<T, PluginError>> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.instance.read().await;
        let plugin = guard.clone().ok_or(PluginError::NotRunning)?;
        let task = tokio::spawn(f(plugin));
        let result = match tokio::time::timeout(self.descriptor.call_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(PluginError::Protocol(format!(
                "plugin call '{}' aborted: {}",
                method, join_error
            ))),
            Err(_) => Err(PluginError::Timeout {
                method: method.to_string(),
                timeout_ms: self.descriptor.call_timeout.as_millis() as u64,
            }),
        };
        drop(guard);
        result
    }

    fn record_retries(&self, method: &str, attempts: u32) {
        if attempts > 1 {
            self.metrics.emit(Metric::PluginRetried {
                plugin: self.descriptor.name.clone(),
                method: method.to_string(),
                attempts,
            });
        }
    }

    fn internal_error(&self, err: &PluginError) {
        tracing::error!(plugin = %self.descriptor.name, error = %err, "Plugin capability mismatch");
        if self.descriptor.fail_hard {
            tracing::error!("plugins.fail_hard is set, terminating");
            std::process::exit(1);
        }
    }

    async fn heartbeat(&self) -> Result<(), PluginError> {
        let mut last = PluginError::NotRunning;
        for attempt in 1..=HEARTBEAT_ATTEMPTS {
            match self
                .call("Heartbeat", |plugin| async move { plugin.heartbeat().await })
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(plugin = %self.descriptor.name, attempt, error = %e, "Heartbeat failed");
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Discard the current instance and build a new one. Calls wait on the
    /// write lock meanwhile.
    async fn rebuild(&self) -> Result<(), PluginError> {
        let mut slot = self.instance.write().await;
        if let Some(old) = slot.take() {
            if let Err(e) = old.kill().await {
                tracing::debug!(plugin = %self.descriptor.name, error = %e, "Failed to kill old instance");
            }
        }
        let plugin = self.build().await?;
        if let Err(e) = self.replay(&plugin).await {
            tracing::warn!(plugin = %self.descriptor.name, error = %e, "Replaying state into rebuilt plugin failed");
            let _ = plugin.stop().await;
            let _ = plugin.kill().await;
            return Err(e);
        }
        *slot = Some(plugin);
        self.metrics.emit(Metric::PluginRestarted {
            plugin: self.descriptor.name.clone(),
        });
        tracing::warn!(plugin = %self.descriptor.name, "Plugin rebuilt after heartbeat failures");
        Ok(())
    }

    async fn replay(&self, plugin: &Arc<dyn Plugin>) -> Result<(), PluginError> {
        let bound = self.descriptor.call_timeout * 2;
        for hook in self.restart_hooks.snapshot() {
            match tokio::time::timeout(bound, hook(plugin.clone())).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(PluginError::Timeout {
                        method: "Replay".to_string(),
                        timeout_ms: bound.as_millis() as u64,
                    })
                }
            }
        }
        Ok(())
    }
}

async fn heartbeat_loop(inner: Weak<Inner>, interval: Duration, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                if let Err(e) = inner.heartbeat().await {
                    tracing::warn!(plugin = %inner.descriptor.name, error = %e, "Plugin unresponsive, rebuilding");
                    if let Err(e) = inner.rebuild().await {
                        tracing::error!(plugin = %inner.descriptor.name, error = %e, "Plugin rebuild failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::RecordingSink;
    use crate::plugin::PluginOptions;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct MockPlugin {
        name: String,
        heartbeat_fails: bool,
        configure_fails: bool,
        killed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Plugin for MockPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        fn plugin_type(&self) -> PluginType {
            PluginType::Modifier
        }

        async fn configure(&self, _options: &PluginOptions) -> Result<(), PluginError> {
            if self.configure_fails {
                return Err(PluginError::Remote("missing option".into()));
            }
            Ok(())
        }

        async fn start(&self) -> Result<(), PluginError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), PluginError> {
            Ok(())
        }

        async fn heartbeat(&self) -> Result<(), PluginError> {
            if self.heartbeat_fails {
                return Err(PluginError::Remote("unhealthy".into()));
            }
            Ok(())
        }

        async fn kill(&self) -> Result<(), PluginError> {
            self.killed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// First instance fails heartbeats when `sick_first` is set.
    #[derive(Debug, Default)]
    struct MockLauncher {
        launches: AtomicUsize,
        sick_first: bool,
        configure_fails: bool,
        killed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PluginLauncher for MockLauncher {
        async fn launch(&self, descriptor: &PluginDescriptor) -> Result<Arc<dyn Plugin>, PluginError> {
            let generation = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Arc::new(MockPlugin {
                name: format!("{}-{}", descriptor.name, generation),
                heartbeat_fails: self.sick_first && generation == 1,
                configure_fails: self.configure_fails,
                killed: self.killed.clone(),
            }))
        }
    }

    fn descriptor() -> PluginDescriptor {
        PluginDescriptor::new("mock", PluginType::Modifier, "mock-plugin")
            .with_call_timeout(Duration::from_millis(50))
            .with_retries(3)
    }

    fn supervisor(launcher: MockLauncher, descriptor: PluginDescriptor) -> (Supervisor, Arc<MockLauncher>, Arc<RecordingSink>) {
        let launcher = Arc::new(launcher);
        let sink = Arc::new(RecordingSink::new());
        let supervisor = Supervisor::new(descriptor, launcher.clone(), sink.clone());
        (supervisor, launcher, sink)
    }

    #[tokio::test]
    async fn test_call_times_out_without_waiting() {
        let (supervisor, _, _) = supervisor(MockLauncher::default(), descriptor());
        supervisor.start().await.unwrap();

        let started = Instant::now();
        let result: Result<(), _> = supervisor
            .call("Hang", |_plugin| std::future::pending())
            .await;
        assert!(matches!(result, Err(PluginError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_call_retries_then_succeeds() {
        let (supervisor, _, sink) = supervisor(MockLauncher::default(), descriptor());
        supervisor.start().await.unwrap();

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = supervisor
            .call("Flaky", move |_plugin| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(PluginError::Remote("try again".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));

        let metrics = sink.snapshot();
        let calls = metrics
            .iter()
            .filter(|m| matches!(m, Metric::PluginCall { method, .. } if method == "Flaky"))
            .count();
        assert_eq!(calls, 3);
        assert!(metrics
            .iter()
            .any(|m| matches!(m, Metric::PluginRetried { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_call_gives_up_after_budget() {
        let (supervisor, _, _) = supervisor(MockLauncher::default(), descriptor());
        supervisor.start().await.unwrap();

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<(), _> = supervisor
            .call("Broken", move |_plugin| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(PluginError::Remote("boom".into())) }
            })
            .await;
        assert_eq!(result, Err(PluginError::Remote("boom".into())));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_capability_mismatch_is_not_retried() {
        let (supervisor, _, _) = supervisor(MockLauncher::default(), descriptor());
        supervisor.start().await.unwrap();

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = supervisor
            .call("RouteRequest", move |plugin| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    plugin
                        .as_router()
                        .map(|_| ())
                        .ok_or_else(|| PluginError::internal(plugin.name(), PluginType::Router))
                }
            })
            .await;
        assert!(matches!(result, Err(PluginError::Internal { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_twice_reports_not_running() {
        let (supervisor, launcher, _) = supervisor(MockLauncher::default(), descriptor());
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.start().await, Err(PluginError::AlreadyRunning));

        supervisor.stop(Duration::from_secs(1)).await.unwrap();
        assert!(launcher.killed.load(Ordering::SeqCst));
        assert!(!supervisor.is_running().await);

        let err = supervisor.stop(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.errors(), &[PluginError::NotRunning]);

        let result: Result<(), _> = supervisor.call("Late", |_plugin| async { Ok(()) }).await;
        assert_eq!(result, Err(PluginError::NotRunning));
    }

    #[tokio::test]
    async fn test_failed_configure_tears_down() {
        let launcher = MockLauncher {
            configure_fails: true,
            ..MockLauncher::default()
        };
        let (supervisor, launcher, _) = supervisor(launcher, descriptor());
        assert!(supervisor.start().await.is_err());
        assert!(launcher.killed.load(Ordering::SeqCst));
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    async fn test_heartbeat_failures_rebuild_instance() {
        let launcher = MockLauncher {
            sick_first: true,
            ..MockLauncher::default()
        };
        let descriptor = descriptor()
            .with_retries(1)
            .with_heartbeat_interval(Duration::from_millis(20));
        let (supervisor, launcher, sink) = supervisor(launcher, descriptor);
        supervisor.start().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while launcher.launches.load(Ordering::SeqCst) < 2 {
            assert!(Instant::now() < deadline, "plugin was never rebuilt");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let name = supervisor
            .call("Name", |plugin| async move { Ok(plugin.name().to_string()) })
            .await
            .unwrap();
        assert_eq!(name, "mock-2");
        assert!(sink
            .snapshot()
            .iter()
            .any(|m| matches!(m, Metric::PluginRestarted { .. })));

        supervisor.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_hooks_see_new_instance_before_callers() {
        let launcher = MockLauncher {
            sick_first: true,
            ..MockLauncher::default()
        };
        let descriptor = descriptor()
            .with_retries(1)
            .with_heartbeat_interval(Duration::from_millis(20));
        let (supervisor, launcher, _) = supervisor(launcher, descriptor);

        let replayed = Arc::new(Mutex::new(Vec::new()));
        let seen = replayed.clone();
        supervisor.on_restart(move |plugin| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(plugin.name().to_string());
                Ok::<(), PluginError>(())
            }
        });
        supervisor.start().await.unwrap();
        assert!(replayed.lock().unwrap().is_empty());

        let deadline = Instant::now() + Duration::from_secs(5);
        while launcher.launches.load(Ordering::SeqCst) < 2 {
            assert!(Instant::now() < deadline, "plugin was never rebuilt");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The rebuild holds the instance lock until hooks have run.
        supervisor
            .call("Name", |plugin| async move { Ok(plugin.name().to_string()) })
            .await
            .unwrap();
        assert_eq!(*replayed.lock().unwrap(), vec!["mock-2".to_string()]);

        supervisor.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_restart_hook_discards_instance() {
        let launcher = MockLauncher {
            sick_first: true,
            ..MockLauncher::default()
        };
        let descriptor = descriptor()
            .with_retries(1)
            .with_heartbeat_interval(Duration::from_millis(20));
        let (supervisor, launcher, _) = supervisor(launcher, descriptor);

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        supervisor.on_restart(move |_plugin| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    Err(PluginError::Remote("replay refused".into()))
                } else {
                    Ok(())
                }
            }
        });
        supervisor.start().await.unwrap();

        // First rebuild is rejected by the hook; the next heartbeat rebuilds again.
        let deadline = Instant::now() + Duration::from_secs(5);
        while attempts.load(Ordering::SeqCst) < 2 {
            assert!(Instant::now() < deadline, "rebuild was not retried");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let name = supervisor
            .call("Name", |plugin| async move { Ok(plugin.name().to_string()) })
            .await
            .unwrap();
        assert_eq!(name, "mock-3");
        assert!(launcher.killed.load(Ordering::SeqCst));

        supervisor.stop(Duration::from_secs(1)).await.unwrap();
    }
}
