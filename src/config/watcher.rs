//! Configuration file watcher for hot reload.
//!
//! Only `[[upstreams]]` is reloaded at runtime. Editors tend to produce a
//! burst of events per save, so events are collapsed until the file has been
//! quiet for the debounce window, then the file is parsed once. A reloaded
//! file whose upstreams are unchanged is not forwarded; changes to any other
//! section are logged as needing a restart.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::loader::load_config;
use crate::config::schema::GatewayConfig;

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Watches the configuration file and forwards topology changes.
pub struct ConfigWatcher {
    path: PathBuf,
    current: GatewayConfig,
    debounce: Duration,
    update_tx: mpsc::UnboundedSender<GatewayConfig>,
}

/// Keeps the file watch and its debounce task alive; dropping it stops both.
pub struct WatchHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ConfigWatcher {
    /// `current` is the configuration the gateway was started with.
    ///
    /// Returns the watcher and a receiver of configs whose upstreams differ
    /// from the last one delivered.
    pub fn new(path: &Path, current: GatewayConfig) -> (Self, mpsc::UnboundedReceiver<GatewayConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                current,
                debounce: DEFAULT_DEBOUNCE,
                update_tx,
            },
            update_rx,
        )
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Start watching. Must be called inside a Tokio runtime.
    pub fn run(self) -> Result<WatchHandle, notify::Error> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let _ = raw_tx.send(());
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?self.path, debounce_ms = self.debounce.as_millis() as u64, "Config watcher started");

        let task = tokio::spawn(self.forward(raw_rx));
        Ok(WatchHandle {
            _watcher: watcher,
            task,
        })
    }

    async fn forward(mut self, mut raw: mpsc::UnboundedReceiver<()>) {
        while raw.recv().await.is_some() {
            // Wait for the file to settle.
            loop {
                match tokio::time::timeout(self.debounce, raw.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            let next = match load_config(&self.path) {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(path = ?self.path, error = %e, "Failed to reload config, keeping current topology");
                    continue;
                }
            };
            if let Some(update) = topology_update(&mut self.current, next) {
                tracing::info!(path = ?self.path, upstreams = update.upstreams.len(), "Config upstreams changed");
                if self.update_tx.send(update).is_err() {
                    return;
                }
            }
        }
    }
}

/// Replace `current` with `next`; returns `next` only when its upstreams
/// differ.
fn topology_update(current: &mut GatewayConfig, next: GatewayConfig) -> Option<GatewayConfig> {
    if settings_differ(current, &next) {
        tracing::warn!("Config sections other than [[upstreams]] changed; they apply after a restart");
    }
    let changed = current.upstreams != next.upstreams;
    *current = next;
    if !changed {
        tracing::debug!("Config reloaded without upstream changes");
        return None;
    }
    Some(current.clone())
}

fn settings_differ(a: &GatewayConfig, b: &GatewayConfig) -> bool {
    let strip = |config: &GatewayConfig| {
        let mut config = config.clone();
        config.upstreams.clear();
        serde_json::to_value(config).ok()
    };
    strip(a) != strip(b)
}
