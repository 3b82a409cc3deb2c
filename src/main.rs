//! plugin-gateway
//!
//! An HTTP gateway whose routing, load balancing and modification policies
//! are pluggable, either in-process or as supervised plugin processes.
//!
//! # Architecture Overview
//!
//! ```text
//!                   ┌──────────────────────────────────────────────────────────┐
//!                   │                        GATEWAY                           │
//!                   │                                                          │
//!  discovery ───────┼─▶ topology::Manager ──▶ events::Broadcaster ──┐          │
//!  plugins / admin  │                                              │ hooks    │
//!  / config file    │                                              ▼          │
//!                   │  ┌─────────┐    ┌─────────┐    ┌───────────────┐        │
//!  Client Request ──┼─▶│  http   │───▶│ routing │───▶│ load_balancer │        │
//!                   │  │ server  │    │ (local/ │    │ (local/plugin)│        │
//!                   │  └─────────┘    │ plugin) │    └───────┬───────┘        │
//!                   │                 └─────────┘            ▼                │
//!                   │                               ┌───────────────┐         │
//!  Client Response ◀┼───────────────────────────────│ modifier chain│◀──▶ Backend
//!                   │                               │   + proxier   │         │
//!                   │                               └───────────────┘         │
//!                   │                                                          │
//!                   │  plugin::Supervisor: start, heartbeat, timeout/retry,    │
//!                   │  rebuild of every out-of-process plugin                  │
//!                   └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;

use plugin_gateway::config::{load_config, ConfigWatcher, GatewayConfig};
use plugin_gateway::http::run_listeners;
use plugin_gateway::lifecycle::{forward_signals, Gateway, Shutdown};
use plugin_gateway::observability::{init_logging, init_metrics, MetricSink, NoopSink, PrometheusSink};

#[derive(Parser, Debug)]
#[command(name = "plugin-gateway", version, about = "Extensible HTTP gateway with supervised plugins")]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds plugins get to stop during shutdown.
    #[arg(long, default_value_t = 10)]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    init_logging(&config.observability)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?cli.config,
        "plugin-gateway starting"
    );

    let metrics: Arc<dyn MetricSink> = if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                init_metrics(addr);
                Arc::new(PrometheusSink)
            }
            Err(e) => {
                tracing::error!(
                    metrics_address = %config.observability.metrics_address,
                    error = %e,
                    "Failed to parse metrics address"
                );
                Arc::new(NoopSink)
            }
        }
    } else {
        Arc::new(NoopSink)
    };

    let initial = config.clone();
    let gateway = Gateway::start(config, metrics).await?;

    // Hot reload of the static topology.
    let mut watch = None;
    if let Some(path) = &cli.config {
        let (watcher, updates) = ConfigWatcher::new(path, initial);
        match watcher.run() {
            Ok(handle) => watch = Some((handle, updates)),
            Err(e) => tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled"),
        }
    }
    let (_watcher, mut updates) = match watch {
        Some((handle, updates)) => (Some(handle), Some(updates)),
        None => (None, None),
    };

    let shutdown = Shutdown::new();
    let signals = forward_signals(shutdown.clone());

    let serve = run_listeners(gateway.servers(), shutdown.clone());
    tokio::pin!(serve);
    let served = loop {
        tokio::select! {
            result = &mut serve => break result,
            Some(update) = next_update(&mut updates) => {
                match gateway.reload(&update) {
                    Ok(()) => tracing::info!(upstreams = update.upstreams.len(), "Static topology reloaded"),
                    Err(e) => tracing::error!(error = %e, "Static topology reload partially failed"),
                }
            }
        }
    };

    shutdown.trigger();
    signals.abort();
    if let Err(e) = gateway
        .shutdown(Duration::from_secs(cli.shutdown_timeout))
        .await
    {
        tracing::error!(error = %e, "Plugins did not stop cleanly");
    }

    served?;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn next_update(updates: &mut Option<mpsc::UnboundedReceiver<GatewayConfig>>) -> Option<GatewayConfig> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
