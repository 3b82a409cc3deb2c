//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_plugin_calls_total` (counter): plugin calls by plugin, method, outcome
//! - `gateway_plugin_call_duration_seconds` (histogram): plugin call latency
//! - `gateway_plugin_retries_total` (counter): calls that needed more than one attempt
//! - `gateway_plugin_restarts_total` (counter): transparent rebuilds after heartbeat failure
//! - `gateway_requests_total` (counter): requests by method, status, upstream
//! - `gateway_request_duration_seconds` (histogram): end-to-end latency
//!
//! # Design Decisions
//! - Components only see the narrow `MetricSink::emit` interface
//! - Metric plugins receive batches drained from a bounded queue; they never
//!   slow the component that emitted the metric, and records are dropped
//!   while the queue is full

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::plugin::{PluginError, Supervisor};

const MAX_PLUGIN_BATCH: usize = 128;

/// Records buffered for metric plugins before new ones are dropped.
const PLUGIN_QUEUE_CAPACITY: usize = 8192;

/// Everything the gateway measures.
#[derive(Debug, Clone, PartialEq)]
pub enum Metric {
    PluginCall {
        plugin: String,
        method: String,
        duration: Duration,
        success: bool,
    },
    PluginRetried {
        plugin: String,
        method: String,
        attempts: u32,
    },
    PluginRestarted {
        plugin: String,
    },
    Request {
        method: String,
        status: u16,
        upstream: String,
        duration: Duration,
    },
}

/// Wire form of a metric, as handed to metric plugins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    pub labels: BTreeMap<String, String>,
}

impl Metric {
    pub fn to_record(&self) -> MetricRecord {
        let (name, value, labels): (&str, f64, Vec<(&str, String)>) = match self {
            Metric::PluginCall {
                plugin,
                method,
                duration,
                success,
            } => (
                "gateway_plugin_call_duration_seconds",
                duration.as_secs_f64(),
                vec![
                    ("plugin", plugin.clone()),
                    ("method", method.clone()),
                    ("success", success.to_string()),
                ],
            ),
            Metric::PluginRetried {
                plugin,
                method,
                attempts,
            } => (
                "gateway_plugin_retries_total",
                f64::from(*attempts),
                vec![("plugin", plugin.clone()), ("method", method.clone())],
            ),
            Metric::PluginRestarted { plugin } => (
                "gateway_plugin_restarts_total",
                1.0,
                vec![("plugin", plugin.clone())],
            ),
            Metric::Request {
                method,
                status,
                upstream,
                duration,
            } => (
                "gateway_request_duration_seconds",
                duration.as_secs_f64(),
                vec![
                    ("method", method.clone()),
                    ("status", status.to_string()),
                    ("upstream", upstream.clone()),
                ],
            ),
        };
        MetricRecord {
            name: name.to_string(),
            value,
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }
}

/// Narrow "emit metric" interface.
pub trait MetricSink: Send + Sync + fmt::Debug {
    fn emit(&self, metric: Metric);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn emit(&self, _metric: Metric) {}
}

/// Records through the `metrics` facade; exported by `init_metrics`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusSink;

impl MetricSink for PrometheusSink {
    fn emit(&self, metric: Metric) {
        match metric {
            Metric::PluginCall {
                plugin,
                method,
                duration,
                success,
            } => {
                let outcome = if success { "ok" } else { "error" };
                metrics::counter!(
                    "gateway_plugin_calls_total",
                    "plugin" => plugin.clone(),
                    "method" => method.clone(),
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!(
                    "gateway_plugin_call_duration_seconds",
                    "plugin" => plugin,
                    "method" => method
                )
                .record(duration.as_secs_f64());
            }
            Metric::PluginRetried { plugin, method, .. } => {
                metrics::counter!(
                    "gateway_plugin_retries_total",
                    "plugin" => plugin,
                    "method" => method
                )
                .increment(1);
            }
            Metric::PluginRestarted { plugin } => {
                metrics::counter!("gateway_plugin_restarts_total", "plugin" => plugin).increment(1);
            }
            Metric::Request {
                method,
                status,
                upstream,
                duration,
            } => {
                metrics::counter!(
                    "gateway_requests_total",
                    "method" => method.clone(),
                    "status" => status.to_string(),
                    "upstream" => upstream.clone()
                )
                .increment(1);
                metrics::histogram!(
                    "gateway_request_duration_seconds",
                    "method" => method,
                    "upstream" => upstream
                )
                .record(duration.as_secs_f64());
            }
        }
    }
}

/// Keeps every metric in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    metrics: Mutex<Vec<Metric>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Metric> {
        self.metrics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl MetricSink for RecordingSink {
    fn emit(&self, metric: Metric) {
        self.metrics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(metric);
    }
}

/// Emits to every inner sink.
#[derive(Debug, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MetricSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn MetricSink>>) -> Self {
        Self { sinks }
    }
}

impl MetricSink for FanoutSink {
    fn emit(&self, metric: Metric) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(metric.clone());
            }
            last.emit(metric);
        }
    }
}

/// Forwards metrics to metric plugins in batches.
///
/// The supervisors handed in here must not themselves emit into this sink.
#[derive(Debug, Clone)]
pub struct PluginSink {
    queue: mpsc::Sender<MetricRecord>,
    dropped: Arc<AtomicU64>,
}

impl PluginSink {
    /// Start the forwarding task; it ends once every sink clone is dropped.
    pub fn spawn(supervisors: Vec<Supervisor>) -> (Self, JoinHandle<()>) {
        Self::spawn_with_capacity(supervisors, PLUGIN_QUEUE_CAPACITY)
    }

    pub fn spawn_with_capacity(supervisors: Vec<Supervisor>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (queue, mut rx) = mpsc::channel::<MetricRecord>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut batch = vec![first];
                while batch.len() < MAX_PLUGIN_BATCH {
                    match rx.try_recv() {
                        Ok(record) => batch.push(record),
                        Err(_) => break,
                    }
                }
                for supervisor in &supervisors {
                    if let Err(e) = write_batch(supervisor, batch.clone()).await {
                        tracing::warn!(plugin = %supervisor.name(), error = %e, "Metric batch rejected");
                    }
                }
            }
        });
        let sink = Self {
            queue,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, handle)
    }

    /// Records discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MetricSink for PluginSink {
    fn emit(&self, metric: Metric) {
        match self.queue.try_send(metric.to_record()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::debug!(metric = %record.name, dropped, "Metric plugin queue full, dropping records");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

async fn write_batch(supervisor: &Supervisor, batch: Vec<MetricRecord>) -> Result<(), PluginError> {
    let name = supervisor.name().to_string();
    let results = supervisor
        .call("WriteMetrics", move |plugin| {
            let batch = batch.clone();
            let name = name.clone();
            async move {
                plugin
                    .as_metric()
                    .ok_or_else(|| PluginError::internal(&name, crate::plugin::PluginType::Metric))?
                    .write_metrics(batch)
                    .await
            }
        })
        .await?;
    let failed = results.iter().filter(|r| r.is_some()).count();
    if failed > 0 {
        tracing::debug!(plugin = %supervisor.name(), failed, "Metric plugin rejected records");
    }
    Ok(())
}

/// Install the Prometheus exporter, serving `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}
