//! Plugin process transport: newline-delimited JSON over the child's stdio.
//!
//! # Protocol
//! ```text
//! child  → host   {"handshake": "gateway-router-v1"}        (first line)
//! host   → child  {"id": 7, "method": "RouteRequest", "params": {...}}
//! child  → host   {"id": 7, "result": {...}}  |  {"id": 7, "error": "..."}
//! child  → host   {"method": "AddUpstream", "params": {...}} (discovery push)
//! ```
//!
//! # Design Decisions
//! - Concurrent calls are multiplexed by id; one reader task resolves them
//! - When stdout closes every pending call fails with `ProcessExited`
//! - stderr is forwarded line by line into tracing
//! - Children are killed when the handle is dropped

use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::GatewayError;
use crate::http::{RequestSnapshot, ResponseSnapshot};
use crate::observability::MetricRecord;
use crate::plugin::discovery::TopologyCommand;
use crate::plugin::{
    LoadBalancerPlugin, MetricPlugin, ModifierPlugin, Plugin, PluginDescriptor, PluginError,
    PluginLauncher, PluginOptions, PluginType, RouteResult, RouterPlugin,
};
use crate::topology::{Backend, BackendId, Upstream, UpstreamId};

/// Environment variable carrying the expected handshake value.
pub const HANDSHAKE_ENV: &str = "GATEWAY_PLUGIN_HANDSHAKE";

type Pending = Arc<DashMap<u64, oneshot::Sender<Result<Value, PluginError>>>>;

/// Launches plugins as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    discovery: Option<mpsc::Sender<TopologyCommand>>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that receives topology commands pushed by discovery plugins.
    pub fn with_discovery(mut self, commands: mpsc::Sender<TopologyCommand>) -> Self {
        self.discovery = Some(commands);
        self
    }
}

#[async_trait]
impl PluginLauncher for ProcessLauncher {
    async fn launch(&self, descriptor: &PluginDescriptor) -> Result<Arc<dyn Plugin>, PluginError> {
        let plugin = ProcessPlugin::spawn(descriptor, self.discovery.clone()).await?;
        Ok(Arc::new(plugin))
    }
}

#[derive(Serialize)]
struct Outbound<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct Inbound {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Value,
    error: Option<String>,
}

#[derive(Deserialize)]
struct Hello {
    handshake: String,
}

/// A running plugin process.
pub struct ProcessPlugin {
    name: String,
    plugin_type: PluginType,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    exited: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for ProcessPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessPlugin")
            .field("name", &self.name)
            .field("plugin_type", &self.plugin_type)
            .field("pending", &self.pending.len())
            .field("exited", &self.exited.load(Ordering::SeqCst))
            .finish()
    }
}

impl ProcessPlugin {
    /// Spawn the command and complete the handshake.
    pub async fn spawn(
        descriptor: &PluginDescriptor,
        discovery: Option<mpsc::Sender<TopologyCommand>>,
    ) -> Result<Self, PluginError> {
        let mut parts = descriptor.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| PluginError::Spawn("empty command".to_string()))?;
        let expected = descriptor.plugin_type.handshake_value();

        let mut child = Command::new(program)
            .args(parts)
            .env(HANDSHAKE_ENV, expected)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PluginError::Spawn(format!("{}: {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::Spawn("stdin is not available".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Spawn("stdout is not available".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let first = tokio::time::timeout(descriptor.call_timeout, lines.next_line())
            .await
            .map_err(|_| PluginError::Handshake("no handshake before the call timeout".to_string()))??
            .ok_or_else(|| PluginError::Handshake("stdout closed before handshake".to_string()))?;
        let hello: Hello = serde_json::from_str(first.trim())
            .map_err(|e| PluginError::Handshake(format!("invalid handshake line: {}", e)))?;
        if hello.handshake != expected {
            return Err(PluginError::Handshake(format!(
                "expected '{}', got '{}'",
                expected, hello.handshake
            )));
        }

        let pending: Pending = Arc::new(DashMap::new());
        let exited = Arc::new(AtomicBool::new(false));
        let mut tasks = vec![tokio::spawn(read_loop(
            descriptor.name.clone(),
            lines,
            pending.clone(),
            discovery,
            exited.clone(),
        ))];
        if let Some(stderr) = child.stderr.take() {
            let name = descriptor.name.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(plugin = %name, line = %line, "Plugin stderr");
                }
            }));
        }

        tracing::debug!(
            plugin = %descriptor.name,
            pid = ?child.id(),
            command = %descriptor.command,
            "Plugin process spawned"
        );

        Ok(Self {
            name: descriptor.name.clone(),
            plugin_type: descriptor.plugin_type,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            exited,
            tasks,
        })
    }

    async fn request<P, R>(&self, method: &str, params: P) -> Result<R, PluginError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let params = serde_json::to_value(params).map_err(|e| PluginError::Protocol(e.to_string()))?;
        let mut line = serde_json::to_string(&Outbound { id, method, params })
            .map_err(|e| PluginError::Protocol(e.to_string()))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if self.exited.load(Ordering::SeqCst) {
            self.pending.remove(&id);
            return Err(PluginError::ProcessExited);
        }

        let written = async {
            let mut stdin = self.stdin.lock().await;
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            self.pending.remove(&id);
            return Err(e.into());
        }

        let value = rx.await.map_err(|_| PluginError::ProcessExited)??;
        serde_json::from_value(value)
            .map_err(|e| PluginError::Protocol(format!("invalid '{}' result: {}", method, e)))
    }
}

impl Drop for ProcessPlugin {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn read_loop(
    name: String,
    mut lines: Lines<BufReader<ChildStdout>>,
    pending: Pending,
    discovery: Option<mpsc::Sender<TopologyCommand>>,
    exited: Arc<AtomicBool>,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => handle_line(&name, &line, &pending, discovery.as_ref()).await,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "Failed to read plugin stdout");
                break;
            }
        }
    }

    exited.store(true, Ordering::SeqCst);
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(PluginError::ProcessExited));
        }
    }
    tracing::info!(plugin = %name, "Plugin process exited");
}

async fn handle_line(
    name: &str,
    line: &str,
    pending: &Pending,
    discovery: Option<&mpsc::Sender<TopologyCommand>>,
) {
    let message: Inbound = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(plugin = %name, error = %e, "Ignoring malformed plugin output");
            return;
        }
    };

    if let Some(id) = message.id {
        match pending.remove(&id) {
            Some((_, tx)) => {
                let result = match message.error {
                    Some(error) => Err(PluginError::Remote(error)),
                    None => Ok(message.result),
                };
                let _ = tx.send(result);
            }
            None => tracing::debug!(plugin = %name, id, "Response for unknown call"),
        }
        return;
    }

    let Some(method) = message.method else {
        tracing::warn!(plugin = %name, "Plugin message has neither id nor method");
        return;
    };
    let Some(discovery) = discovery else {
        tracing::warn!(plugin = %name, method = %method, "Unexpected notification from plugin");
        return;
    };
    let envelope = serde_json::json!({ "method": method, "params": message.params });
    match serde_json::from_value::<TopologyCommand>(envelope) {
        Ok(command) => {
            if discovery.send(command).await.is_err() {
                tracing::warn!(plugin = %name, "Discovery queue closed, dropping command");
            }
        }
        Err(e) => tracing::warn!(plugin = %name, method = %method, error = %e, "Invalid discovery command"),
    }
}

#[async_trait]
impl Plugin for ProcessPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn plugin_type(&self) -> PluginType {
        self.plugin_type
    }

    async fn configure(&self, options: &PluginOptions) -> Result<(), PluginError> {
        self.request("Configure", options).await
    }

    async fn start(&self) -> Result<(), PluginError> {
        self.request("Start", Value::Null).await
    }

    async fn stop(&self) -> Result<(), PluginError> {
        self.request("Stop", Value::Null).await
    }

    async fn heartbeat(&self) -> Result<(), PluginError> {
        self.request("Heartbeat", Value::Null).await
    }

    async fn kill(&self) -> Result<(), PluginError> {
        let mut child = self.child.lock().await;
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        child.kill().await?;
        Ok(())
    }

    fn as_router(&self) -> Option<&dyn RouterPlugin> {
        (self.plugin_type == PluginType::Router).then_some(self as &dyn RouterPlugin)
    }

    fn as_load_balancer(&self) -> Option<&dyn LoadBalancerPlugin> {
        (self.plugin_type == PluginType::LoadBalancer).then_some(self as &dyn LoadBalancerPlugin)
    }

    fn as_modifier(&self) -> Option<&dyn ModifierPlugin> {
        (self.plugin_type == PluginType::Modifier).then_some(self as &dyn ModifierPlugin)
    }

    fn as_metric(&self) -> Option<&dyn MetricPlugin> {
        (self.plugin_type == PluginType::Metric).then_some(self as &dyn MetricPlugin)
    }
}

#[async_trait]
impl RouterPlugin for ProcessPlugin {
    async fn add_upstream(&self, upstream: Upstream) -> Result<(), PluginError> {
        self.request("AddUpstream", upstream).await
    }

    async fn remove_upstream(&self, id: UpstreamId) -> Result<(), PluginError> {
        self.request("RemoveUpstream", id).await
    }

    async fn route_request(&self, request: RequestSnapshot) -> Result<RouteResult, PluginError> {
        self.request("RouteRequest", request).await
    }
}

#[async_trait]
impl LoadBalancerPlugin for ProcessPlugin {
    async fn add_backend(&self, upstream_id: UpstreamId, backend: Backend) -> Result<(), PluginError> {
        self.request(
            "AddBackend",
            serde_json::json!({ "upstream_id": upstream_id, "backend": backend }),
        )
        .await
    }

    async fn remove_backend(&self, backend_id: BackendId) -> Result<(), PluginError> {
        self.request("RemoveBackend", backend_id).await
    }

    async fn get_backend(&self, upstream_id: UpstreamId) -> Result<Option<Backend>, PluginError> {
        self.request("GetBackend", upstream_id).await
    }
}

#[async_trait]
impl ModifierPlugin for ProcessPlugin {
    async fn modify_request(&self, request: RequestSnapshot) -> Result<RequestSnapshot, PluginError> {
        self.request("ModifyRequest", request).await
    }

    async fn modify_response(
        &self,
        request: RequestSnapshot,
        response: ResponseSnapshot,
    ) -> Result<ResponseSnapshot, PluginError> {
        self.request(
            "ModifyResponse",
            serde_json::json!({ "request": request, "response": response }),
        )
        .await
    }

    async fn modify_error_response(
        &self,
        error: GatewayError,
        request: RequestSnapshot,
        response: ResponseSnapshot,
    ) -> Result<ResponseSnapshot, PluginError> {
        self.request(
            "ModifyErrorResponse",
            serde_json::json!({ "error": error, "request": request, "response": response }),
        )
        .await
    }
}

#[async_trait]
impl MetricPlugin for ProcessPlugin {
    async fn write_metrics(&self, records: Vec<MetricRecord>) -> Result<Vec<Option<String>>, PluginError> {
        self.request("WriteMetrics", records).await
    }
}
