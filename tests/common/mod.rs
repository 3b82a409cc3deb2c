//! Shared utilities for integration testing.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, http::Request, Json};
use plugin_gateway::config::{GatewayConfig, UpstreamConfig};
use plugin_gateway::http::run_listeners;
use plugin_gateway::lifecycle::{Gateway, Shutdown};
use plugin_gateway::observability::NoopSink;
use plugin_gateway::topology::Manager;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

pub const API_KEY: &str = "test-key";

/// Start a simple mock backend that returns a fixed response.
#[allow(dead_code)]
pub async fn start_mock_backend(addr: SocketAddr, response: &'static str) {
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let response_str = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            response.len(),
                            response
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    });
                }
                Err(_) => break,
            }
        }
    });
}

/// Start a backend that answers with a JSON description of what it received.
#[allow(dead_code)]
pub async fn start_echo_backend(addr: SocketAddr) {
    let listener = TcpListener::bind(addr).await.unwrap();
    let app = axum::Router::new().fallback(echo);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
}

async fn echo(request: Request<Body>) -> Json<serde_json::Value> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    let headers: BTreeMap<String, String> = parts
        .headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    Json(serde_json::json!({
        "method": parts.method.as_str(),
        "path": parts.uri.path(),
        "query": parts.uri.query(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    }))
}

/// A gateway serving on fixed loopback ports.
#[allow(dead_code)]
pub struct TestGateway {
    pub public: SocketAddr,
    pub internal: SocketAddr,
    pub manager: Arc<Manager>,
    pub shutdown: Shutdown,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Assemble a local-mode gateway from `upstreams` and serve both listeners.
pub async fn spawn_gateway(public: SocketAddr, internal: SocketAddr, upstreams: Vec<UpstreamConfig>) -> TestGateway {
    let mut config = GatewayConfig::default();
    config.listeners.public.bind_address = public.to_string();
    config.listeners.internal.bind_address = internal.to_string();
    config.admin.enabled = true;
    config.admin.api_key = API_KEY.to_string();
    config.observability.metrics_enabled = false;
    config.upstreams = upstreams;

    let gateway = Gateway::start(config, Arc::new(NoopSink)).await.unwrap();
    let manager = gateway.manager().clone();
    let shutdown = Shutdown::new();

    let servers = gateway.servers();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = run_listeners(servers, server_shutdown).await;
        let _ = gateway.shutdown(Duration::from_secs(1)).await;
    });

    wait_for_listener(public).await;
    wait_for_listener(internal).await;
    TestGateway {
        public,
        internal,
        manager,
        shutdown,
    }
}

pub async fn wait_for_listener(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("listener {} never came up", addr);
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Upstream config with one backend per address.
pub fn upstream(id: &str, hostnames: &[&str], prefixes: &[&str], backends: &[SocketAddr]) -> UpstreamConfig {
    UpstreamConfig {
        id: id.to_string(),
        name: String::new(),
        protocols: Default::default(),
        hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
        prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
        timeout_ms: 0,
        backends: backends
            .iter()
            .enumerate()
            .map(|(i, addr)| plugin_gateway::config::BackendConfig {
                id: format!("{}-b{}", id, i + 1),
                address: format!("http://{}", addr),
                health_check: None,
            })
            .collect(),
    }
}

/// GET `url` with `host` until the gateway stops answering with a
/// routing or balancing error; topology reaches the router asynchronously.
#[allow(dead_code)]
pub async fn get_when_routed(client: &reqwest::Client, url: &str, host: &str) -> reqwest::Response {
    for _ in 0..50 {
        let response = client.get(url).header("host", host).send().await.unwrap();
        let pending = matches!(
            response
                .headers()
                .get("x-gateway-error")
                .and_then(|v| v.to_str().ok()),
            Some("route_not_found") | Some("backend_not_found")
        );
        if !pending {
            return response;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never became routable for host {}", url, host);
}
