//! Delivery of one request to a chosen backend.
//!
//! # Data Flow
//! ```text
//! Routed → Dispatched → (Succeeded | Failed) → Modified → Written
//!
//! (upstream, backend, snapshot, body)
//!     → effective timeout: upstream.timeout_ms, else proxy.default_timeout_ms
//!     → outbound URI: backend address + outbound path + query
//!     → client call under tokio::time::timeout
//!         - response → Modifier::modify_response
//!             └─ failure → Modifier::modify_error_response (once)
//!         - elapsed → ProxyTimeout → Modifier::modify_error_response
//!         - transport error → BackendUnavailable → Modifier::modify_error_response
//!     → ResponseSnapshot::into_response (override body or streamed body)
//! ```
//!
//! The deadline only bounds the backend call; modifier calls carry their
//! own plugin timeouts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Method, Request, Response, Uri};
use futures_util::StreamExt;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::error::GatewayError;
use crate::http::request::{multimap_to_headers, RequestSnapshot};
use crate::http::response::ResponseSnapshot;
use crate::modifier::Modifier;
use crate::observability::{Metric, MetricSink};
use crate::topology::{Backend, Upstream};

#[derive(Debug, Clone)]
pub struct Proxier {
    client: Client<HttpConnector, Body>,
    modifier: Arc<dyn Modifier>,
    default_timeout: Duration,
    metrics: Arc<dyn MetricSink>,
}

impl Proxier {
    pub fn new(modifier: Arc<dyn Modifier>, default_timeout: Duration, metrics: Arc<dyn MetricSink>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            client,
            modifier,
            default_timeout,
            metrics,
        }
    }

    pub fn modifier(&self) -> &Arc<dyn Modifier> {
        &self.modifier
    }

    /// Deadline for a call to `upstream`.
    pub fn effective_timeout(&self, upstream: &Upstream) -> Duration {
        upstream.timeout().unwrap_or(self.default_timeout)
    }

    /// Execute `request` against `backend` and produce the client response.
    pub async fn proxy(
        &self,
        upstream: &Upstream,
        backend: &Backend,
        request: RequestSnapshot,
        body: Body,
    ) -> Response<Body> {
        let start = Instant::now();
        let timeout = self.effective_timeout(upstream);

        let outbound = match build_outbound(backend, &request, body) {
            Ok(outbound) => outbound,
            Err(err) => return self.finish_error(err, &request, upstream.id.as_str(), start).await,
        };

        tracing::debug!(
            request_id = %request.request_id,
            upstream_id = %upstream.id,
            backend_id = %backend.id,
            uri = %outbound.uri(),
            "Dispatching request"
        );

        let result = tokio::time::timeout(timeout, self.client.request(outbound)).await;
        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    backend_id = %backend.id,
                    error = %e,
                    "Backend request failed"
                );
                let err = GatewayError::BackendUnavailable { reason: e.to_string() };
                return self.finish_error(err, &request, upstream.id.as_str(), start).await;
            }
            Err(_) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    backend_id = %backend.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Backend request timed out"
                );
                let err = GatewayError::ProxyTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                };
                return self.finish_error(err, &request, upstream.id.as_str(), start).await;
            }
        };

        let (parts, incoming) = response.into_parts();
        let snapshot = ResponseSnapshot::from_parts(&parts);
        let modified = match self.modifier.modify_response(&request, snapshot).await {
            Ok(modified) => modified,
            Err(failure) => {
                let mut best = failure.response;
                best.error = Some(failure.error.clone());
                self.modifier
                    .modify_error_response(failure.error, &request, best)
                    .await
            }
        };

        let upstream_body = Body::new(incoming);
        let upstream_body = if modified.body.is_some() {
            tokio::spawn(drain(upstream_body, timeout));
            None
        } else {
            Some(upstream_body)
        };

        self.record(&request, modified.status, upstream.id.as_str(), start);
        modified.into_response(upstream_body)
    }

    /// Error response for a request that never reached a backend.
    pub async fn reject(&self, err: GatewayError, request: &RequestSnapshot) -> Response<Body> {
        self.finish_error(err, request, "none", Instant::now()).await
    }

    async fn finish_error(
        &self,
        err: GatewayError,
        request: &RequestSnapshot,
        upstream: &str,
        start: Instant,
    ) -> Response<Body> {
        let placeholder = ResponseSnapshot::for_error(&err);
        let response = self
            .modifier
            .modify_error_response(err, request, placeholder)
            .await;
        self.record(request, response.status, upstream, start);
        response.into_response(None)
    }

    fn record(&self, request: &RequestSnapshot, status: u16, upstream: &str, start: Instant) {
        self.metrics.emit(Metric::Request {
            method: request.method.clone(),
            status,
            upstream: upstream.to_string(),
            duration: start.elapsed(),
        });
    }
}

/// Outbound URI: the backend's scheme and authority, any base path it
/// carries, then the request's outbound path and query.
pub fn outbound_uri(backend: &Backend, request: &RequestSnapshot) -> Result<Uri, GatewayError> {
    let base = backend.address.as_str().trim_end_matches('/');
    let mut uri = format!("{}{}", base, request.outbound_path());
    if let Some(query) = &request.query {
        uri.push('?');
        uri.push_str(query);
    }
    uri.parse::<Uri>()
        .map_err(|e| GatewayError::InvalidBackendAddress {
            address: backend.address.to_string(),
            reason: e.to_string(),
        })
}

fn build_outbound(backend: &Backend, request: &RequestSnapshot, body: Body) -> Result<Request<Body>, GatewayError> {
    let uri = outbound_uri(backend, request)?;
    let method = Method::from_bytes(request.method.as_bytes()).map_err(|e| GatewayError::BackendUnavailable {
        reason: format!("invalid method '{}': {}", request.method, e),
    })?;

    let mut outbound = Request::new(body);
    *outbound.method_mut() = method;
    *outbound.uri_mut() = uri;
    *outbound.headers_mut() = multimap_to_headers(&request.headers);
    Ok(outbound)
}

/// Discard the replaced upstream body frame by frame so its connection can
/// be reused. Bodies still streaming after `limit` are dropped.
async fn drain(body: Body, limit: Duration) {
    let mut frames = body.into_data_stream();
    let discard = async {
        let mut discarded = 0usize;
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(chunk) => discarded += chunk.len(),
                Err(e) => {
                    tracing::debug!(error = %e, "Discarding replaced upstream body failed");
                    break;
                }
            }
        }
        discarded
    };
    match tokio::time::timeout(limit, discard).await {
        Ok(discarded) => tracing::trace!(bytes = discarded, "Replaced upstream body drained"),
        Err(_) => tracing::debug!(
            limit_ms = limit.as_millis() as u64,
            "Replaced upstream body still streaming, dropping it"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modifier::{ModifyFailure, NoopModifier};
    use crate::observability::RecordingSink;
    use async_trait::async_trait;
    use axum::body::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn proxier(metrics: Arc<RecordingSink>) -> Proxier {
        Proxier::new(Arc::new(NoopModifier), Duration::from_secs(30), metrics)
    }

    /// Backend on an ephemeral port answering every request with `body`.
    async fn backend(body: &'static str) -> Backend {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = axum::Router::new().fallback(move || async move { body });
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Backend::new("b1", &format!("http://127.0.0.1:{}", port)).unwrap()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Tags the response, then refuses it.
    #[derive(Debug, Default)]
    struct RefuseResponse {
        error_calls: AtomicUsize,
    }

    #[async_trait]
    impl Modifier for RefuseResponse {
        async fn modify_request(&self, request: RequestSnapshot) -> Result<RequestSnapshot, GatewayError> {
            Ok(request)
        }

        async fn modify_response(
            &self,
            _request: &RequestSnapshot,
            mut response: ResponseSnapshot,
        ) -> Result<ResponseSnapshot, ModifyFailure> {
            response.set_header("x-stage", "seen");
            Err(ModifyFailure {
                error: GatewayError::Plugin {
                    reason: "stage refused".into(),
                },
                response,
            })
        }

        async fn modify_error_response(
            &self,
            error: GatewayError,
            _request: &RequestSnapshot,
            mut response: ResponseSnapshot,
        ) -> ResponseSnapshot {
            self.error_calls.fetch_add(1, Ordering::SeqCst);
            response.set_header("x-error-stage", error.code());
            response
        }
    }

    /// Replaces every response body.
    #[derive(Debug)]
    struct ReplaceBody;

    #[async_trait]
    impl Modifier for ReplaceBody {
        async fn modify_request(&self, request: RequestSnapshot) -> Result<RequestSnapshot, GatewayError> {
            Ok(request)
        }

        async fn modify_response(
            &self,
            _request: &RequestSnapshot,
            response: ResponseSnapshot,
        ) -> Result<ResponseSnapshot, ModifyFailure> {
            Ok(response.with_body("replaced"))
        }

        async fn modify_error_response(
            &self,
            _error: GatewayError,
            _request: &RequestSnapshot,
            response: ResponseSnapshot,
        ) -> ResponseSnapshot {
            response
        }
    }

    #[test]
    fn test_outbound_uri_keeps_raw_path_for_host_match() {
        let backend = Backend::new("b1", "http://127.0.0.1:9001").unwrap();
        let mut request = RequestSnapshot::new("GET", "svc.local", "/api/users?page=2");
        request.match_kind = Some(crate::routing::MatchKind::Hostname);
        let uri = outbound_uri(&backend, &request).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9001/api/users?page=2");
    }

    #[test]
    fn test_outbound_uri_strips_prefix_after_prefix_match() {
        let backend = Backend::new("b1", "http://127.0.0.1:9001/base/").unwrap();
        let mut request = RequestSnapshot::new("GET", "svc.local", "/api/users");
        request.match_kind = Some(crate::routing::MatchKind::Prefix);
        let uri = outbound_uri(&backend, &request).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9001/base/users");
    }

    #[test]
    fn test_effective_timeout() {
        let proxier = proxier(Arc::new(RecordingSink::new()));
        assert_eq!(proxier.effective_timeout(&Upstream::new("a")), Duration::from_secs(30));
        let upstream = Upstream::new("a").with_timeout(Duration::from_millis(250));
        assert_eq!(proxier.effective_timeout(&upstream), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let metrics = Arc::new(RecordingSink::new());
        let proxier = proxier(metrics.clone());
        let backend = Backend::new("b1", &format!("http://127.0.0.1:{}", port)).unwrap();
        let response = proxier
            .proxy(
                &Upstream::new("a"),
                &backend,
                RequestSnapshot::new("GET", "svc.local", "/"),
                Body::empty(),
            )
            .await;

        assert_eq!(response.status(), 502);
        assert_eq!(response.headers()["x-gateway-error"], "backend_unavailable");
        assert!(matches!(
            metrics.snapshot().as_slice(),
            [Metric::Request { status: 502, .. }]
        ));
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let proxier = proxier(Arc::new(RecordingSink::new()));
        let backend = Backend::new("b1", &format!("http://127.0.0.1:{}", port)).unwrap();
        let upstream = Upstream::new("a").with_timeout(Duration::from_millis(100));
        let response = proxier
            .proxy(
                &upstream,
                &backend,
                RequestSnapshot::new("GET", "svc.local", "/"),
                Body::empty(),
            )
            .await;

        assert_eq!(response.status(), 504);
        assert_eq!(response.headers()["x-gateway-error"], "proxy_timeout");
        hold.abort();
    }

    #[tokio::test]
    async fn test_reject_renders_error_body() {
        let proxier = proxier(Arc::new(RecordingSink::new()));
        let request = RequestSnapshot::new("GET", "nowhere.local", "/");
        let response = proxier
            .reject(
                GatewayError::RouteNotFound {
                    host: request.host.clone(),
                    path: request.path.clone(),
                },
                &request,
            )
            .await;
        assert_eq!(response.status(), 404);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "route_not_found");
    }

    #[tokio::test]
    async fn test_failed_response_modification_takes_error_path_once() {
        let backend = backend("upstream body").await;
        let modifier = Arc::new(RefuseResponse::default());
        let proxier = Proxier::new(modifier.clone(), Duration::from_secs(5), Arc::new(RecordingSink::new()));

        let response = proxier
            .proxy(
                &Upstream::new("a"),
                &backend,
                RequestSnapshot::new("GET", "svc.local", "/"),
                Body::empty(),
            )
            .await;

        assert_eq!(modifier.error_calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.headers()["x-gateway-error"], "plugin_error");
        // The error path starts from the best response, not a placeholder.
        assert_eq!(response.headers()["x-stage"], "seen");
        assert_eq!(response.headers()["x-error-stage"], "plugin_error");
        assert_eq!(response.status(), 200);
        assert_eq!(body_string(response).await, "upstream body");
    }

    #[tokio::test]
    async fn test_override_body_replaces_upstream_body() {
        let backend = backend("upstream body").await;
        let proxier = Proxier::new(Arc::new(ReplaceBody), Duration::from_secs(5), Arc::new(RecordingSink::new()));

        let response = proxier
            .proxy(
                &Upstream::new("a"),
                &backend,
                RequestSnapshot::new("GET", "svc.local", "/"),
                Body::empty(),
            )
            .await;

        assert_eq!(response.status(), 200);
        assert!(response.headers().get("x-gateway-error").is_none());
        assert_eq!(body_string(response).await, "replaced");
    }

    #[tokio::test]
    async fn test_drain_gives_up_on_endless_body() {
        let endless = Body::from_stream(futures_util::stream::pending::<Result<Bytes, std::io::Error>>());
        let drained = tokio::time::timeout(Duration::from_secs(2), drain(endless, Duration::from_millis(50))).await;
        assert!(drained.is_ok(), "drain outlived its limit");
    }

    #[tokio::test]
    async fn test_drain_reads_finite_body() {
        let chunks = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
        ]);
        let drained = tokio::time::timeout(
            Duration::from_secs(2),
            drain(Body::from_stream(chunks), Duration::from_secs(1)),
        )
        .await;
        assert!(drained.is_ok());
    }
}
