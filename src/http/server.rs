//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router for the gateway pipeline
//! - Wire up middleware (tracing, request ID)
//! - Bind the public and internal listeners
//! - Dispatch requests: route → balance → modify → proxy

use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, Response},
    routing::any,
    Router,
};
use futures_util::future::join_all;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::error::{ErrorCollector, MultiError};
use crate::http::proxier::Proxier;
use crate::http::request::RequestSnapshot;
use crate::lifecycle::Shutdown;
use crate::load_balancer::LoadBalancer;
use crate::routing::Router as GatewayRouter;

/// Application state injected into the gateway handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub router: Arc<dyn GatewayRouter>,
    pub load_balancer: Arc<dyn LoadBalancer>,
    pub proxier: Proxier,
}

/// Listener failures, collected across every listener.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("{listener} listener failed to bind {address}: {source}")]
    Bind {
        listener: &'static str,
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("{listener} listener failed: {source}")]
    Serve {
        listener: &'static str,
        #[source]
        source: io::Error,
    },
}

/// One HTTP listener and the app it serves.
pub struct HttpServer {
    name: &'static str,
    router: Router,
}

impl HttpServer {
    /// Public listener running the gateway pipeline.
    pub fn public(state: AppState) -> Self {
        Self {
            name: "public",
            router: gateway_router(state),
        }
    }

    /// Internal listener serving `router` (the admin API).
    pub fn internal(router: Router) -> Self {
        Self {
            name: "internal",
            router: router.layer(TraceLayer::new_for_http()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(listener = self.name, address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown.signaled())
            .await?;

        tracing::info!(listener = self.name, "HTTP server stopped");
        Ok(())
    }
}

/// Gateway pipeline with tracing and request-id middleware.
pub fn gateway_router(state: AppState) -> Router {
    Router::new()
        .route("/{*path}", any(gateway_handler))
        .route("/", any(gateway_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Bind every listener, then serve them concurrently.
///
/// Bind failures are reported together before anything serves; once
/// serving, a failing listener triggers `shutdown` so the others drain too.
pub async fn run_listeners(
    servers: Vec<(HttpServer, String)>,
    shutdown: Shutdown,
) -> Result<(), MultiError<ServeError>> {
    let errors = ErrorCollector::new();
    let mut bound = Vec::with_capacity(servers.len());
    for (server, address) in servers {
        match TcpListener::bind(&address).await {
            Ok(listener) => bound.push((server, listener)),
            Err(source) => errors.push(ServeError::Bind {
                listener: server.name(),
                address,
                source,
            }),
        }
    }
    let errors = match errors.into_result() {
        Ok(()) => ErrorCollector::new(),
        Err(e) => return Err(e),
    };

    let runs = bound.into_iter().map(|(server, listener)| {
        let shutdown = shutdown.clone();
        let errors = &errors;
        async move {
            let name = server.name();
            if let Err(source) = server.run(listener, shutdown.clone()).await {
                tracing::error!(listener = name, error = %source, "Listener failed");
                errors.push(ServeError::Serve { listener: name, source });
                shutdown.trigger();
            }
        }
    });
    join_all(runs).await;
    errors.into_result()
}

/// Main gateway handler.
/// Routes the request, picks a backend, modifies and proxies it.
async fn gateway_handler(State(state): State<AppState>, request: Request<Body>) -> Response<Body> {
    let (parts, body) = request.into_parts();
    let snapshot = RequestSnapshot::from_parts(&parts);

    tracing::debug!(
        request_id = %snapshot.request_id,
        method = %snapshot.method,
        host = %snapshot.host,
        path = %snapshot.path,
        "Proxying request"
    );

    // 1. Route
    let (upstream, routed) = match state.router.route_request(snapshot.clone()).await {
        Ok(routed) => routed,
        Err(err) => {
            tracing::debug!(request_id = %snapshot.request_id, error = %err, "No route matched");
            return state.proxier.reject(err, &snapshot).await;
        }
    };

    // 2. Balance
    let backend = match state.load_balancer.get_backend(&upstream.id).await {
        Ok(backend) => backend,
        Err(err) => {
            tracing::warn!(request_id = %routed.request_id, upstream_id = %upstream.id, error = %err, "No backend available");
            return state.proxier.reject(err, &routed).await;
        }
    };

    // 3. Modify
    let modified = match state.proxier.modifier().modify_request(routed.clone()).await {
        Ok(modified) => modified,
        Err(err) => {
            tracing::warn!(request_id = %routed.request_id, error = %err, "Request modification failed");
            return state.proxier.reject(err, &routed).await;
        }
    };

    // 4. Proxy
    state.proxier.proxy(&upstream, &backend, modified, body).await
}
