use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::admin::AdminState;
use crate::topology::{Backend, BackendId, HealthCheck, TopologyError, Upstream, UpstreamId};

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub upstreams: usize,
    pub backends: usize,
    pub plugins: Vec<PluginStatus>,
}

#[derive(Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub plugin_type: &'static str,
    pub running: bool,
}

#[derive(Serialize)]
pub struct UpstreamView {
    #[serde(flatten)]
    pub upstream: Upstream,
    pub backends: Vec<Backend>,
}

/// Body of `POST /admin/upstreams/{id}/backends`; an empty id is generated.
#[derive(Deserialize)]
pub struct NewBackend {
    #[serde(default)]
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
}

/// Topology error rendered as `{"error", "message"}`.
pub struct AdminError(TopologyError);

impl From<TopologyError> for AdminError {
    fn from(err: TopologyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            TopologyError::InvalidUpstream(_) => (StatusCode::BAD_REQUEST, "invalid_upstream"),
            TopologyError::InvalidBackendAddress { .. } => (StatusCode::BAD_REQUEST, "invalid_backend_address"),
            TopologyError::UpstreamNotFound(_) => (StatusCode::NOT_FOUND, "upstream_not_found"),
            TopologyError::BackendNotFound(_) => (StatusCode::NOT_FOUND, "backend_not_found"),
            TopologyError::RoutingKeyConflict { .. } => (StatusCode::CONFLICT, "routing_key_conflict"),
            TopologyError::BackendConflict { .. } => (StatusCode::CONFLICT, "backend_conflict"),
            TopologyError::OrphanedBackend { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "orphaned_backend"),
        };
        let body = serde_json::json!({
            "error": code,
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let upstreams = state.manager.upstreams();
    let backends = upstreams
        .iter()
        .map(|u| state.manager.backends(&u.id).map_or(0, |b| b.len()))
        .sum();

    let plugins = join_all(state.plugins.iter().map(|supervisor| async move {
        PluginStatus {
            name: supervisor.name().to_string(),
            plugin_type: supervisor.plugin_type().as_str(),
            running: supervisor.is_running().await,
        }
    }))
    .await;

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started_at.elapsed().as_secs(),
        upstreams: upstreams.len(),
        backends,
        plugins,
    })
}

pub async fn list_upstreams(State(state): State<AdminState>) -> Json<Vec<UpstreamView>> {
    let views = state
        .manager
        .upstreams()
        .into_iter()
        .map(|upstream| {
            let backends = state.manager.backends(&upstream.id).unwrap_or_default();
            UpstreamView { upstream, backends }
        })
        .collect();
    Json(views)
}

pub async fn create_upstream(
    State(state): State<AdminState>,
    Json(upstream): Json<Upstream>,
) -> Result<(StatusCode, Json<Upstream>), AdminError> {
    let stored = state.manager.add_upstream(upstream)?;
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn delete_upstream(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Upstream>, AdminError> {
    let removed = state.manager.remove_upstream(&UpstreamId::from(id))?;
    Ok(Json(removed))
}

pub async fn create_backend(
    State(state): State<AdminState>,
    Path(upstream_id): Path<String>,
    Json(request): Json<NewBackend>,
) -> Result<(StatusCode, Json<Backend>), AdminError> {
    let mut backend = Backend::new(request.id, &request.address).map_err(|e| {
        TopologyError::InvalidBackendAddress {
            address: request.address.clone(),
            reason: e.to_string(),
        }
    })?;
    if let Some(check) = request.health_check {
        backend = backend.with_health_check(check);
    }
    let stored = state
        .manager
        .add_backend(&UpstreamId::from(upstream_id), backend)?;
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn delete_backend(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Backend>, AdminError> {
    let removed = state.manager.remove_backend(&BackendId::from(id))?;
    Ok(Json(removed))
}

#[cfg(test)]
mod tests {
    use crate::admin::{setup_admin_router, AdminState};
    use crate::events::Broadcaster;
    use crate::plugin::PluginSet;
    use crate::topology::{Manager, SequentialIds};
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use axum::Router;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<Manager>) {
        let manager = Arc::new(Manager::new(
            Arc::new(Broadcaster::new()),
            Arc::new(SequentialIds::new("gen")),
        ));
        let state = AdminState::new(manager.clone(), PluginSet::new(), "secret");
        (setup_admin_router(state), manager)
    }

    fn request(method: Method, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, "Bearer secret");
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_requires_bearer_token() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::get("/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_upstream_and_backend_crud() {
        let (app, manager) = app();

        let created = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/admin/upstreams",
                Some(serde_json::json!({"id": "a", "hostnames": ["svc.local"]})),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let backend = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/admin/upstreams/a/backends",
                Some(serde_json::json!({"address": "http://127.0.0.1:9001"})),
            ))
            .await
            .unwrap();
        assert_eq!(backend.status(), StatusCode::CREATED);
        assert_eq!(json(backend).await["id"], "gen-1");

        let listed = app
            .clone()
            .oneshot(request(Method::GET, "/admin/upstreams", None))
            .await
            .unwrap();
        let listed = json(listed).await;
        assert_eq!(listed[0]["id"], "a");
        assert_eq!(listed[0]["backends"][0]["address"], "http://127.0.0.1:9001/");

        let removed = app
            .clone()
            .oneshot(request(Method::DELETE, "/admin/backends/gen-1", None))
            .await
            .unwrap();
        assert_eq!(removed.status(), StatusCode::OK);
        assert!(manager.backends(&"a".into()).unwrap().is_empty());

        let removed = app
            .oneshot(request(Method::DELETE, "/admin/upstreams/a", None))
            .await
            .unwrap();
        assert_eq!(removed.status(), StatusCode::OK);
        assert!(manager.upstreams().is_empty());
    }

    #[tokio::test]
    async fn test_topology_errors_map_to_status() {
        let (app, manager) = app();
        manager
            .add_upstream(crate::topology::Upstream::new("a").with_hostname("svc.local"))
            .unwrap();

        let conflict = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/admin/upstreams",
                Some(serde_json::json!({"id": "b", "hostnames": ["svc.local"]})),
            ))
            .await
            .unwrap();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        assert_eq!(json(conflict).await["error"], "routing_key_conflict");

        let missing = app
            .clone()
            .oneshot(request(Method::DELETE, "/admin/upstreams/zzz", None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let invalid = app
            .oneshot(request(
                Method::POST,
                "/admin/upstreams/a/backends",
                Some(serde_json::json!({"address": "ftp://files.local"})),
            ))
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }
}
