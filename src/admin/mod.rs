//! Internal admin API for topology inspection and mutation.
//!
//! Served on the internal listener; every route requires
//! `Authorization: Bearer <admin.api_key>`.

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use crate::plugin::PluginSet;
use crate::topology::Manager;

use self::auth::admin_auth_middleware;
use self::handlers::*;

/// State shared by admin handlers.
#[derive(Debug, Clone)]
pub struct AdminState {
    pub manager: Arc<Manager>,
    pub plugins: PluginSet,
    pub api_key: Arc<str>,
    pub started_at: Instant,
}

impl AdminState {
    pub fn new(manager: Arc<Manager>, plugins: PluginSet, api_key: &str) -> Self {
        Self {
            manager,
            plugins,
            api_key: Arc::from(api_key),
            started_at: Instant::now(),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/upstreams", get(list_upstreams).post(create_upstream))
        .route("/admin/upstreams/{id}", delete(delete_upstream))
        .route("/admin/upstreams/{id}/backends", post(create_backend))
        .route("/admin/backends/{id}", delete(delete_backend))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
