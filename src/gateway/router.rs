//! HTTP router and health handler

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::warn;

use super::{cores, session};
use crate::auth::AuthContext;
use crate::auth::middleware::{auth_middleware, role_middleware};
use crate::lifecycle::LifecycleManager;

/// Shared application state
pub struct AppState {
    /// Authentication components
    pub auth: Arc<AuthContext>,
    /// Core lifecycle
    pub cores: Arc<LifecycleManager>,
    /// Process start, for uptime reporting
    pub started_at: Instant,
}

impl AppState {
    /// Bundle the shared components.
    pub fn new(auth: Arc<AuthContext>, cores: Arc<LifecycleManager>) -> Self {
        Self {
            auth,
            cores,
            started_at: Instant::now(),
        }
    }
}

/// Create the router.
///
/// Every route sits behind authentication then RBAC; the public paths are let
/// through by the middleware itself. With a non-empty base path the whole API
/// is nested under it.
pub fn create_router(state: Arc<AppState>) -> Router {
    let auth = Arc::clone(&state.auth);
    let base_path = auth.base_path().to_string();

    let api = Router::new()
        .route("/authentication", get(session::begin_auth))
        .route("/redirect-call", get(session::callback))
        .route("/logout", get(session::logout))
        .route("/token", get(session::token))
        .route("/healthz", get(health_handler))
        .route("/core/", post(cores::create_core))
        .route("/core/{id}", get(cores::get_core).delete(cores::delete_core))
        .route("/cores/", get(cores::list_cores))
        // Layers run bottom-up: authentication, then RBAC
        .layer(middleware::from_fn_with_state(Arc::clone(&auth), role_middleware))
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .with_state(state);

    let app = if base_path.is_empty() {
        api
    } else {
        Router::new().nest(&base_path, api)
    };

    app.layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// GET /healthz
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cores = match state.cores.list().await {
        Ok(cores) => Some(cores.len()),
        Err(e) => {
            warn!(error = %e, "Health check could not read the core store");
            None
        }
    };
    let healthy = cores.is_some();

    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "store": {
            "backend": state.cores.backend(),
            "cores": cores,
        },
        "keyset": state.auth.keys.status(),
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
