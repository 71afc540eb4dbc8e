//! HTTP endpoints of a managed service.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Router};
use tower_http::trace::TraceLayer;

use super::health::{HealthFlag, VersionCell};

/// Shared state of the HTTP endpoints.
#[derive(Clone, Default)]
pub struct ServiceState {
    pub health: HealthFlag,
    pub version: VersionCell,
}

impl ServiceState {
    pub fn new(version: Option<String>) -> Self {
        Self {
            health: HealthFlag::default(),
            version: VersionCell::new(version),
        }
    }
}

pub fn create_router(state: ServiceState) -> Router {
    Router::new()
        .route("/", axum::routing::get(root))
        // Polled by the backend's HTTP check
        .route("/_status", axum::routing::get(status))
        .route("/_version", axum::routing::get(version))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    "Hello, world!"
}

/// 200 while the local health flag is set, 503 once the node is draining.
async fn status(State(state): State<ServiceState>) -> impl IntoResponse {
    if state.health.is_healthy() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    }
}

async fn version(State(state): State<ServiceState>) -> impl IntoResponse {
    match state.version.get() {
        Some(version) => (StatusCode::OK, version),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}
