//! Health check endpoints.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Basic health check, also probed by peers when voting
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    store: bool,
    node_id: String,
}

/// Readiness check (is the coordination store reachable?)
pub async fn ready_check(State(state): State<AppState>) -> Result<Json<ReadyResponse>, StatusCode> {
    match state.store.ping().await {
        Ok(()) => Ok(Json(ReadyResponse {
            status: "ready",
            store: true,
            node_id: state.node_id().to_string(),
        })),
        Err(e) => {
            tracing::warn!(error = %e, "Coordination store not reachable");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
