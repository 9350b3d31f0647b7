//! HTTP route handlers for colonyd.

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use colony_common::ClusterError;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod cluster;
mod health;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Readiness
        .route("/ready", get(health::ready_check))

        // Cluster status
        .nest("/cluster", cluster_routes())

        // Add shared state
        .with_state(state)

        // Probed by peers, stateless
        .merge(probe_routes())
        .layer(TraceLayer::new_for_http())
}

/// Health routes peers probe while voting
pub fn probe_routes() -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/health/check", get(health::health_check))
}

fn cluster_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(cluster::get_status))
        .route("/nodes", get(cluster::get_nodes))
        .route("/plugins/{hashed_id}/nodes", get(cluster::get_plugin_nodes))
}

/// Cluster errors rendered as JSON with their status code
pub struct ApiError(pub ClusterError);

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "error": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        }));
        (status, body).into_response()
    }
}
