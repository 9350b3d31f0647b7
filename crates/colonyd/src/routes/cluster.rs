//! Read-only cluster status endpoints.

use axum::{
    Json,
    extract::{Path, State},
};
use colony_common::{NodeRecord, NodeRole};
use serde::Serialize;
use std::collections::BTreeMap;

use super::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct StatusResponse {
    node_id: String,
    role: NodeRole,
    master: Option<String>,
    members: usize,
    plugins: Vec<String>,
}

/// This node's view of the cluster
pub async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let cluster = &state.cluster;
    let master = cluster.master_id().await?;

    Ok(Json(StatusResponse {
        node_id: cluster.id().to_string(),
        role: cluster.role(),
        master,
        members: cluster.nodes().await.len(),
        plugins: cluster.local_plugins().await,
    }))
}

/// Live members with their addresses, best address first
pub async fn get_nodes(State(state): State<AppState>) -> Json<BTreeMap<String, NodeRecord>> {
    let nodes = state
        .cluster
        .nodes()
        .await
        .into_iter()
        .map(|(id, record)| {
            let addresses = crate::cluster::sort_addresses(&record);
            (id, NodeRecord { addresses, ..record })
        })
        .collect();
    Json(nodes)
}

#[derive(Serialize)]
pub struct PluginNodesResponse {
    hashed_id: String,
    nodes: Vec<String>,
}

/// Live nodes hosting a plugin
pub async fn get_plugin_nodes(
    State(state): State<AppState>,
    Path(hashed_id): Path<String>,
) -> Result<Json<PluginNodesResponse>, ApiError> {
    let nodes = state
        .cluster
        .fetch_plugin_available_nodes_by_hashed_id(&hashed_id)
        .await?;

    Ok(Json(PluginNodesResponse { hashed_id, nodes }))
}
