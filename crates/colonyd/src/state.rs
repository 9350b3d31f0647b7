//! Application state and shared resources.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::cluster::Cluster;
use crate::config::{AppConfig, StoreBackend};
use crate::store::{CoordinationStore, MemoryStore, RedisStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Coordination store shared with the cluster
    pub store: Arc<dyn CoordinationStore>,

    /// This node's cluster membership
    pub cluster: Arc<Cluster>,
}

impl AppState {
    /// Create application state, connecting to the configured store
    pub async fn new(config: AppConfig) -> Result<Self> {
        let store: Arc<dyn CoordinationStore> = match config.store {
            StoreBackend::Redis => Arc::new(
                RedisStore::connect(&config.redis_url)
                    .await
                    .context("Failed to connect to Redis")?,
            ),
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory store, clustering is limited to this process");
                Arc::new(MemoryStore::new())
            }
        };

        let port = config.advertised_port()?;
        let cluster = Cluster::new(config.cluster.clone(), port, store.clone());

        Ok(Self::from_parts(config, store, cluster))
    }

    pub fn from_parts(config: AppConfig, store: Arc<dyn CoordinationStore>, cluster: Arc<Cluster>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            cluster,
        }
    }

    pub fn node_id(&self) -> &str {
        self.cluster.id()
    }
}
