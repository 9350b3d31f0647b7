//! Plugin location tracking.
//!
//! A node publishes one [`PluginRecord`] per plugin it hosts, keyed by
//! `{node_id}:{hashed_plugin_id}`, and refreshes it on the scheduling
//! interval. A record that stops being refreshed is collected by the master.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colony_common::constants::store_keys;
use colony_common::{ClusterError, PluginRecord, PluginRuntimeState, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::node::NodeRegistry;
use crate::store::CoordinationStore;

/// Callback run when a plugin stops
pub type StopHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + Sync>;

/// A running plugin, as seen by the cluster
pub trait PluginLifetime: Send + Sync {
    /// Plugin identity, e.g. `author/name:version`
    fn identity(&self) -> String;

    fn hashed_identity(&self) -> String {
        hashed_identity(&self.identity())
    }

    fn stopped(&self) -> bool;

    /// Register a hook to run once the plugin stops
    fn on_stop(&self, hook: StopHook);

    /// Current runtime snapshot, published with the plugin record
    fn runtime_state(&self) -> PluginRuntimeState;

    /// Told after every successful publish
    fn update_scheduled_at(&self, _at: DateTime<Utc>) {}
}

/// The component that installs and launches plugins on this node
#[async_trait]
pub trait PluginSupervisor: Send + Sync {
    async fn is_plugin_installed(&self, identity: &str) -> bool;
}

/// Lowercase hex SHA-256 of a plugin identity
pub fn hashed_identity(identity: &str) -> String {
    format!("{:x}", Sha256::digest(identity.as_bytes()))
}

/// Reject anything that is not a lowercase hex SHA-256, so that a hashed
/// id can be embedded in a scan pattern as a literal
pub fn validate_hashed_id(hashed_id: &str) -> Result<()> {
    let well_formed = hashed_id.len() == 64
        && hashed_id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if well_formed {
        Ok(())
    } else {
        Err(ClusterError::InvalidArgument(format!("malformed hashed plugin id {hashed_id:?}")))
    }
}

/// Field of a plugin record in the plugin state map
pub fn plugin_state_key(node_id: &str, hashed_id: &str) -> String {
    format!("{node_id}:{hashed_id}")
}

/// Split a plugin state key into `(node_id, hashed_id)`
pub fn split_plugin_state_key(key: &str) -> Result<(&str, &str)> {
    key.rsplit_once(':')
        .filter(|(node, hashed)| !node.is_empty() && !hashed.is_empty())
        .ok_or_else(|| ClusterError::InvalidRecord(format!("malformed plugin key {key:?}")))
}

struct LocalPlugin {
    lifetime: Arc<dyn PluginLifetime>,
    hashed_id: String,
    last_published: Option<Instant>,
}

/// Plugins hosted by this node and their shared records
pub struct PluginRegistry {
    node_id: String,
    store: Arc<dyn CoordinationStore>,
    nodes: Arc<NodeRegistry>,
    supervisor: Option<Arc<dyn PluginSupervisor>>,
    scheduler_interval: Duration,
    plugins: RwLock<HashMap<String, LocalPlugin>>,
}

impl PluginRegistry {
    pub fn new(
        node_id: String,
        store: Arc<dyn CoordinationStore>,
        nodes: Arc<NodeRegistry>,
        supervisor: Option<Arc<dyn PluginSupervisor>>,
        scheduler_interval: Duration,
    ) -> Self {
        Self {
            node_id,
            store,
            nodes,
            supervisor,
            scheduler_interval,
            plugins: RwLock::new(HashMap::new()),
        }
    }

    /// Start tracking a plugin and publish its record.
    ///
    /// An already stopped plugin is ignored.
    pub async fn register_plugin(self: &Arc<Self>, lifetime: Arc<dyn PluginLifetime>) -> Result<()> {
        let identity = lifetime.identity();
        let mut plugins = self.plugins.write().await;

        if plugins.contains_key(&identity) {
            return Err(ClusterError::PluginAlreadyRegistered(identity));
        }

        // Hook first, so a stop racing with registration is never missed
        let registry = Arc::downgrade(self);
        let hook_identity = identity.clone();
        lifetime.on_stop(Box::new(move || {
            async move {
                if let Some(registry) = registry.upgrade() {
                    if let Err(e) = registry.unregister(&hook_identity).await {
                        tracing::warn!(plugin = %hook_identity, error = %e, "Failed to remove plugin record");
                    }
                }
            }
            .boxed()
        }));

        if lifetime.stopped() {
            tracing::debug!(plugin = %identity, "Plugin already stopped, not registering");
            return Ok(());
        }

        let local = LocalPlugin {
            hashed_id: lifetime.hashed_identity(),
            lifetime,
            last_published: None,
        };
        let local = plugins.entry(identity.clone()).or_insert(local);

        // Still under the table lock: a concurrent stop waits for the
        // record to exist before deleting it
        self.publish(local).await?;
        local.last_published = Some(Instant::now());

        tracing::info!(plugin = %identity, "Plugin registered");
        Ok(())
    }

    /// Drop a plugin from the table and delete its record
    async fn unregister(&self, identity: &str) -> Result<()> {
        let removed = self.plugins.write().await.remove(identity);
        let hashed_id = match removed {
            Some(local) => local.hashed_id,
            None => hashed_identity(identity),
        };

        self.remove_plugin_state(&self.node_id, &hashed_id).await?;
        tracing::info!(plugin = %identity, "Plugin unregistered");
        Ok(())
    }

    async fn publish(&self, local: &LocalPlugin) -> Result<()> {
        let now = Utc::now();
        let record = PluginRecord {
            identity: local.lifetime.identity(),
            state: local.lifetime.runtime_state(),
            scheduled_at: Some(now),
        };

        self.store
            .hset_json(
                store_keys::PLUGIN_STATE_MAP,
                &plugin_state_key(&self.node_id, &local.hashed_id),
                &record,
            )
            .await?;
        local.lifetime.update_scheduled_at(now);
        Ok(())
    }

    /// Re-publish every plugin whose record is due. Returns how many were
    /// published.
    pub async fn schedule_plugins(&self) -> usize {
        let due: Vec<String> = {
            let plugins = self.plugins.read().await;
            plugins
                .iter()
                .filter(|(_, p)| {
                    p.last_published
                        .is_none_or(|at| at.elapsed() >= self.scheduler_interval)
                })
                .map(|(identity, _)| identity.clone())
                .collect()
        };

        let mut published = 0;
        for identity in due {
            let mut plugins = self.plugins.write().await;
            // Stopped while we were publishing the others
            let Some(local) = plugins.get_mut(&identity) else {
                continue;
            };

            match self.publish(local).await {
                Ok(()) => {
                    local.last_published = Some(Instant::now());
                    published += 1;
                }
                Err(e) => {
                    tracing::warn!(plugin = %identity, error = %e, "Failed to publish plugin record");
                }
            }
        }

        published
    }

    /// Live nodes hosting the plugin with the given hashed id
    pub async fn fetch_plugin_available_nodes_by_hashed_id(&self, hashed_id: &str) -> Result<Vec<String>> {
        validate_hashed_id(hashed_id)?;

        let records = self
            .store
            .hscan(store_keys::PLUGIN_STATE_MAP, &format!("*:{hashed_id}"))
            .await?;

        let mut nodes = Vec::new();
        for (key, _) in records {
            let Ok((node_id, hashed)) = split_plugin_state_key(&key) else {
                tracing::debug!(key = %key, "Skipping malformed plugin key");
                continue;
            };
            if hashed == hashed_id && self.nodes.contains(node_id).await {
                nodes.push(node_id.to_string());
            }
        }

        nodes.sort();
        nodes.dedup();
        Ok(nodes)
    }

    pub async fn fetch_plugin_available_nodes(&self, identity: &str) -> Result<Vec<String>> {
        self.fetch_plugin_available_nodes_by_hashed_id(&hashed_identity(identity))
            .await
    }

    /// Hosted here, or at least installed according to the supervisor
    pub async fn is_plugin_on_current_node(&self, identity: &str) -> bool {
        if self.plugins.read().await.contains_key(identity) {
            return true;
        }
        match &self.supervisor {
            Some(supervisor) => supervisor.is_plugin_installed(identity).await,
            None => false,
        }
    }

    /// Identities of the plugins hosted here
    pub async fn local_plugins(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        identities.sort();
        identities
    }

    pub async fn remove_plugin_state(&self, node_id: &str, hashed_id: &str) -> Result<bool> {
        self.store
            .hdel(store_keys::PLUGIN_STATE_MAP, &plugin_state_key(node_id, hashed_id))
            .await
    }

    /// Delete a plugin record by its raw key
    pub async fn remove_plugin_state_by_key(&self, key: &str) -> Result<bool> {
        self.store.hdel(store_keys::PLUGIN_STATE_MAP, key).await
    }

    /// Every plugin record, keyed by raw key. Undecodable values are `None`.
    pub async fn all_records(&self) -> Result<Vec<(String, Option<PluginRecord>)>> {
        let raw = self.store.hgetall(store_keys::PLUGIN_STATE_MAP).await?;
        Ok(raw
            .into_iter()
            .map(|(key, value)| (key, serde_json::from_str(&value).ok()))
            .collect())
    }

    /// Remove one plugin of `node_id` from the shared map, and from the
    /// local table when `node_id` is this node
    pub async fn force_gc_node_plugin(&self, node_id: &str, identity: &str) -> Result<()> {
        if node_id == self.node_id {
            self.plugins.write().await.remove(identity);
        }
        self.remove_plugin_state(node_id, &hashed_identity(identity))
            .await
            .map(|_| ())
    }

    /// Remove every plugin record owned by `node_id`
    pub async fn force_gc_node_plugins(&self, node_id: &str) -> Result<usize> {
        let records = self
            .store
            .hscan(store_keys::PLUGIN_STATE_MAP, &format!("{node_id}:*"))
            .await?;

        let mut errors = Vec::new();
        let mut removed = 0;
        for (key, value) in records {
            // Node ids are not glob-escaped, so keep exact owners only
            if !matches!(split_plugin_state_key(&key), Ok((owner, _)) if owner == node_id) {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<PluginRecord>(&value) {
                if let Err(e) = self.force_gc_node_plugin(node_id, &record.identity).await {
                    errors.push(e);
                    continue;
                }
            }
            match self.remove_plugin_state_by_key(&key).await {
                Ok(_) => removed += 1,
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            Ok(removed)
        } else {
            Err(ClusterError::PartialGc(errors))
        }
    }
}
