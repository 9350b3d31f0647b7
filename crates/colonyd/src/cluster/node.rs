//! Node membership: heartbeats and the local membership mirror.
//!
//! Every node writes its own [`NodeRecord`] into the cluster status map on
//! each heartbeat and then re-reads the whole map, keeping the live records
//! as its view of the cluster. Writes to one node's record are serialized by
//! a short advisory lock keyed on that node's id, since peers also write
//! into it when they vote (see `vote.rs`).

use colony_common::constants::{
    NODE_STATUS_LOCK_EXPIRED_TIME_MS, NODE_STATUS_LOCK_WAIT_MS, store_keys,
};
use colony_common::{Address, ClusterError, NodeRecord, Result, now_millis};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::ClusterConfig;
use crate::store::CoordinationStore;

/// Heartbeats this node and mirrors the live members of the cluster
pub struct NodeRegistry {
    pub(super) node_id: String,
    port: u16,
    advertise_ips: Vec<IpAddr>,
    pub(super) store: Arc<dyn CoordinationStore>,
    disconnected_timeout_ms: u64,

    // Voting
    pub(super) vote_success_window: Duration,
    pub(super) vote_failure_window: Duration,
    pub(super) probe_timeout: Duration,
    pub(super) http: reqwest::Client,

    /// Live nodes as of the last heartbeat
    members: RwLock<HashMap<String, NodeRecord>>,
}

impl NodeRegistry {
    pub fn new(
        node_id: String,
        port: u16,
        config: &ClusterConfig,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        Self {
            node_id,
            port,
            advertise_ips: config.advertise_ips.clone(),
            store,
            disconnected_timeout_ms: config.node_disconnected_timeout_ms,
            vote_success_window: Duration::from_secs(config.vote_success_window_secs),
            vote_failure_window: Duration::from_secs(config.vote_failure_window_secs),
            probe_timeout: config.health_probe_timeout(),
            http: reqwest::Client::new(),
            members: RwLock::new(HashMap::new()),
        }
    }

    /// Take the advisory lock guarding `node_id`'s record
    pub(super) async fn lock_node(&self, node_id: &str) -> Result<()> {
        self.store
            .lock(
                &node_status_lock_key(node_id),
                Duration::from_millis(NODE_STATUS_LOCK_EXPIRED_TIME_MS),
                Duration::from_millis(NODE_STATUS_LOCK_WAIT_MS),
            )
            .await
    }

    pub(super) async fn unlock_node(&self, node_id: &str) {
        if let Err(e) = self.store.unlock(&node_status_lock_key(node_id)).await {
            tracing::warn!(node_id = %node_id, error = %e, "Failed to release node status lock");
        }
    }

    /// Heartbeat: refresh this node's record, then the membership mirror
    pub async fn update_node_status(&self) -> Result<()> {
        self.lock_node(&self.node_id).await?;
        let written = self.write_heartbeat().await;
        self.unlock_node(&self.node_id).await;
        written?;

        self.refresh_members().await
    }

    async fn write_heartbeat(&self) -> Result<()> {
        let existing = self
            .store
            .hget_json::<NodeRecord>(store_keys::CLUSTER_STATUS_HASH_MAP, &self.node_id)
            .await?;

        let discovered = self.discover_addresses()?;
        let mut record = match existing {
            Some(mut record) => {
                let added = record.merge_addresses(discovered);
                if added > 0 {
                    tracing::info!(added, "Discovered new local addresses");
                }
                record
            }
            None => NodeRecord {
                addresses: discovered,
                last_ping_at: 0,
            },
        };
        record.last_ping_at = now_millis();

        self.store
            .hset_json(store_keys::CLUSTER_STATUS_HASH_MAP, &self.node_id, &record)
            .await
    }

    /// Candidate addresses of this node, without votes
    fn discover_addresses(&self) -> Result<Vec<Address>> {
        let ips = if self.advertise_ips.is_empty() {
            local_ipv4_addresses()?
        } else {
            self.advertise_ips.clone()
        };

        Ok(ips
            .into_iter()
            .map(|ip| Address::new(ip.to_string(), self.port))
            .collect())
    }

    /// Replace the mirror with the live records in the store
    pub async fn refresh_members(&self) -> Result<()> {
        let all = self
            .store
            .hgetall_json::<NodeRecord>(store_keys::CLUSTER_STATUS_HASH_MAP)
            .await?;

        let now = now_millis();
        let live: HashMap<String, NodeRecord> = all
            .into_iter()
            .filter(|(_, record)| record.is_alive(self.disconnected_timeout_ms, now))
            .collect();

        tracing::trace!(members = live.len(), "Membership refreshed");
        *self.members.write().await = live;
        Ok(())
    }

    /// Snapshot of the live members
    pub async fn members(&self) -> HashMap<String, NodeRecord> {
        self.members.read().await.clone()
    }

    pub async fn member(&self, node_id: &str) -> Option<NodeRecord> {
        self.members.read().await.get(node_id).cloned()
    }

    pub async fn contains(&self, node_id: &str) -> bool {
        self.members.read().await.contains_key(node_id)
    }

    /// Drop a node from the mirror until the next refresh
    pub async fn forget(&self, node_id: &str) {
        self.members.write().await.remove(node_id);
    }

    /// Read the node's record from the store and apply the liveness rule
    pub async fn is_node_alive(&self, node_id: &str) -> Result<bool> {
        let record = self
            .store
            .hget_json::<NodeRecord>(store_keys::CLUSTER_STATUS_HASH_MAP, node_id)
            .await?;

        Ok(record.is_some_and(|r| r.is_alive(self.disconnected_timeout_ms, now_millis())))
    }

    /// All records in the store, live or not
    pub async fn all_records(&self) -> Result<HashMap<String, NodeRecord>> {
        self.store
            .hgetall_json(store_keys::CLUSTER_STATUS_HASH_MAP)
            .await
    }

    pub fn is_stale(&self, record: &NodeRecord, now_ms: i64) -> bool {
        !record.is_alive(self.disconnected_timeout_ms, now_ms)
    }

    /// Delete a node's record under its advisory lock
    pub async fn remove_record(&self, node_id: &str) -> Result<()> {
        self.lock_node(node_id).await?;
        let removed = self
            .store
            .hdel(store_keys::CLUSTER_STATUS_HASH_MAP, node_id)
            .await;
        self.unlock_node(node_id).await;
        removed.map(|_| ())
    }
}

pub(super) fn node_status_lock_key(node_id: &str) -> String {
    format!("{}:{}", store_keys::NODE_STATUS_LOCK_PREFIX, node_id)
}

/// Addresses ordered by descending vote count, ties kept in record order
pub fn sort_addresses(record: &NodeRecord) -> Vec<Address> {
    let mut addresses = record.addresses.clone();
    addresses.sort_by(|a, b| b.votes.len().cmp(&a.votes.len()));
    addresses
}

/// Non-loopback IPv4 addresses of the local interfaces
fn local_ipv4_addresses() -> Result<Vec<IpAddr>> {
    let interfaces =
        if_addrs::get_if_addrs().map_err(|e| ClusterError::Network(e.to_string()))?;

    let mut ips: Vec<IpAddr> = interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .map(|iface| iface.ip())
        .filter(IpAddr::is_ipv4)
        .collect();
    ips.sort();
    ips.dedup();
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry(id: &str, store: &Arc<dyn CoordinationStore>) -> NodeRegistry {
        let config = ClusterConfig {
            advertise_ips: vec!["10.0.0.7".parse().unwrap()],
            node_disconnected_timeout_ms: 1_000,
            ..Default::default()
        };
        NodeRegistry::new(id.to_string(), 5002, &config, store.clone())
    }

    #[tokio::test]
    async fn test_heartbeat_creates_and_refreshes_record() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let nodes = registry("node-a", &store);

        nodes.update_node_status().await.unwrap();
        let first = nodes.member("node-a").await.unwrap();
        assert_eq!(first.addresses, vec![Address::new("10.0.0.7", 5002)]);

        tokio::time::sleep(Duration::from_millis(5)).await;
        nodes.update_node_status().await.unwrap();
        let second = nodes.member("node-a").await.unwrap();
        assert!(second.last_ping_at > first.last_ping_at);
        assert_eq!(second.addresses.len(), 1);

        assert!(nodes.is_node_alive("node-a").await.unwrap());
        assert!(!nodes.is_node_alive("node-x").await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_peer_votes() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let nodes = registry("node-a", &store);

        let mut voted = Address::new("10.0.0.7", 5002);
        voted.record_vote("node-b", now_millis(), false);
        let seeded = NodeRecord {
            addresses: vec![voted],
            last_ping_at: 0,
        };
        store
            .hset_json(store_keys::CLUSTER_STATUS_HASH_MAP, "node-a", &seeded)
            .await
            .unwrap();

        nodes.update_node_status().await.unwrap();

        let record = nodes.member("node-a").await.unwrap();
        assert_eq!(record.addresses[0].votes.len(), 1);
    }

    #[tokio::test]
    async fn test_mirror_excludes_stale_nodes() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let nodes = registry("node-a", &store);

        let stale = NodeRecord {
            addresses: vec![],
            last_ping_at: now_millis() - 60_000,
        };
        store
            .hset_json(store_keys::CLUSTER_STATUS_HASH_MAP, "node-old", &stale)
            .await
            .unwrap();

        nodes.update_node_status().await.unwrap();

        assert!(nodes.contains("node-a").await);
        assert!(!nodes.contains("node-old").await);
        assert_eq!(nodes.all_records().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_heartbeat_fails_while_lock_is_held() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let nodes = registry("node-a", &store);

        store
            .lock(&node_status_lock_key("node-a"), Duration::from_secs(10), Duration::ZERO)
            .await
            .unwrap();

        let err = nodes.update_node_status().await.unwrap_err();
        assert!(matches!(err, ClusterError::LockContention(_)));
    }

    #[test]
    fn test_sort_addresses_is_stable_by_votes() {
        let mut busy = Address::new("10.0.0.3", 5002);
        busy.record_vote("node-b", 1, false);
        busy.record_vote("node-c", 1, false);
        let mut one = Address::new("10.0.0.2", 5002);
        one.record_vote("node-b", 1, false);
        let record = NodeRecord {
            addresses: vec![
                Address::new("10.0.0.1", 5002),
                one,
                Address::new("10.0.0.4", 5002),
                busy,
            ],
            last_ping_at: 0,
        };

        let hosts: Vec<String> = sort_addresses(&record).into_iter().map(|a| a.host).collect();
        assert_eq!(hosts, vec!["10.0.0.3", "10.0.0.2", "10.0.0.1", "10.0.0.4"]);
    }
}
