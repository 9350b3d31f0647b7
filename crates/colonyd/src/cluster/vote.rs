//! Address voting.
//!
//! Each node periodically probes the candidate addresses of its peers and
//! records the outcome as a vote inside the peer's record. Addresses with
//! more votes are preferred when redirecting traffic. A voter keeps exactly
//! one vote per address and does not re-probe while its last vote is fresh.

use colony_common::constants::{HEALTH_CHECK_PATH, store_keys};
use colony_common::{Address, ClusterError, NodeRecord, Result, now_millis};
use serde::Deserialize;
use std::collections::HashMap;

use super::node::NodeRegistry;

#[derive(Deserialize)]
struct HealthStatus {
    status: String,
}

impl NodeRegistry {
    /// Probe peer addresses and record the votes. Returns the number of
    /// addresses voted on.
    pub async fn vote_addresses(&self) -> Result<usize> {
        let peers = self.all_records().await?;
        let now = now_millis();
        let mut voted = 0;

        for (peer_id, record) in peers {
            if peer_id == self.node_id || self.is_stale(&record, now) {
                continue;
            }

            let mut results = HashMap::new();
            for addr in &record.addresses {
                if !self.should_probe(addr, now) {
                    continue;
                }
                let reachable = match self.probe(addr).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!(
                            peer = %peer_id,
                            address = %addr.full_address(),
                            error = %e,
                            "Address probe failed"
                        );
                        false
                    }
                };
                results.insert(addr.full_address(), reachable);
            }

            if results.is_empty() {
                continue;
            }

            match self.write_votes(&peer_id, &results).await {
                Ok(n) => voted += n,
                Err(e) => {
                    tracing::warn!(peer = %peer_id, error = %e, "Failed to record votes");
                }
            }
        }

        Ok(voted)
    }

    /// Skip addresses with a fresh vote of ours
    fn should_probe(&self, addr: &Address, now_ms: i64) -> bool {
        let Some(vote) = addr.vote_of(&self.node_id) else {
            return true;
        };
        let window = if vote.failed {
            self.vote_failure_window
        } else {
            self.vote_success_window
        };
        now_ms.saturating_sub(vote.voted_at) >= window.as_millis() as i64
    }

    async fn probe(&self, addr: &Address) -> Result<()> {
        let url = format!("http://{}{}", addr.http_authority(), HEALTH_CHECK_PATH);

        let response = self
            .http
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ClusterError::ProbeFailure(e.to_string()))?;

        let body: HealthStatus = response
            .json()
            .await
            .map_err(|e| ClusterError::ProbeFailure(e.to_string()))?;

        if body.status != "ok" {
            return Err(ClusterError::ProbeFailure(format!(
                "unexpected status {:?}",
                body.status
            )));
        }
        Ok(())
    }

    /// Merge our votes into the peer's current record under its lock
    async fn write_votes(&self, peer_id: &str, results: &HashMap<String, bool>) -> Result<usize> {
        self.lock_node(peer_id).await?;
        let written = self.merge_votes(peer_id, results).await;
        self.unlock_node(peer_id).await;
        written
    }

    async fn merge_votes(&self, peer_id: &str, results: &HashMap<String, bool>) -> Result<usize> {
        // Re-read: the peer may have heartbeated since the scan
        let Some(mut record) = self
            .store
            .hget_json::<NodeRecord>(store_keys::CLUSTER_STATUS_HASH_MAP, peer_id)
            .await?
        else {
            return Ok(0);
        };

        let now = now_millis();
        let mut voted = 0;
        for addr in &mut record.addresses {
            if let Some(&reachable) = results.get(&addr.full_address()) {
                addr.record_vote(&self.node_id, now, !reachable);
                voted += 1;
            }
        }

        self.store
            .hset_json(store_keys::CLUSTER_STATUS_HASH_MAP, peer_id, &record)
            .await?;
        Ok(voted)
    }
}
