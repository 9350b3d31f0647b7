//! Records shared between nodes through the coordination store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current wall-clock time as unix milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Holds the master lock and runs garbage collection
    Master,
    /// Any other node
    Slave,
}

impl Default for NodeRole {
    fn default() -> Self {
        Self::Slave
    }
}

/// One node's opinion about the reachability of an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Voting node
    pub node_id: String,
    /// Unix millis of the probe
    pub voted_at: i64,
    /// True if the probe failed
    pub failed: bool,
}

/// A candidate address of a node, with the votes cast for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub votes: Vec<Vote>,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            votes: Vec::new(),
        }
    }

    /// `host:port`
    pub fn full_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Authority for URLs, bracketing IPv6 hosts
    pub fn http_authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            self.full_address()
        }
    }

    /// The vote cast by `node_id`, if any
    pub fn vote_of(&self, node_id: &str) -> Option<&Vote> {
        self.votes.iter().find(|v| v.node_id == node_id)
    }

    /// Insert or overwrite the vote of `node_id`.
    ///
    /// A voter owns exactly one entry per address; repeated votes update it
    /// in place.
    pub fn record_vote(&mut self, node_id: &str, voted_at: i64, failed: bool) {
        match self.votes.iter_mut().find(|v| v.node_id == node_id) {
            Some(vote) => {
                vote.voted_at = voted_at;
                vote.failed = failed;
            }
            None => self.votes.push(Vote {
                node_id: node_id.to_string(),
                voted_at,
                failed,
            }),
        }
    }
}

/// Liveness record of a node, keyed by node id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(default)]
    pub addresses: Vec<Address>,
    /// Unix millis of the last heartbeat
    pub last_ping_at: i64,
}

impl NodeRecord {
    /// Alive iff the last ping is younger than `timeout_ms`
    pub fn is_alive(&self, timeout_ms: u64, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_ping_at) < timeout_ms as i64
    }

    /// Append addresses not yet known, keeping the votes of known ones.
    /// Returns the number of addresses added.
    pub fn merge_addresses(&mut self, discovered: impl IntoIterator<Item = Address>) -> usize {
        let mut added = 0;
        for addr in discovered {
            let known = self
                .addresses
                .iter()
                .any(|a| a.host == addr.host && a.port == addr.port);
            if !known {
                self.addresses.push(addr);
                added += 1;
            }
        }
        added
    }
}

/// Snapshot of a plugin runtime as reported by its supervisor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRuntimeState {
    #[serde(default)]
    pub restarts: u32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub working_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub verified: bool,
}

/// Location record of a plugin, keyed by `{node_id}:{hashed_plugin_id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRecord {
    /// Plugin identity (unhashed)
    pub identity: String,

    #[serde(flatten)]
    pub state: PluginRuntimeState,

    /// Last time the owning node refreshed this record
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl PluginRecord {
    /// Active iff refreshed within `timeout_ms`
    pub fn is_active(&self, timeout_ms: u64, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => (now - at).num_milliseconds() < timeout_ms as i64,
            None => false,
        }
    }
}

/// Broadcast when a node joins the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNodeEvent {
    pub node_id: String,
}
