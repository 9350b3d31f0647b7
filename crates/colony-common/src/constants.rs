//! Shared constants for Colony components.

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default colonyd HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5002";

/// Health endpoint probed by peers during address voting
pub const HEALTH_CHECK_PATH: &str = "/health/check";

/// Interval between attempts to take the master slot (milliseconds)
pub const MASTER_LOCKING_INTERVAL_MS: u64 = 500;

/// Expiry of the master lock key (milliseconds)
pub const MASTER_LOCK_EXPIRED_TIME_MS: u64 = 2_000;

/// Interval between garbage collection rounds on the master (milliseconds)
pub const MASTER_GC_INTERVAL_MS: u64 = 10_000;

/// Interval between address voting rounds (milliseconds)
pub const NODE_VOTE_INTERVAL_MS: u64 = 30_000;

/// Heartbeat interval (milliseconds)
pub const UPDATE_NODE_STATUS_INTERVAL_MS: u64 = 5_000;

/// A node whose last ping is older than this is considered gone (milliseconds)
pub const NODE_DISCONNECTED_TIMEOUT_MS: u64 = 10_000;

/// How often the plugin scheduler wakes up (milliseconds)
pub const PLUGIN_SCHEDULER_TICKER_INTERVAL_MS: u64 = 3_000;

/// A plugin record is refreshed once it is older than this (milliseconds)
pub const PLUGIN_SCHEDULER_INTERVAL_MS: u64 = 10_000;

/// A plugin record not refreshed for this long is garbage (milliseconds)
pub const PLUGIN_DEACTIVATED_TIMEOUT_MS: u64 = 30_000;

/// Timeout of a single health probe (milliseconds)
pub const HEALTH_PROBE_TIMEOUT_MS: u64 = 500;

/// A successful vote is not repeated within this window (seconds)
pub const VOTE_SUCCESS_WINDOW_SECS: u64 = 5 * 60;

/// A failed vote is not repeated within this window (seconds)
pub const VOTE_FAILURE_WINDOW_SECS: u64 = 30 * 60;

/// Expiry of per-node advisory locks (milliseconds)
pub const NODE_STATUS_LOCK_EXPIRED_TIME_MS: u64 = 5_000;

/// How long to wait for a per-node advisory lock (milliseconds)
pub const NODE_STATUS_LOCK_WAIT_MS: u64 = 1_000;

/// Attempts made to take the master lock before giving up for this tick
pub const MASTER_LOCK_ATTEMPTS: usize = 3;

/// Coordination store keys
pub mod store_keys {
    /// Hash of node records: field = node id
    pub const CLUSTER_STATUS_HASH_MAP: &str = "cluster-status-hash-map";

    /// Master preemption lock, value = master node id
    pub const PREEMPTION_LOCK: &str = "cluster-master-preemption-lock";

    /// Hash of plugin records: field = {node_id}:{hashed_plugin_id}
    pub const PLUGIN_STATE_MAP: &str = "plugin_state";

    /// Per-node advisory lock: cluster-update-node-status-lock:{node_id}
    pub const NODE_STATUS_LOCK_PREFIX: &str = "cluster-update-node-status-lock";
}

/// Publish/subscribe topics
pub mod channels {
    /// Announces a freshly started node
    pub const NEW_NODE: &str = "cluster-new-node-channel";
}
