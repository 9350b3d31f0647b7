//! Coordination store abstraction.
//!
//! Every piece of cross-node state lives behind [`CoordinationStore`]:
//! plain keys with TTL, hash maps, set-if-absent, advisory locks and
//! publish/subscribe. Two backends are provided:
//! - [`RedisStore`] - production backend over a redis `ConnectionManager`
//! - [`MemoryStore`] - in-process backend for single-node mode and tests

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use colony_common::{ClusterError, Result};
use futures::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Stream of raw payloads published on a channel
pub type Subscription = BoxStream<'static, String>;

/// Poll interval while waiting for an advisory lock
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Shared key/value, hash-map, locking and pub/sub primitives
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Check that the backend is reachable
    async fn ping(&self) -> Result<()>;

    /// Get a string value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a string value with optional TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key, returns true if it existed
    async fn del(&self, key: &str) -> Result<bool>;

    /// Atomically set the key if it does not exist yet
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Refresh the TTL of an existing key, returns false if the key is gone
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Get one field of a hash map
    async fn hget(&self, map: &str, field: &str) -> Result<Option<String>>;

    /// Set one field of a hash map
    async fn hset(&self, map: &str, field: &str, value: &str) -> Result<()>;

    /// Delete one field of a hash map, returns true if it existed
    async fn hdel(&self, map: &str, field: &str) -> Result<bool>;

    /// Get every field of a hash map
    async fn hgetall(&self, map: &str) -> Result<HashMap<String, String>>;

    /// Get the fields of a hash map matching a glob pattern (`*`, `?`)
    async fn hscan(&self, map: &str, pattern: &str) -> Result<Vec<(String, String)>>;

    /// Publish a payload on a channel
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a channel. The subscription is active once this returns.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Take a short advisory lock, waiting up to `wait` for it.
    ///
    /// Locks are best-effort: they expire after `ttl` even if never released.
    async fn lock(&self, key: &str, ttl: Duration, wait: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.set_nx(key, "1", ttl).await? {
                return Ok(());
            }
            if started.elapsed() >= wait {
                return Err(ClusterError::LockContention(key.to_string()));
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    /// Release an advisory lock
    async fn unlock(&self, key: &str) -> Result<()> {
        self.del(key).await.map(|_| ())
    }
}

/// JSON helpers over the raw string primitives
impl dyn CoordinationStore {
    /// Get and decode one hash field
    pub async fn hget_json<T: DeserializeOwned>(&self, map: &str, field: &str) -> Result<Option<T>> {
        match self.hget(map, field).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Encode and set one hash field
    pub async fn hset_json<T: Serialize + Sync>(&self, map: &str, field: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.hset(map, field, &raw).await
    }

    /// Get and decode a whole hash map. Undecodable fields are skipped.
    pub async fn hgetall_json<T: DeserializeOwned>(&self, map: &str) -> Result<HashMap<String, T>> {
        let raw = self.hgetall(map).await?;
        Ok(decode_fields(map, raw))
    }

    /// Scan and decode hash fields matching `pattern`. Undecodable fields are skipped.
    pub async fn hscan_json<T: DeserializeOwned>(
        &self,
        map: &str,
        pattern: &str,
    ) -> Result<HashMap<String, T>> {
        let raw = self.hscan(map, pattern).await?;
        Ok(decode_fields(map, raw))
    }

    /// Encode and publish a payload
    pub async fn publish_json<T: Serialize + Sync>(&self, channel: &str, payload: &T) -> Result<()> {
        let raw = serde_json::to_string(payload)?;
        self.publish(channel, &raw).await
    }
}

fn decode_fields<T: DeserializeOwned>(
    map: &str,
    raw: impl IntoIterator<Item = (String, String)>,
) -> HashMap<String, T> {
    raw.into_iter()
        .filter_map(|(field, value)| match serde_json::from_str(&value) {
            Ok(decoded) => Some((field, decoded)),
            Err(e) => {
                tracing::warn!(map = %map, field = %field, error = %e, "Skipping undecodable record");
                None
            }
        })
        .collect()
}

/// Glob match supporting `*` (any run) and `?` (any single char)
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use colony_common::NodeRecord;
    use std::sync::Arc;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*:abc", "node-1:abc"));
        assert!(!glob_match("*:abc", "node-1:abcd"));
        assert!(glob_match("node-1:*", "node-1:abc"));
        assert!(!glob_match("node-1:*", "node-10abc"));
        assert!(glob_match("n?de-*", "node-7"));
        assert!(glob_match("", ""));
        assert!(!glob_match("", "x"));
    }

    #[tokio::test]
    async fn test_lock_contention_times_out() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());

        store
            .lock("lock:a", Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();

        let err = store
            .lock("lock:a", Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::LockContention(_)));

        store.unlock("lock:a").await.unwrap();
        tokio_test::assert_ok!(
            store
                .lock("lock:a", Duration::from_secs(5), Duration::from_millis(50))
                .await
        );
    }

    #[tokio::test]
    async fn test_json_helpers_skip_garbage() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let record = NodeRecord {
            addresses: vec![],
            last_ping_at: 42,
        };

        store.hset_json("nodes", "a", &record).await.unwrap();
        store.hset("nodes", "b", "not json").await.unwrap();

        let all = store.hgetall_json::<NodeRecord>("nodes").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["a"].last_ping_at, 42);

        let err = store.hget_json::<NodeRecord>("nodes", "b").await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidRecord(_)));
    }
}
