//! Redis-backed coordination store.

use async_trait::async_trait;
use colony_common::{ClusterError, Result};
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;

use super::{CoordinationStore, Subscription};

/// Page size of HSCAN iterations
const SCAN_COUNT: usize = 32;

/// Coordination store over a redis server
#[derive(Clone)]
pub struct RedisStore {
    /// Client used to open dedicated pub/sub connections
    client: redis::Client,
    /// Shared multiplexed connection (auto-reconnecting)
    conn: ConnectionManager,
}

fn unavailable(err: redis::RedisError) -> ClusterError {
    ClusterError::StoreUnavailable(err.to_string())
}

fn millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by redis
    (ttl.as_millis() as u64).max(1)
}

impl RedisStore {
    /// Connect to redis, failing fast if the server is unreachable
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable)?;

        Ok(Self { client, conn })
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(unavailable)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(unavailable)?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: u64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(updated == 1)
    }

    async fn hget(&self, map: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.hget(map, field).await.map_err(unavailable)
    }

    async fn hset(&self, map: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(map, field, value).await.map_err(unavailable)?;
        Ok(())
    }

    async fn hdel(&self, map: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.hdel(map, field).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn hgetall(&self, map: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        conn.hgetall(map).await.map_err(unavailable)
    }

    async fn hscan(&self, map: &str, pattern: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut fields = Vec::new();

        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("HSCAN")
                .arg(map)
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;

            let mut page = page.into_iter();
            while let (Some(field), Some(value)) = (page.next(), page.next()) {
                fields.push((field, value));
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(fields)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.publish(channel, payload).await.map_err(unavailable)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        pubsub.subscribe(channel).await.map_err(unavailable)?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping non-string pub/sub payload");
                    None
                }
            }
        });

        Ok(stream.boxed())
    }
}
