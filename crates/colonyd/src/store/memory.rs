//! In-process coordination store.
//!
//! Shares state between every `Cluster` holding the same `Arc<MemoryStore>`,
//! which is how several nodes are simulated inside one process. Keys with a
//! TTL expire lazily on access.

use async_trait::async_trait;
use colony_common::Result;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use super::{CoordinationStore, Subscription, glob_match};

/// Capacity of each channel's broadcast buffer
const CHANNEL_CAPACITY: usize = 256;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Inner {
    keys: HashMap<String, Entry>,
    maps: HashMap<String, HashMap<String, String>>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl Inner {
    /// Live entry for `key`, dropping it if expired
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.keys.get(key).is_some_and(|e| e.is_expired(now)) {
            self.keys.remove(key);
        }
        self.keys.get_mut(key)
    }
}

/// In-memory coordination store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut inner)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with(|inner| inner.live(key).map(|e| e.value.clone())))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.with(|inner| {
            inner.keys.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
        });
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.with(|inner| {
            let existed = inner.live(key).is_some();
            inner.keys.remove(key);
            existed
        }))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        Ok(self.with(|inner| {
            if inner.live(key).is_some() {
                return false;
            }
            inner.keys.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            true
        }))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.with(|inner| match inner.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }))
    }

    async fn hget(&self, map: &str, field: &str) -> Result<Option<String>> {
        Ok(self.with(|inner| inner.maps.get(map).and_then(|m| m.get(field).cloned())))
    }

    async fn hset(&self, map: &str, field: &str, value: &str) -> Result<()> {
        self.with(|inner| {
            inner
                .maps
                .entry(map.to_string())
                .or_default()
                .insert(field.to_string(), value.to_string());
        });
        Ok(())
    }

    async fn hdel(&self, map: &str, field: &str) -> Result<bool> {
        Ok(self.with(|inner| {
            let Some(m) = inner.maps.get_mut(map) else {
                return false;
            };
            let existed = m.remove(field).is_some();
            if m.is_empty() {
                inner.maps.remove(map);
            }
            existed
        }))
    }

    async fn hgetall(&self, map: &str) -> Result<HashMap<String, String>> {
        Ok(self.with(|inner| inner.maps.get(map).cloned().unwrap_or_default()))
    }

    async fn hscan(&self, map: &str, pattern: &str) -> Result<Vec<(String, String)>> {
        Ok(self.with(|inner| {
            inner
                .maps
                .get(map)
                .map(|m| {
                    m.iter()
                        .filter(|(field, _)| glob_match(pattern, field))
                        .map(|(field, value)| (field.clone(), value.clone()))
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.with(|inner| {
            if let Some(tx) = inner.channels.get(channel) {
                // No receivers is not an error, same as redis PUBLISH
                let _ = tx.send(payload.to_string());
            }
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let rx = self.with(|inner| {
            inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Subscriber lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}
