//! Master election over a TTL'd preemption lock.
//!
//! Whoever manages to `SET NX` the lock key becomes master and keeps the key
//! alive by refreshing its TTL. Everyone else retries on the locking interval
//! and takes over once the key expires.

use colony_common::constants::{MASTER_LOCK_ATTEMPTS, store_keys};
use colony_common::{ClusterError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::store::CoordinationStore;

/// What a leadership tick changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// Lock acquired on this tick
    BecameMaster,
    /// Lock refreshed (or refresh failed transiently)
    StillMaster,
    /// Another node holds the lock now
    LostMaster,
    /// Lock held elsewhere, nothing changed
    Slave,
}

/// Acquires and renews the master lock for one node
pub struct MasterElector {
    node_id: String,
    store: Arc<dyn CoordinationStore>,
    lock_ttl: Duration,
    is_master: AtomicBool,
}

impl MasterElector {
    pub fn new(node_id: String, store: Arc<dyn CoordinationStore>, lock_ttl: Duration) -> Self {
        Self {
            node_id,
            store,
            lock_ttl,
            is_master: AtomicBool::new(false),
        }
    }

    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::Acquire)
    }

    /// Node id currently stored in the lock, if any
    pub async fn current_master(&self) -> Result<Option<String>> {
        self.store.get(store_keys::PREEMPTION_LOCK).await
    }

    /// Try to take the lock.
    ///
    /// Returns `Ok(false)` when another node holds it. Store errors are
    /// retried a few times before being returned.
    pub async fn try_become_master(&self) -> Result<bool> {
        let mut last_error = None;

        for attempt in 1..=MASTER_LOCK_ATTEMPTS {
            match self
                .store
                .set_nx(store_keys::PREEMPTION_LOCK, &self.node_id, self.lock_ttl)
                .await
            {
                Ok(acquired) => {
                    if acquired {
                        self.is_master.store(true, Ordering::Release);
                    }
                    return Ok(acquired);
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Master lock attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ClusterError::StoreUnavailable("master lock attempts exhausted".to_string())
        }))
    }

    /// Keep the lock alive.
    ///
    /// Returns `Ok(false)` once another node is seen holding the lock, in
    /// which case this node is demoted.
    pub async fn refresh(&self) -> Result<bool> {
        match self.current_master().await? {
            Some(holder) if holder == self.node_id => {
                if self
                    .store
                    .expire(store_keys::PREEMPTION_LOCK, self.lock_ttl)
                    .await?
                {
                    Ok(true)
                } else {
                    // Expired between GET and PEXPIRE
                    self.reassert().await
                }
            }
            Some(holder) => {
                tracing::warn!(holder = %holder, "Master lock taken over by another node");
                self.is_master.store(false, Ordering::Release);
                Ok(false)
            }
            None => self.reassert().await,
        }
    }

    async fn reassert(&self) -> Result<bool> {
        if self
            .store
            .set_nx(store_keys::PREEMPTION_LOCK, &self.node_id, self.lock_ttl)
            .await?
        {
            return Ok(true);
        }
        self.is_master.store(false, Ordering::Release);
        Ok(false)
    }

    /// One leadership tick: acquire when slave, refresh when master
    pub async fn tick(&self) -> ElectionOutcome {
        if self.is_master() {
            return match self.refresh().await {
                Ok(true) => ElectionOutcome::StillMaster,
                Ok(false) => ElectionOutcome::LostMaster,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to refresh master lock");
                    ElectionOutcome::StillMaster
                }
            };
        }

        match self.try_become_master().await {
            Ok(true) => ElectionOutcome::BecameMaster,
            Ok(false) => ElectionOutcome::Slave,
            Err(e) => {
                tracing::error!(error = %e, "Failed to acquire master lock");
                ElectionOutcome::Slave
            }
        }
    }

    /// Give up the lock if this node still holds it
    pub async fn release(&self) -> Result<()> {
        if !self.is_master.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if self.current_master().await?.as_deref() == Some(self.node_id.as_str()) {
            self.store.del(store_keys::PREEMPTION_LOCK).await?;
        }
        Ok(())
    }
}
