//! Garbage collection of dead nodes and stale plugin records.
//!
//! Runs on the master only. Deletes are idempotent, so two masters
//! overlapping during a failover do no harm.

use chrono::Utc;
use colony_common::{ClusterError, Result, now_millis};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::node::NodeRegistry;
use super::plugin::{PluginRegistry, split_plugin_state_key};

/// Holds a round flag for the duration of one sweep
struct RoundGuard<'a>(&'a AtomicBool);

impl<'a> RoundGuard<'a> {
    fn try_enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct GarbageCollector {
    nodes: Arc<NodeRegistry>,
    plugins: Arc<PluginRegistry>,
    plugin_deactivated_timeout_ms: u64,
    gc_nodes_running: AtomicBool,
    gc_plugins_running: AtomicBool,
}

impl GarbageCollector {
    pub fn new(
        nodes: Arc<NodeRegistry>,
        plugins: Arc<PluginRegistry>,
        plugin_deactivated_timeout_ms: u64,
    ) -> Self {
        Self {
            nodes,
            plugins,
            plugin_deactivated_timeout_ms,
            gc_nodes_running: AtomicBool::new(false),
            gc_plugins_running: AtomicBool::new(false),
        }
    }

    /// Collect every node past the disconnect timeout. Returns the number
    /// of nodes removed; a round already in progress makes this a no-op.
    pub async fn auto_gc_nodes(&self) -> Result<usize> {
        let Some(_round) = RoundGuard::try_enter(&self.gc_nodes_running) else {
            tracing::debug!("Node GC already running, skipping");
            return Ok(0);
        };

        let records = self.nodes.all_records().await?;
        let now = now_millis();
        let mut errors = Vec::new();
        let mut collected = 0;

        for (node_id, record) in records {
            if !self.nodes.is_stale(&record, now) {
                continue;
            }
            match self.gc_node(&node_id).await {
                Ok(()) => collected += 1,
                Err(e) => errors.push(e),
            }
        }

        finish(collected, errors)
    }

    /// Collect every plugin record not refreshed within the deactivation
    /// timeout. Undecodable records are removed as well.
    pub async fn auto_gc_plugins(&self) -> Result<usize> {
        let Some(_round) = RoundGuard::try_enter(&self.gc_plugins_running) else {
            tracing::debug!("Plugin GC already running, skipping");
            return Ok(0);
        };

        let records = self.plugins.all_records().await?;
        let now = Utc::now();
        let mut errors = Vec::new();
        let mut collected = 0;

        for (key, record) in records {
            if let Some(ref record) = record {
                if record.is_active(self.plugin_deactivated_timeout_ms, now) {
                    continue;
                }
                if let Ok((node_id, _)) = split_plugin_state_key(&key) {
                    if let Err(e) = self.plugins.force_gc_node_plugin(node_id, &record.identity).await {
                        errors.push(e);
                        continue;
                    }
                }
            }

            match self.plugins.remove_plugin_state_by_key(&key).await {
                Ok(_) => {
                    tracing::info!(key = %key, "Collected stale plugin record");
                    collected += 1;
                }
                Err(e) => errors.push(e),
            }
        }

        finish(collected, errors)
    }

    /// Remove a node with all its plugin records.
    ///
    /// Also used by a node to deregister itself on close.
    pub async fn gc_node(&self, node_id: &str) -> Result<()> {
        let plugins = self.plugins.force_gc_node_plugins(node_id).await?;
        self.nodes.forget(node_id).await;
        self.nodes.remove_record(node_id).await?;

        tracing::info!(node_id = %node_id, plugins, "Collected node");
        Ok(())
    }
}

fn finish(collected: usize, errors: Vec<ClusterError>) -> Result<usize> {
    if errors.is_empty() {
        Ok(collected)
    } else {
        Err(ClusterError::PartialGc(errors))
    }
}
