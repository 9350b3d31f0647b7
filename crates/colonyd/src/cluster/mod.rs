//! Cluster coordination.
//!
//! Implements:
//! - Master election over a TTL'd store lock (`election`)
//! - Heartbeats and membership (`node`) with address voting (`vote`)
//! - Plugin location records (`plugin`)
//! - Master-only garbage collection (`gc`)
//! - Cross-node request forwarding (`redirect`)
//!
//! A [`Cluster`] owns all of the above and drives them from a single task
//! (see `lifetime`). Several clusters can share one store in one process.

mod election;
mod gc;
mod lifetime;
mod node;
mod plugin;
mod redirect;
mod vote;

#[cfg(test)]
pub(crate) mod testing;

pub use election::{ElectionOutcome, MasterElector};
pub use gc::GarbageCollector;
pub use node::{NodeRegistry, sort_addresses};
pub use plugin::{
    PluginLifetime, PluginRegistry, PluginSupervisor, StopHook, hashed_identity, plugin_state_key,
};
pub use redirect::{RedirectedResponse, RequestRedirector};

use axum::extract::Request;
use colony_common::{NodeRecord, NodeRole, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::config::ClusterConfig;
use crate::store::CoordinationStore;

/// Capacity of the event channel
const EVENT_CAPACITY: usize = 64;

/// Signals fired by the coordinating task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterEvent {
    BecameMaster,
    LostMaster,
    VotingCompleted,
    NodeUpdateCompleted,
    PluginScheduleCompleted,
    MasterGcStarted,
    MasterGcCompleted,
    /// The node deregistered and the task exited
    ClusterStopped,
}

/// Generate a random node identifier
pub fn generate_node_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("node-{:016x}", rng.random::<u64>())
}

/// One member of the cluster
pub struct Cluster {
    id: String,
    port: u16,
    config: ClusterConfig,
    store: Arc<dyn CoordinationStore>,

    elector: MasterElector,
    nodes: Arc<NodeRegistry>,
    plugins: Arc<PluginRegistry>,
    gc: GarbageCollector,
    redirector: RequestRedirector,

    events: broadcast::Sender<ClusterEvent>,
    stop_tx: watch::Sender<bool>,
    stopped_tx: watch::Sender<bool>,
    launched: AtomicBool,
    stopping: AtomicBool,
}

impl Cluster {
    /// Create a cluster member reachable by peers on `port`
    pub fn new(config: ClusterConfig, port: u16, store: Arc<dyn CoordinationStore>) -> Arc<Self> {
        Self::build(config, port, store, None)
    }

    /// Same as [`Cluster::new`], with a supervisor answering
    /// [`Cluster::is_plugin_on_current_node`] for plugins not hosted yet
    pub fn with_supervisor(
        config: ClusterConfig,
        port: u16,
        store: Arc<dyn CoordinationStore>,
        supervisor: Arc<dyn PluginSupervisor>,
    ) -> Arc<Self> {
        Self::build(config, port, store, Some(supervisor))
    }

    fn build(
        config: ClusterConfig,
        port: u16,
        store: Arc<dyn CoordinationStore>,
        supervisor: Option<Arc<dyn PluginSupervisor>>,
    ) -> Arc<Self> {
        let id = config.node_id.clone().unwrap_or_else(generate_node_id);

        let elector = MasterElector::new(id.clone(), store.clone(), config.master_lock_expired_time());
        let nodes = Arc::new(NodeRegistry::new(id.clone(), port, &config, store.clone()));
        let plugins = Arc::new(PluginRegistry::new(
            id.clone(),
            store.clone(),
            nodes.clone(),
            supervisor,
            config.plugin_scheduler_interval(),
        ));
        let gc = GarbageCollector::new(
            nodes.clone(),
            plugins.clone(),
            config.plugin_deactivated_timeout_ms,
        );
        let redirector = RequestRedirector::new(nodes.clone());

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stop_tx, _) = watch::channel(false);
        let (stopped_tx, _) = watch::channel(false);

        Arc::new(Self {
            id,
            port,
            config,
            store,
            elector,
            nodes,
            plugins,
            gc,
            redirector,
            events,
            stop_tx,
            stopped_tx,
            launched: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_master(&self) -> bool {
        self.elector.is_master()
    }

    pub fn role(&self) -> NodeRole {
        if self.is_master() {
            NodeRole::Master
        } else {
            NodeRole::Slave
        }
    }

    /// Node id currently holding the master lock
    pub async fn master_id(&self) -> Result<Option<String>> {
        self.elector.current_master().await
    }

    /// Start the coordinating task. Only the first call has an effect, and
    /// none once [`close`](Self::close) was called.
    pub fn launch(self: &Arc<Self>) {
        if self.launched.swap(true, Ordering::SeqCst) {
            tracing::warn!(node_id = %self.id, "Cluster already launched");
            return;
        }
        if self.stopping.load(Ordering::SeqCst) {
            tracing::warn!(node_id = %self.id, "Cluster closed before launch");
            self.stopped_tx.send_replace(true);
            return;
        }

        let cluster = self.clone();
        tokio::spawn(async move {
            cluster.run().await;
        });
    }

    /// Ask the coordinating task to stop. Idempotent.
    pub fn close(&self) {
        if self
            .stopping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tracing::info!(node_id = %self.id, "Stopping cluster");
        self.stop_tx.send_replace(true);

        // Never launched: nothing will deregister, report stopped now
        if !self.launched.load(Ordering::SeqCst) {
            self.stopped_tx.send_replace(true);
        }
    }

    /// Resolve once the coordinating task has deregistered this node
    pub async fn wait_stopped(&self) {
        let mut stopped = self.stopped_tx.subscribe();
        // Err means the sender is gone, which cannot outlive self
        let _ = stopped.wait_for(|done| *done).await;
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ClusterEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Live members as of the last heartbeat
    pub async fn nodes(&self) -> HashMap<String, NodeRecord> {
        self.nodes.members().await
    }

    pub async fn is_node_alive(&self, node_id: &str) -> Result<bool> {
        self.nodes.is_node_alive(node_id).await
    }

    pub async fn register_plugin(&self, lifetime: Arc<dyn PluginLifetime>) -> Result<()> {
        self.plugins.register_plugin(lifetime).await
    }

    pub async fn local_plugins(&self) -> Vec<String> {
        self.plugins.local_plugins().await
    }

    pub async fn fetch_plugin_available_nodes(&self, identity: &str) -> Result<Vec<String>> {
        self.plugins.fetch_plugin_available_nodes(identity).await
    }

    pub async fn fetch_plugin_available_nodes_by_hashed_id(&self, hashed_id: &str) -> Result<Vec<String>> {
        self.plugins
            .fetch_plugin_available_nodes_by_hashed_id(hashed_id)
            .await
    }

    pub async fn is_plugin_on_current_node(&self, identity: &str) -> bool {
        self.plugins.is_plugin_on_current_node(identity).await
    }

    pub async fn redirect_request(&self, node_id: &str, request: Request) -> Result<RedirectedResponse> {
        self.redirector.redirect_request(node_id, request).await
    }

    pub async fn redirect_request_with_timeout(
        &self,
        node_id: &str,
        request: Request,
        timeout: Duration,
    ) -> Result<RedirectedResponse> {
        self.redirector
            .redirect_request_with_timeout(node_id, request, timeout)
            .await
    }
}
