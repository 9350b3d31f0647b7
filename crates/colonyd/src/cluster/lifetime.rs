//! The coordinating task of a cluster member.
//!
//! One task per [`Cluster`] multiplexes every timer and the new-node
//! subscription through a single `select!`. Handlers run inline, so a slow
//! round delays the following ticks instead of piling up.

use colony_common::NewNodeEvent;
use colony_common::constants::channels;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::election::ElectionOutcome;
use super::{Cluster, ClusterEvent};
use crate::store::Subscription;

/// Interval whose first tick is one period from now
fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl Cluster {
    pub(super) async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();

        tracing::info!(node_id = %self.id, port = self.port, "🌐 Cluster coordination started");

        let mut new_nodes = self.subscribe_new_nodes().await;
        self.heartbeat().await;
        self.announce().await;
        self.vote().await;

        let mut lock_tick = ticker(self.config.master_locking_interval());
        let mut heartbeat_tick = ticker(self.config.update_node_status_interval());
        let mut gc_tick = ticker(self.config.master_gc_interval());
        let mut vote_tick = ticker(self.config.node_vote_interval());
        let mut schedule_tick = ticker(self.config.plugin_scheduler_ticker_interval());

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = lock_tick.tick() => self.election_round().await,
                _ = heartbeat_tick.tick() => self.heartbeat().await,
                _ = gc_tick.tick(), if self.is_master() => self.master_gc().await,
                _ = vote_tick.tick() => self.vote().await,
                _ = schedule_tick.tick() => self.schedule().await,
                payload = new_nodes.next() => match payload {
                    Some(payload) => self.on_new_node(&payload).await,
                    None => {
                        tracing::warn!("New node subscription closed, resubscribing");
                        new_nodes = self.subscribe_new_nodes().await;
                    }
                },
            }
        }

        self.shutdown().await;
    }

    async fn subscribe_new_nodes(&self) -> Subscription {
        match self.store.subscribe(channels::NEW_NODE).await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!(error = %e, "Failed to subscribe to new node events");
                futures::stream::pending().boxed()
            }
        }
    }

    async fn election_round(&self) {
        match self.elector.tick().await {
            ElectionOutcome::BecameMaster => {
                tracing::info!(node_id = %self.id, "👑 Became cluster master");
                self.emit(ClusterEvent::BecameMaster);
            }
            ElectionOutcome::LostMaster => {
                tracing::warn!(node_id = %self.id, "Lost cluster master role");
                self.emit(ClusterEvent::LostMaster);
            }
            ElectionOutcome::StillMaster | ElectionOutcome::Slave => {}
        }
    }

    async fn heartbeat(&self) {
        if let Err(e) = self.nodes.update_node_status().await {
            tracing::error!(error = %e, "Failed to update node status");
        }
        self.emit(ClusterEvent::NodeUpdateCompleted);
    }

    async fn announce(&self) {
        let event = NewNodeEvent {
            node_id: self.id.clone(),
        };
        if let Err(e) = self.store.publish_json(channels::NEW_NODE, &event).await {
            tracing::warn!(error = %e, "Failed to announce node");
        }
    }

    async fn vote(&self) {
        match self.nodes.vote_addresses().await {
            Ok(voted) => tracing::debug!(voted, "Voting round finished"),
            Err(e) => tracing::warn!(error = %e, "Voting round failed"),
        }
        self.emit(ClusterEvent::VotingCompleted);
    }

    async fn schedule(&self) {
        let published = self.plugins.schedule_plugins().await;
        if published > 0 {
            tracing::debug!(published, "Plugin records refreshed");
        }
        self.emit(ClusterEvent::PluginScheduleCompleted);
    }

    async fn master_gc(&self) {
        self.emit(ClusterEvent::MasterGcStarted);

        match self.gc.auto_gc_nodes().await {
            Ok(0) => {}
            Ok(collected) => tracing::info!(collected, "🧹 Collected dead nodes"),
            Err(e) => tracing::warn!(error = %e, "Node garbage collection failed"),
        }
        match self.gc.auto_gc_plugins().await {
            Ok(0) => {}
            Ok(collected) => tracing::info!(collected, "🧹 Collected stale plugin records"),
            Err(e) => tracing::warn!(error = %e, "Plugin garbage collection failed"),
        }

        self.emit(ClusterEvent::MasterGcCompleted);
    }

    async fn on_new_node(&self, payload: &str) {
        let event = match serde_json::from_str::<NewNodeEvent>(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed new node event");
                return;
            }
        };
        if event.node_id == self.id {
            return;
        }

        tracing::info!(node_id = %event.node_id, "New node joined");
        if let Err(e) = self.nodes.refresh_members().await {
            tracing::warn!(error = %e, "Failed to refresh members");
        }
        self.vote().await;
    }

    async fn shutdown(&self) {
        if let Err(e) = self.elector.release().await {
            tracing::warn!(error = %e, "Failed to release master lock");
        }
        if let Err(e) = self.gc.gc_node(&self.id).await {
            tracing::warn!(error = %e, "Failed to deregister node");
        }

        tracing::info!(node_id = %self.id, "👋 Cluster coordination stopped");
        self.emit(ClusterEvent::ClusterStopped);
        self.stopped_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::{FakePlugin, spawn_health_server, test_config};
    use crate::cluster::{hashed_identity, plugin_state_key};
    use crate::routes::ApiError;
    use crate::store::{CoordinationStore, MemoryStore};
    use axum::Router;
    use axum::extract::{Request, State};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use colony_common::constants::store_keys;
    use colony_common::{NodeRecord, PluginRecord, now_millis};
    use std::future::Future;

    const PATIENCE: Duration = Duration::from_secs(5);

    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + PATIENCE;
        while Instant::now() < deadline {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn spawn_node(id: &str, store: &Arc<dyn CoordinationStore>) -> Arc<Cluster> {
        let (port, _server) = spawn_health_server().await;
        let config = crate::config::ClusterConfig {
            node_id: Some(id.to_string()),
            ..test_config()
        };
        let cluster = Cluster::new(config, port, store.clone());
        cluster.launch();
        cluster
    }

    fn leaders(nodes: &[Arc<Cluster>]) -> usize {
        nodes.iter().filter(|n| n.is_master()).count()
    }

    async fn node_record(store: &Arc<dyn CoordinationStore>, id: &str) -> Option<NodeRecord> {
        store
            .hget_json::<NodeRecord>(store_keys::CLUSTER_STATUS_HASH_MAP, id)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_exactly_one_leader_and_failover() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let nodes = vec![
            spawn_node("node-a", &store).await,
            spawn_node("node-b", &store).await,
            spawn_node("node-c", &store).await,
        ];

        let all = &nodes;
        assert!(eventually(move || async move { leaders(all) == 1 }).await);

        let leader = nodes.iter().find(|n| n.is_master()).unwrap().clone();
        let survivors: Vec<Arc<Cluster>> = nodes
            .iter()
            .filter(|n| n.id() != leader.id())
            .cloned()
            .collect();

        leader.close();
        leader.wait_stopped().await;
        assert!(node_record(&store, leader.id()).await.is_none());

        let survivors_ref = &survivors;
        assert!(eventually(move || async move { leaders(survivors_ref) == 1 }).await);

        // Leadership stays single once settled
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(leaders(&survivors), 1);
        assert!(node_record(&store, leader.id()).await.is_none());

        for node in &survivors {
            node.close();
            node.wait_stopped().await;
        }
    }

    #[tokio::test]
    async fn test_close_deregisters_node_and_plugins() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let cluster = spawn_node("node-a", &store).await;
        let mut events = cluster.subscribe_events();

        cluster
            .register_plugin(FakePlugin::new("acme/search:1.0.0"))
            .await
            .unwrap();
        let store_ref = &store;
        assert!(eventually(move || async move { node_record(store_ref, "node-a").await.is_some() }).await);

        cluster.close();
        cluster.close();
        cluster.wait_stopped().await;

        assert!(node_record(&store, "node-a").await.is_none());
        assert!(store.hgetall(store_keys::PLUGIN_STATE_MAP).await.unwrap().is_empty());
        assert!(cluster.local_plugins().await.is_empty());

        let mut stopped = false;
        while let Ok(event) = events.try_recv() {
            stopped |= event == ClusterEvent::ClusterStopped;
        }
        assert!(stopped);
    }

    #[tokio::test]
    async fn test_master_collects_dead_node() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());

        let dead = NodeRecord {
            addresses: vec![],
            last_ping_at: now_millis() - 60_000,
        };
        store
            .hset_json(store_keys::CLUSTER_STATUS_HASH_MAP, "node-dead", &dead)
            .await
            .unwrap();
        let key = plugin_state_key("node-dead", &hashed_identity("acme/search:1.0.0"));
        let record = PluginRecord {
            identity: "acme/search:1.0.0".to_string(),
            state: Default::default(),
            scheduled_at: Some(chrono::Utc::now()),
        };
        store
            .hset_json(store_keys::PLUGIN_STATE_MAP, &key, &record)
            .await
            .unwrap();

        let cluster = spawn_node("node-a", &store).await;

        let store_ref = &store;
        assert!(
            eventually(move || async move {
                node_record(store_ref, "node-dead").await.is_none()
                    && store_ref
                        .hgetall(store_keys::PLUGIN_STATE_MAP)
                        .await
                        .unwrap()
                        .is_empty()
            })
            .await
        );
        assert!(cluster.is_master());
        assert!(node_record(&store, "node-a").await.is_some());

        cluster.close();
        cluster.wait_stopped().await;
    }

    #[tokio::test]
    async fn test_registered_plugin_stays_fresh() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let cluster = spawn_node("node-a", &store).await;
        let plugin = FakePlugin::new("acme/search:1.0.0");

        cluster.register_plugin(plugin.clone()).await.unwrap();
        let first = plugin.last_scheduled_at().unwrap();

        let plugin_ref = &plugin;
        assert!(
            eventually(move || async move {
                plugin_ref.last_scheduled_at().is_some_and(|at| at > first)
            })
            .await
        );

        let hashed = hashed_identity("acme/search:1.0.0");
        let hashed = hashed.as_str();
        let cluster_ref = &cluster;
        assert!(
            eventually(move || async move {
                cluster_ref
                    .fetch_plugin_available_nodes_by_hashed_id(hashed)
                    .await
                    .unwrap()
                    == vec!["node-a".to_string()]
            })
            .await
        );

        plugin.stop().await;
        assert!(cluster.fetch_plugin_available_nodes("acme/search:1.0.0").await.unwrap().is_empty());

        cluster.close();
        cluster.wait_stopped().await;
    }

    async fn forward_to_b(State(cluster): State<Arc<Cluster>>, request: Request) -> Response {
        match cluster.redirect_request("node-b", request).await {
            Ok(response) => response.into_response(),
            Err(e) => ApiError(e).into_response(),
        }
    }

    /// Launch a node whose HTTP server is built from its own cluster handle
    async fn serve_node(
        id: &str,
        store: &Arc<dyn CoordinationStore>,
        app: impl FnOnce(Arc<Cluster>) -> Router,
    ) -> (Arc<Cluster>, u16) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cluster = Cluster::new(
            crate::config::ClusterConfig {
                node_id: Some(id.to_string()),
                ..test_config()
            },
            port,
            store.clone(),
        );
        let app = app(cluster.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        cluster.launch();
        (cluster, port)
    }

    /// Node B answering `/plugin/echo` with "ok"
    async fn serve_echo_node(store: &Arc<dyn CoordinationStore>) -> Arc<Cluster> {
        let (b, _) = serve_node("node-b", store, |_| {
            crate::routes::probe_routes().route("/plugin/echo", get(|| async { "ok" }))
        })
        .await;
        b
    }

    async fn call_through(a: &Arc<Cluster>, a_port: u16) -> (reqwest::StatusCode, String) {
        assert!(eventually(move || async move { a.nodes().await.contains_key("node-b") }).await);

        let response = reqwest::get(format!("http://127.0.0.1:{a_port}/plugin/echo"))
            .await
            .unwrap();
        (response.status(), response.text().await.unwrap())
    }

    #[tokio::test]
    async fn test_request_redirected_between_nodes() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let b = serve_echo_node(&store).await;
        let (a, a_port) = serve_node("node-a", &store, |cluster| {
            Router::new()
                .route("/plugin/echo", get(forward_to_b))
                .with_state(cluster)
        })
        .await;

        let (status, body) = call_through(&a, a_port).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(body, "ok");

        a.close();
        b.close();
        a.wait_stopped().await;
        b.wait_stopped().await;
    }

    #[tokio::test]
    async fn test_request_redirected_from_nested_route() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let b = serve_echo_node(&store).await;
        let (a, a_port) = serve_node("node-a", &store, |cluster| {
            Router::new().nest(
                "/plugin",
                Router::new()
                    .route("/echo", get(forward_to_b))
                    .with_state(cluster),
            )
        })
        .await;

        let (status, body) = call_through(&a, a_port).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(body, "ok");

        a.close();
        b.close();
        a.wait_stopped().await;
        b.wait_stopped().await;
    }

    #[tokio::test]
    async fn test_killed_leader_replaced_once_lock_expires() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let config = test_config();

        // Run the tasks directly so that one can be aborted mid-flight,
        // skipping the lock release of a graceful close
        let mut nodes = Vec::new();
        let mut tasks = Vec::new();
        for id in ["node-a", "node-b", "node-c"] {
            let (port, _server) = spawn_health_server().await;
            let cluster = Cluster::new(
                crate::config::ClusterConfig {
                    node_id: Some(id.to_string()),
                    ..test_config()
                },
                port,
                store.clone(),
            );
            cluster.launched.store(true, std::sync::atomic::Ordering::SeqCst);
            tasks.push(tokio::spawn(cluster.clone().run()));
            nodes.push(cluster);
        }

        let all = &nodes;
        assert!(eventually(move || async move { leaders(all) == 1 }).await);

        let killed = nodes.iter().position(|n| n.is_master()).unwrap();
        tasks[killed].abort();
        assert!((&mut tasks[killed]).await.unwrap_err().is_cancelled());
        let killed_at = Instant::now();
        let killed_id = nodes[killed].id().to_string();

        // Nobody released the lock
        assert_eq!(nodes[0].master_id().await.unwrap(), Some(killed_id.clone()));

        let survivors: Vec<Arc<Cluster>> = nodes
            .iter()
            .filter(|n| n.id() != killed_id)
            .cloned()
            .collect();
        let survivors_ref = &survivors;
        assert!(eventually(move || async move { leaders(survivors_ref) == 1 }).await);

        let bound = config.master_lock_expired_time()
            + config.master_locking_interval()
            + Duration::from_millis(500);
        assert!(
            killed_at.elapsed() <= bound,
            "took {:?}, expected at most {bound:?}",
            killed_at.elapsed()
        );

        let leader = survivors.iter().find(|n| n.is_master()).unwrap();
        assert_eq!(leader.master_id().await.unwrap().as_deref(), Some(leader.id()));

        // The new leader collects the dead node's record
        let store_ref = &store;
        let killed_ref = killed_id.as_str();
        assert!(eventually(move || async move { node_record(store_ref, killed_ref).await.is_none() }).await);

        for node in &survivors {
            node.close();
            node.wait_stopped().await;
        }
    }

    #[tokio::test]
    async fn test_close_before_launch_returns_immediately() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let cluster = Cluster::new(test_config(), 5002, store);

        cluster.close();
        tokio::time::timeout(Duration::from_millis(100), cluster.wait_stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_launch_after_close_is_ignored() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let cluster = Cluster::new(test_config(), 5002, store.clone());
        let mut events = cluster.subscribe_events();

        cluster.close();
        cluster.wait_stopped().await;
        cluster.launch();

        // Long enough for a started task to heartbeat and stop again
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(store.hgetall(store_keys::CLUSTER_STATUS_HASH_MAP).await.unwrap().is_empty());
        assert!(matches!(
            events.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }
}
