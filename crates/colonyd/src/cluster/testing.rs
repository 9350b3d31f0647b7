//! Test doubles shared by the cluster tests.

use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, Utc};
use colony_common::PluginRuntimeState;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use super::plugin::{PluginLifetime, PluginSupervisor, StopHook};
use crate::config::ClusterConfig;

/// Cluster timings scaled down so that whole protocols run in milliseconds
pub fn test_config() -> ClusterConfig {
    ClusterConfig {
        advertise_ips: vec!["127.0.0.1".parse().unwrap()],
        master_locking_interval_ms: 50,
        master_lock_expired_time_ms: 300,
        master_gc_interval_ms: 200,
        node_vote_interval_ms: 500,
        update_node_status_interval_ms: 100,
        node_disconnected_timeout_ms: 600,
        plugin_scheduler_ticker_interval_ms: 50,
        plugin_scheduler_interval_ms: 200,
        plugin_deactivated_timeout_ms: 1_000,
        health_probe_timeout_ms: 500,
        ..Default::default()
    }
}

/// Serve the routes peers probe on a random local port
pub async fn spawn_health_server() -> (u16, JoinHandle<()>) {
    spawn_router(crate::routes::probe_routes()).await
}

pub async fn spawn_router(app: Router) -> (u16, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, handle)
}

/// Plugin lifetime controlled by the test
pub struct FakePlugin {
    identity: String,
    stopped: AtomicBool,
    hooks: Mutex<Vec<StopHook>>,
    scheduled_at: Mutex<Option<DateTime<Utc>>>,
}

impl FakePlugin {
    pub fn new(identity: &str) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.to_string(),
            stopped: AtomicBool::new(false),
            hooks: Mutex::new(Vec::new()),
            scheduled_at: Mutex::new(None),
        })
    }

    /// Mark stopped and run the hooks registered so far
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let hooks: Vec<StopHook> = self.hooks.lock().unwrap().drain(..).collect();
        for hook in hooks {
            hook().await;
        }
    }

    pub fn last_scheduled_at(&self) -> Option<DateTime<Utc>> {
        *self.scheduled_at.lock().unwrap()
    }
}

impl PluginLifetime for FakePlugin {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn on_stop(&self, hook: StopHook) {
        self.hooks.lock().unwrap().push(hook);
    }

    fn runtime_state(&self) -> PluginRuntimeState {
        PluginRuntimeState {
            status: if self.stopped() { "stopped" } else { "active" }.to_string(),
            ..Default::default()
        }
    }

    fn update_scheduled_at(&self, at: DateTime<Utc>) {
        *self.scheduled_at.lock().unwrap() = Some(at);
    }
}

/// Supervisor reporting a fixed set of installed plugins
pub struct FakeSupervisor {
    installed: HashSet<String>,
}

impl FakeSupervisor {
    pub fn with(identities: &[&str]) -> Self {
        Self {
            installed: identities.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl PluginSupervisor for FakeSupervisor {
    async fn is_plugin_installed(&self, identity: &str) -> bool {
        self.installed.contains(identity)
    }
}
