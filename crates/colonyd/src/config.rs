//! Configuration management for colonyd.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use colony_common::constants::{self, DEFAULT_LISTEN_ADDR, DEFAULT_REDIS_URL};

/// Overrides coming from the command line
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub redis_url: Option<String>,
    pub listen_addr: Option<String>,
    pub node_id: Option<String>,
    pub store: Option<StoreBackend>,
}

/// Which coordination store to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared redis server (clustered deployments)
    Redis,
    /// In-process store (single node, development)
    Memory,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::Redis
    }
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Coordination store backend
    #[serde(default)]
    pub store: StoreBackend,

    /// Cluster coordination configuration
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Cluster coordination configuration.
///
/// Every interval is in milliseconds so that tests can run the full
/// protocol on a sub-second cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// This node's unique ID (generated at startup if not set)
    #[serde(default)]
    pub node_id: Option<String>,

    /// Port peers use to reach this node (0 = use the listen port)
    #[serde(default)]
    pub port: u16,

    /// Addresses advertised to peers. Empty = discover local non-loopback IPv4.
    #[serde(default)]
    pub advertise_ips: Vec<IpAddr>,

    #[serde(default = "default_master_locking_interval")]
    pub master_locking_interval_ms: u64,

    #[serde(default = "default_master_lock_expired_time")]
    pub master_lock_expired_time_ms: u64,

    #[serde(default = "default_master_gc_interval")]
    pub master_gc_interval_ms: u64,

    #[serde(default = "default_node_vote_interval")]
    pub node_vote_interval_ms: u64,

    #[serde(default = "default_update_node_status_interval")]
    pub update_node_status_interval_ms: u64,

    #[serde(default = "default_node_disconnected_timeout")]
    pub node_disconnected_timeout_ms: u64,

    #[serde(default = "default_plugin_scheduler_ticker_interval")]
    pub plugin_scheduler_ticker_interval_ms: u64,

    #[serde(default = "default_plugin_scheduler_interval")]
    pub plugin_scheduler_interval_ms: u64,

    #[serde(default = "default_plugin_deactivated_timeout")]
    pub plugin_deactivated_timeout_ms: u64,

    #[serde(default = "default_health_probe_timeout")]
    pub health_probe_timeout_ms: u64,

    #[serde(default = "default_vote_success_window")]
    pub vote_success_window_secs: u64,

    #[serde(default = "default_vote_failure_window")]
    pub vote_failure_window_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            port: 0,
            advertise_ips: Vec::new(),
            master_locking_interval_ms: default_master_locking_interval(),
            master_lock_expired_time_ms: default_master_lock_expired_time(),
            master_gc_interval_ms: default_master_gc_interval(),
            node_vote_interval_ms: default_node_vote_interval(),
            update_node_status_interval_ms: default_update_node_status_interval(),
            node_disconnected_timeout_ms: default_node_disconnected_timeout(),
            plugin_scheduler_ticker_interval_ms: default_plugin_scheduler_ticker_interval(),
            plugin_scheduler_interval_ms: default_plugin_scheduler_interval(),
            plugin_deactivated_timeout_ms: default_plugin_deactivated_timeout(),
            health_probe_timeout_ms: default_health_probe_timeout(),
            vote_success_window_secs: default_vote_success_window(),
            vote_failure_window_secs: default_vote_failure_window(),
        }
    }
}

impl ClusterConfig {
    pub fn master_locking_interval(&self) -> Duration {
        Duration::from_millis(self.master_locking_interval_ms)
    }

    pub fn master_lock_expired_time(&self) -> Duration {
        Duration::from_millis(self.master_lock_expired_time_ms)
    }

    pub fn master_gc_interval(&self) -> Duration {
        Duration::from_millis(self.master_gc_interval_ms)
    }

    pub fn node_vote_interval(&self) -> Duration {
        Duration::from_millis(self.node_vote_interval_ms)
    }

    pub fn update_node_status_interval(&self) -> Duration {
        Duration::from_millis(self.update_node_status_interval_ms)
    }

    pub fn plugin_scheduler_ticker_interval(&self) -> Duration {
        Duration::from_millis(self.plugin_scheduler_ticker_interval_ms)
    }

    pub fn plugin_scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.plugin_scheduler_interval_ms)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }

    /// Reject settings under which the protocol cannot work
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("master_locking_interval_ms", self.master_locking_interval_ms),
            ("master_lock_expired_time_ms", self.master_lock_expired_time_ms),
            ("master_gc_interval_ms", self.master_gc_interval_ms),
            ("node_vote_interval_ms", self.node_vote_interval_ms),
            ("update_node_status_interval_ms", self.update_node_status_interval_ms),
            ("plugin_scheduler_ticker_interval_ms", self.plugin_scheduler_ticker_interval_ms),
        ];
        for (name, value) in intervals {
            anyhow::ensure!(value > 0, "{name} must be greater than zero");
        }

        // The lock must outlive at least one refresh
        anyhow::ensure!(
            self.master_lock_expired_time_ms > self.master_locking_interval_ms,
            "master_lock_expired_time_ms must exceed master_locking_interval_ms"
        );
        // A live node must heartbeat before it is declared dead
        anyhow::ensure!(
            self.node_disconnected_timeout_ms > self.update_node_status_interval_ms,
            "node_disconnected_timeout_ms must exceed update_node_status_interval_ms"
        );
        anyhow::ensure!(
            self.plugin_deactivated_timeout_ms > self.plugin_scheduler_interval_ms,
            "plugin_deactivated_timeout_ms must exceed plugin_scheduler_interval_ms"
        );

        // Probes run inline on the coordinating task
        anyhow::ensure!(
            (1..=constants::HEALTH_PROBE_TIMEOUT_MS).contains(&self.health_probe_timeout_ms),
            "health_probe_timeout_ms must be between 1 and {}",
            constants::HEALTH_PROBE_TIMEOUT_MS
        );

        if let Some(ref id) = self.node_id {
            anyhow::ensure!(!id.is_empty(), "node_id must not be empty");
            // Node ids are embedded in store keys and scan patterns
            anyhow::ensure!(
                !id.contains(['*', '?', '[', ']', '\\', ':']),
                "node_id {id:?} must not contain glob characters or ':'"
            );
        }

        Ok(())
    }
}

// Default value functions
fn default_redis_url() -> String { DEFAULT_REDIS_URL.to_string() }
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_master_locking_interval() -> u64 { constants::MASTER_LOCKING_INTERVAL_MS }
fn default_master_lock_expired_time() -> u64 { constants::MASTER_LOCK_EXPIRED_TIME_MS }
fn default_master_gc_interval() -> u64 { constants::MASTER_GC_INTERVAL_MS }
fn default_node_vote_interval() -> u64 { constants::NODE_VOTE_INTERVAL_MS }
fn default_update_node_status_interval() -> u64 { constants::UPDATE_NODE_STATUS_INTERVAL_MS }
fn default_node_disconnected_timeout() -> u64 { constants::NODE_DISCONNECTED_TIMEOUT_MS }
fn default_plugin_scheduler_ticker_interval() -> u64 { constants::PLUGIN_SCHEDULER_TICKER_INTERVAL_MS }
fn default_plugin_scheduler_interval() -> u64 { constants::PLUGIN_SCHEDULER_INTERVAL_MS }
fn default_plugin_deactivated_timeout() -> u64 { constants::PLUGIN_DEACTIVATED_TIMEOUT_MS }
fn default_health_probe_timeout() -> u64 { constants::HEALTH_PROBE_TIMEOUT_MS }
fn default_vote_success_window() -> u64 { constants::VOTE_SUCCESS_WINDOW_SECS }
fn default_vote_failure_window() -> u64 { constants::VOTE_FAILURE_WINDOW_SECS }

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, overrides: &Overrides) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .add_source(config::Environment::with_prefix("COLONY").separator("__"))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            // Use defaults if config file doesn't exist
            tracing::warn!("Config file not found, using defaults");
            Self::default()
        };

        // Apply CLI overrides
        if let Some(ref redis_url) = overrides.redis_url {
            config.redis_url = redis_url.clone();
        }
        if let Some(ref listen) = overrides.listen_addr {
            config.listen_addr = listen.clone();
        }
        if let Some(ref node_id) = overrides.node_id {
            config.cluster.node_id = Some(node_id.clone());
        }
        if let Some(store) = overrides.store {
            config.store = store;
        }

        config.cluster.validate()?;

        Ok(config)
    }

    /// Port advertised to peers: explicit cluster port, else the listen port
    pub fn advertised_port(&self) -> Result<u16> {
        if self.cluster.port != 0 {
            return Ok(self.cluster.port);
        }
        let addr: SocketAddr = self
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address {}", self.listen_addr))?;
        Ok(addr.port())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            listen_addr: default_listen_addr(),
            store: StoreBackend::default(),
            cluster: ClusterConfig::default(),
        }
    }
}
