use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use colonyd::config::{AppConfig, Overrides, StoreBackend};
use colonyd::routes;
use colonyd::state::AppState;

/// Colony daemon - cluster coordination for plugin-hosting nodes
#[derive(Parser, Debug)]
#[command(name = "colonyd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/colonyd.toml")]
    config: String,

    /// Redis URL (overrides config)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Node ID (overrides config, generated if unset)
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// Coordination store backend (overrides config)
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            redis_url: self.redis_url.clone(),
            listen_addr: self.listen.clone(),
            node_id: self.node_id.clone(),
            store: self.store,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Pick up a local .env before clap reads the environment
    let _ = dotenvy::dotenv();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("🔥 Starting colonyd v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args.overrides())?;
    info!("📋 Configuration loaded from {}", args.config);

    // Initialize application state
    let state = AppState::new(config.clone()).await?;
    info!(store = ?config.store, "✅ Coordination store connected");

    let cluster = state.cluster.clone();
    info!(node_id = %cluster.id(), port = cluster.port(), "🪪 Node identity");

    // Build router
    let app = routes::create_router(state);

    // Start server before joining, peers probe us right away
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("🚀 colonyd listening on {}", config.listen_addr);

    cluster.launch();

    // Handle graceful shutdown
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("🛑 Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    // Leave the cluster: release the master lock and drop our records
    cluster.close();
    cluster.wait_stopped().await;

    info!("👋 colonyd shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
