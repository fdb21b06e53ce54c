//! Meshgate - Meshtastic radio gateway
//!
//! This binary runs the gateway with:
//! - A device session driven through the helper process
//! - WebSocket fan-out of device events
//! - REST API for connection control, device queries and message history

use clap::Parser;
use meshgate_core::{Gateway, PersistenceGateway, ProcessDriver, RadioDriver};
use meshgate_server::{create_router, AppState, NodeConfig};
use meshgate_state::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "meshgate")]
#[command(about = "Meshtastic radio gateway with WebSocket and REST API")]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// HTTP bind host
    #[arg(long)]
    host: Option<String>,

    /// HTTP port
    #[arg(long, short)]
    port: Option<u16>,

    /// Database path
    #[arg(long)]
    db: Option<String>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(db) = args.db {
        config.server.database = db;
    }

    info!("Starting meshgate {}", meshgate_core::VERSION);

    let store = SqliteStore::new(&config.server.database).await?;
    info!("Database initialized: {}", config.server.database);

    let driver: Arc<dyn RadioDriver> = Arc::new(ProcessDriver::new(
        config.gateway.driver.clone(),
        config.gateway.session.connect_timeout,
    ));
    let store: Arc<dyn PersistenceGateway> = Arc::new(store);
    let gateway = Arc::new(Gateway::start(config.gateway.clone(), driver, Some(store)));

    if !gateway.auto_reconnect().await {
        info!("No device connected; waiting for /api/connect");
    }

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr()).await?;
    let addr = listener.local_addr()?;

    info!("═══════════════════════════════════════════════════════════");
    info!("  Gateway listening on http://{}", addr);
    info!("  WebSocket endpoint: ws://{}/ws", addr);
    info!("  REST API: http://{}/api/", addr);
    info!("═══════════════════════════════════════════════════════════");

    let app = create_router(Arc::new(AppState::new(gateway.clone())));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gateway.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
