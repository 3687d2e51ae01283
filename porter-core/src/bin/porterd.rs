//! Porter service binary

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use porter_core::config::PorterConfig;
use porter_core::coordinator::{ensure_node, CoordinatorGateway, CoordinatorSpace, CreateMode};
use porter_core::error::PorterError;
use porter_core::lock::{LockStore, MemoryLockStore};
use porter_core::node::{
    Follower, FOLLOWER_ROOT_PATH, READERS_PATH, RULES_PATH, WRITERS_PATH,
};
use porter_core::sinks::SinkPool;
use porter_core::sync::EmptyFilter;

#[derive(Parser)]
#[command(name = "porterd", about = "Change-data synchronization fabric")]
struct Args {
    /// Config file path
    #[arg(short = 'f', long = "config", default_value = "config.yaml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    info!("Starting Porter");

    let config = match PorterConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    // Single-node deployments coordinate in-process; a fleet points the
    // gateway at the external coordinator service instead
    let space = CoordinatorSpace::new();
    let gateway: Arc<dyn CoordinatorGateway> = Arc::new(space.session());
    seed_namespace(gateway.as_ref(), &config).await?;

    let lock_store: Arc<dyn LockStore> = MemoryLockStore::new();
    let sinks = Arc::new(SinkPool::new());
    let root = CancellationToken::new();
    let follower = Follower::new(
        &root,
        gateway,
        lock_store,
        sinks,
        Arc::new(EmptyFilter),
        config.pool_size,
    );

    // Start metrics API server
    let metrics_listen = config.metrics_listen.clone();
    tokio::spawn(async move {
        let app = Router::new()
            .route(
                "/metrics",
                get(|| async { porter_core::metrics::gather_system_metrics() }),
            )
            .layer(CorsLayer::permissive());

        let addr: SocketAddr = match metrics_listen.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Invalid metrics listen address {}: {}", metrics_listen, e);
                return;
            }
        };
        info!("Metrics API listening on {}", addr);

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Metrics server bind failed: {}", e);
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Metrics server error: {}", e);
        }
    });

    // Ctrl-C tears the follower down gracefully
    let stopper = follower.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            stopper.stop().await;
        }
    });

    follower.run().await?;
    info!("Porter stopped");

    Ok(())
}

/// Creates the porter paths and seeds rules, writers, and the reader
/// catalog from the config file
async fn seed_namespace(
    gateway: &dyn CoordinatorGateway,
    config: &PorterConfig,
) -> porter_core::Result<()> {
    ensure_node(gateway, "/porter", CreateMode::Persistent).await?;
    for path in [FOLLOWER_ROOT_PATH, RULES_PATH, WRITERS_PATH, READERS_PATH] {
        ensure_node(gateway, path, CreateMode::Persistent).await?;
    }

    let rules = serde_json::to_vec(&config.rules).map_err(|e| PorterError::Decode {
        message: format!("rules: {e}"),
    })?;
    gateway.set(RULES_PATH, rules).await?;

    let writers = serde_json::to_vec(&config.writers).map_err(|e| PorterError::Decode {
        message: format!("writers: {e}"),
    })?;
    gateway.set(WRITERS_PATH, writers).await?;

    let readers = serde_json::to_vec(&config.readers).map_err(|e| PorterError::Decode {
        message: format!("readers: {e}"),
    })?;
    gateway.set(READERS_PATH, readers).await?;

    Ok(())
}
