use std::sync::Arc;

use cluster_tcp::{
    ClusterChannel, ClusterConfig, DirectoryDiscovery, InMemoryDiscovery, MemberDiscovery,
    NotificationChannel,
};
use meshcache::InvalidationCoordinator;
use shared::config::Config;
use storage_engine::{CacheKind, CacheRegistry, SwitchablePartition};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting MeshCache node");

    // Load environment variables from .env file (if exists)
    match dotenvy::dotenv() {
        Ok(_) => info!("Loaded environment variables from .env file"),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let config = Config::from_env();

    // With a discovery directory the node finds its peers through marker
    // files on a shared filesystem; without one it runs single-node.
    let discovery: Arc<dyn MemberDiscovery> = match &config.discovery_dir {
        Some(dir) => {
            info!("Using directory discovery at {}", dir);
            Arc::new(DirectoryDiscovery::new(dir))
        }
        None => {
            info!("No discovery directory configured, running standalone");
            Arc::new(InMemoryDiscovery::new())
        }
    };

    let resolver = Arc::new(SwitchablePartition::new());
    let registry = Arc::new(CacheRegistry::<Vec<u8>>::new(
        config.cache.clone(),
        resolver,
    ));
    for (name, kind) in [
        ("entities", CacheKind::Entity),
        ("collections", CacheKind::Collection),
        ("query-results", CacheKind::QueryResults),
        ("update-timestamps", CacheKind::Timestamps),
    ] {
        let mut settings = config.cache.clone();
        settings.max_size = config.max_size_for(name);
        registry.create_cache_with(name, kind, settings);
    }

    let channel = ClusterChannel::new(ClusterConfig::from_config(&config), discovery);
    let coordinator = InvalidationCoordinator::new(
        registry.clone(),
        Some(channel.clone() as Arc<dyn NotificationChannel>),
    );
    channel.register_listener(coordinator.clone()).await;

    let bound = channel.start().await?;
    info!("MeshCache node up on {}", bound);

    shutdown_signal().await;

    channel.stop().await;
    registry.clear();
    info!("MeshCache node shut down");
    Ok(())
}

// Graceful shutdown handler
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
