//! Memory Match Game Server
//!
//! Loads configuration from the environment, opens the durable store and
//! serves WebSocket clients until Ctrl-C, then drains active games.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use memory_match::{
    network::{
        auth::{AuthConfig, JwtVerifier},
        server::{GameServer, ServerConfig, StoreLocation},
        session::SessionCache,
    },
    store::{FileStore, GameStore, MemoryStore},
    VERSION,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Memory Match Server v{}", VERSION);

    let config = ServerConfig::from_env().context("Invalid server configuration")?;
    let auth = AuthConfig::from_env();
    if !auth.is_configured() {
        bail!("No token verification key: set JWT_SECRET or AUTH_PUBLIC_KEY_PEM");
    }

    let store: Arc<dyn GameStore> = match &config.store {
        StoreLocation::Memory => {
            info!("using in-memory store; games will not survive a restart");
            Arc::new(MemoryStore::new())
        }
        StoreLocation::Dir(dir) => Arc::new(
            FileStore::open(dir)
                .await
                .with_context(|| format!("Failed to open store at {}", dir.display()))?,
        ),
    };

    let cache = Arc::new(SessionCache::new(config.cache.clone(), store));
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;

    let server = Arc::new(GameServer::new(config, cache, Arc::new(JwtVerifier::new(auth))));
    let serve_handle = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down...");
    server.shutdown();
    serve_handle
        .await
        .context("Server task panicked")?
        .context("Server failed")?;

    info!("Shutdown complete");
    Ok(())
}
