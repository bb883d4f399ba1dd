//! seqrpc - RPC server daemon
//!
//! Serves the built-in method set over the seqrpc protocol.

use seqrpc_protocol::CodecRegistry;
use seqrpc_server::{builtin, Config, Server};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if SEQRPC_CONFIG is set, then env overrides)
    let config_path = std::env::var("SEQRPC_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::from_env()
        }
    };

    let mut registry = CodecRegistry::default();
    if let Err(e) = config.validate(&registry) {
        tracing::error!("{}", e);
        return Err(e.into());
    }
    config.restrict_codecs(&mut registry);

    let server_config = config.server_config();
    let methods = builtin::methods();

    tracing::info!("Starting seqrpc server");
    tracing::info!("  Bind address: {}", server_config.bind_addr);
    tracing::info!("  Max connections: {}", server_config.max_connections);
    tracing::info!("  Codec: {}", config.rpc.codec_type);
    match server_config.handle_timeout {
        Some(timeout) => tracing::info!("  Handle timeout: {:?}", timeout),
        None => tracing::info!("  Handle timeout: disabled"),
    }
    tracing::info!("  Methods: {}", methods.names().join(", "));

    let server = Arc::new(Server::with_registry(server_config, registry, methods));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    let stats = server.stats();
    tracing::info!(
        "Server stopped ({} connections, {} requests, {} errors)",
        stats.connections_total.load(std::sync::atomic::Ordering::Relaxed),
        stats.requests_total.load(std::sync::atomic::Ordering::Relaxed),
        stats.errors_total.load(std::sync::atomic::Ordering::Relaxed)
    );
    Ok(())
}
