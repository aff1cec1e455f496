//! Hive server library.
//!
//! Provides a reusable serve function for the binary and for tests: builds
//! the cluster manager, wires the HTTP surface, and runs until the shutdown
//! token fires.

#![deny(missing_docs)]

mod health;
pub mod logger;
mod proxy;

use std::{net::SocketAddr, sync::Arc};

use axum::Router;
use cluster::ClusterManager;
use config::Config;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

/// Configuration for serving the proxy.
pub struct ServeConfig {
    /// The socket address the server binds to.
    pub listen_address: SocketAddr,
    /// The deserialized hive.toml configuration.
    pub config: Config,
    /// Cancellation token for graceful shutdown.
    pub shutdown_signal: CancellationToken,
    /// The version string to log on startup.
    pub version: String,
    /// Optional oneshot sender that receives the bound address, useful when
    /// port 0 was requested.
    pub bound_addr_sender: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
}

/// Starts and runs the proxy with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown_signal,
        version,
        bound_addr_sender,
    }: ServeConfig,
) -> anyhow::Result<()> {
    log::info!("Hive {version}");

    let manager = ClusterManager::new(config.clone());
    manager
        .initialize()
        .await
        .map_err(|error| anyhow::anyhow!("cluster initialization failed: {error}"))?;

    let mut app = Router::new().merge(proxy::router(Arc::clone(&manager), &config));

    if config.server.health.enabled {
        app = app.merge(health::router(&config.server.health.path, Arc::clone(&manager)));
    }

    // Trusted local boundary; cross-origin tooling may still hit the proxy.
    let app = app.layer(CorsLayer::permissive());

    let listener = TcpListener::bind(listen_address).await?;
    let bound_addr = listener.local_addr()?;

    if let Some(sender) = bound_addr_sender {
        let _ = sender.send(bound_addr);
    }

    log::info!("Listening on {bound_addr}");

    let shutdown = shutdown_signal.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    manager.shutdown().await;

    Ok(())
}
