//! cairn proxy daemon
//!
//! Runs the proxy manager standalone:
//! - Loads listener/server/module records from the panel data file
//! - Starts a handshake-routed instance per enabled listener
//! - Routes servers and modules to their containers' addresses
//! - Periodically rebuilds every route to correct drift

use std::sync::Arc;

use anyhow::{Context, Result};
use cairn_proxy::config::Config;
use cairn_proxy::{DockerResolver, JsonStore, PanelStore, ProxyManager};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to CAIRN_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting cairn proxy");
    info!(
        data_file = %config.data_file.display(),
        docker_network = %config.docker_network,
        bind_host = %config.bind_host,
        proxy_ports = %format!("{}-{}", config.proxy_port_min, config.proxy_port_max),
        refresh_interval_secs = config.refresh_interval.map(|d| d.as_secs()).unwrap_or(0),
        "Configuration loaded"
    );

    let store: Arc<dyn PanelStore> = Arc::new(
        JsonStore::open(&config.data_file)
            .await
            .with_context(|| format!("Failed to open {}", config.data_file.display()))?,
    );
    let resolver = Arc::new(DockerResolver::connect().context("Failed to connect to Docker")?);

    let manager = Arc::new(ProxyManager::new(
        config.manager_config(),
        Arc::clone(&store),
        resolver,
    ));
    manager.start().await.context("Failed to start proxy manager")?;

    if let Some(interval) = config.refresh_interval {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Routes were just built by start()
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = manager.refresh_routes().await {
                    warn!(error = %e, "Route refresh failed");
                }
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    manager.stop().await;
    Ok(())
}
