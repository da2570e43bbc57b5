//! Sync Gateway
//!
//! Serves the file sync API over HTTP until interrupted.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};

use sync_gateway::logging::{self, LogSettings};
use sync_gateway::{ApiServer, Gateway, GatewayConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Sync Gateway - file synchronization and sharing over pluggable storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; defaults apply when omitted
    #[arg(short, long, env = "SYNC_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address, overrides server.addr
    #[arg(long, env = "SYNC_GATEWAY_ADDR")]
    addr: Option<String>,

    /// Registry node id, overrides registry.node_id
    #[arg(long, env = "SYNC_GATEWAY_NODE_ID")]
    node_id: Option<String>,

    /// Registry role, overrides registry.role
    #[arg(long, env = "SYNC_GATEWAY_ROLE")]
    role: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SYNC_GATEWAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "SYNC_GATEWAY_LOG_JSON")]
    log_json: bool,

    /// Write the application log to this file instead of stdout
    #[arg(long, env = "SYNC_GATEWAY_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Write the HTTP access log to its own file
    #[arg(long, env = "SYNC_GATEWAY_ACCESS_LOG_FILE")]
    access_log_file: Option<PathBuf>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::init(&LogSettings {
        level: args.log_level.clone(),
        json: args.log_json,
        file: args.log_file.clone(),
        access_file: args.access_log_file.clone(),
    })
    .context("failed to initialize logging")?;

    let config = load_config(&args)?;

    info!("Starting Sync Gateway");
    info!("  Version: {}", sync_gateway::VERSION);
    info!("  REST API: {}", config.server.addr);
    info!("  Shutdown timeout: {}s", config.server.shutdown_timeout_secs);
    info!("  Backends: {}", config.backends.len());
    info!("  Staging: {}", config.chunks.staging_dir.display());

    let gateway = Gateway::build(config)
        .await
        .context("failed to initialize gateway")?;

    if gateway.tokens.users().is_empty() {
        warn!("No users configured; every login will be rejected");
    }

    gateway
        .register_self()
        .context("failed to register in node registry")?;

    for (backend, healthy) in gateway.facade.health_check().await {
        if !healthy {
            warn!(backend = %backend, "Backend failed its startup health check");
        }
    }

    let server = ApiServer::new(
        gateway.server_config().context("invalid server settings")?,
        gateway.app_state(),
    );
    let shutdown = server.shutdown_handle();
    let background = gateway.spawn_background(&shutdown);

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
        let _ = signal_shutdown.send(());
    });

    let result = server.run().await;
    let _ = shutdown.send(());
    for handle in background {
        let _ = handle.await;
    }

    if let Err(e) = gateway.registry.unregister(&gateway.config().registry.node_id) {
        warn!("Failed to unregister: {}", e);
    }

    result.context("REST server failed")?;
    info!("Gateway shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => GatewayConfig::from_yaml("{}").context("invalid default configuration")?,
    };

    if let Some(addr) = &args.addr {
        config.server.addr = addr.clone();
    }
    if let Some(node_id) = &args.node_id {
        config.registry.node_id = node_id.clone();
    }
    if let Some(role) = &args.role {
        config.registry.role = role.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}
