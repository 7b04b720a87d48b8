// src/main.rs
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use aeronyx_tunnel_server::utils::logging::{init_file_logging, init_logging};
use aeronyx_tunnel_server::{ServerArgs, ServerConfig, SystemNetwork, VpnServer};

#[cfg(unix)]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use aeronyx_tunnel_server::utils::system::{is_root, SetuidPrivileges};

    // Parse command line arguments
    let args = ServerArgs::parse();
    let config = ServerConfig::from_args(args).context("Invalid configuration")?;

    // Initialize logging; the guard flushes the log file on exit
    let _log_guard = match &config.log_file {
        Some(path) => Some(
            init_file_logging(&config.log_level, path)
                .with_context(|| format!("Failed to set up logging to {:?}", path))?,
        ),
        None => {
            init_logging(&config.log_level).context("Failed to set up logging")?;
            None
        }
    };

    info!("Starting AeroNyx tunnel server");
    info!("Server version: {}", env!("CARGO_PKG_VERSION"));

    let privileges = SetuidPrivileges::new().context("Failed to drop privileges")?;
    if !is_root() {
        info!("Running unprivileged as uid {}", privileges.real_uid());
    }
    privileges
        .probe()
        .context("Cannot raise privileges; run as root or install the binary setuid-root")?;

    if config.passcode().is_none() {
        warn!("No passcode configured; any client can obtain an address block");
    }

    let server = Arc::new(
        VpnServer::new(&config, SystemNetwork::new(), privileges)
            .context("Failed to initialize server")?,
    );
    info!(
        "Address pool holds {} blocks over {:?}",
        server.pool().capacity(),
        server.pool().ranges()
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;

    let shutdown = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        shutdown.close();
    });

    server.serve(listener).await.context("Server failed")?;
    info!("Shutdown complete");
    Ok(())
}

#[cfg(not(unix))]
fn main() -> anyhow::Result<()> {
    anyhow::bail!("The tunnel server needs a Unix host (setuid privileges and TUN devices)")
}
