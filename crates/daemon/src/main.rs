// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 OpenVPN Auth Bridge Contributors

// OpenVPN Auth Bridge - Daemon
// Connects to the OpenVPN management interface and decides client sessions

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use openvpn_auth_daemon::{DaemonConfig, ManagementClient, RejectAuthorizer};

#[derive(Parser)]
#[command(name = "openvpn-auth-daemon")]
#[command(about = "OpenVPN management interface client for OAuth2 authentication", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Management interface address (tcp://host:port or unix:///path)
    #[arg(long)]
    openvpn_addr: Option<String>,

    /// Log filter, e.g. "info" or "openvpn_auth_daemon=debug"
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.openvpn_addr {
        config.openvpn.addr = addr;
        config.validate().context("Invalid --openvpn-addr")?;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log.level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("OpenVPN Auth Bridge Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Management interface: {}", config.openvpn.addr);
    info!("Bypass common names: {}", config.openvpn.bypass.common_names.len());

    let client = ManagementClient::new(config.openvpn, Arc::new(RejectAuthorizer));

    let shutdown_client = client.clone();
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(()) => shutdown_client.shutdown(),
            Err(err) => error!("Signal handling failed: {:#}", err),
        }
    });

    client
        .connect()
        .await
        .context("OpenVPN management connection failed")?;

    info!("Daemon stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        };
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}
