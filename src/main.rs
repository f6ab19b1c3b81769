//! Tunnel Gateway
//!
//! An SSH server that authenticates clients against an external endpoint
//! and reverse-proxies their `direct-tcpip` channels to configured HTTP
//! backends, attaching a signed identity token to every request.

mod auth;
mod bridge;
mod config;
mod error;
mod gateway;
mod http_server;
mod listener;
mod route;
mod ssh;
mod stream;
mod telemetry;
mod token;
mod wire;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, Level};
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;
use crate::gateway::{Gateway, Keys};
use crate::token::TokenSigner;

/// Tunnel Gateway - HTTP backends reachable over SSH tunnels
#[derive(Parser, Debug)]
#[command(name = "tunnel-gateway", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/tunnel-gateway/gateway.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle --generate-config
    if cli.generate_config {
        let config = GatewayConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    // Load configuration
    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    config.validate().context("Invalid configuration")?;
    config.ensure_dirs()?;

    info!("Starting tunnel-gateway");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Backends: {}", config.allowed_backends.join(", "));
    info!(
        "  Authorization: {}",
        if config.no_auth {
            "disabled"
        } else {
            config.authorization_endpoint.as_str()
        }
    );

    let keys = Keys {
        host_key: ssh::load_or_generate_host_key(&config.host_key_path).await?,
        signer: Arc::new(TokenSigner::load(&config.signing_key_path)?),
    };

    let prometheus = match config.metrics_listen_addr {
        Some(_) => Some(telemetry::install()?),
        None => None,
    };

    let gateway = Gateway::start(&config, keys, prometheus).await?;
    let fatal = gateway.fatal();

    let failed = tokio::select! {
        _ = wait_for_signal() => false,
        _ = fatal.cancelled() => true,
    };

    gateway.shut_down().await;

    if failed {
        error!("Stopped after a fatal error");
        bail!("identity token signing failed");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut interrupt) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(terminate), Ok(interrupt)) => (terminate, interrupt),
            _ => {
                // Fall back to Ctrl-C only.
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    tokio::select! {
        _ = terminate.recv() => debug!("Received SIGTERM."),
        _ = interrupt.recv() => debug!("Received SIGINT."),
    };
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        debug!("Received Ctrl-C.");
    }
}
