//! Standalone server binary for the telephony-to-speech-service real-time
//! media bridge.
//!
//! Loads configuration, bootstraps the shared application state, serves
//! the `/media/{token}`, `/status`, and `/health` HTTP/WebSocket routes,
//! and shuts down gracefully on Ctrl+C or SIGTERM.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use bridge_core::{bootstrap_services, start_server};
use clap::Parser;
use tokio::signal;

/// Headless server for the telephony-to-speech-service real-time media bridge.
#[derive(Parser, Debug)]
#[command(name = "media-bridge-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "BRIDGE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file and environment).
    #[arg(short = 'p', long, env = "BRIDGE_BIND_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("media bridge server v{}", env!("CARGO_PKG_VERSION"));

    let mut core_config =
        config::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(port) = args.port {
        core_config.preferred_port = port;
    }

    let services = bootstrap_services(core_config).context("failed to bootstrap services")?;
    log::info!("services bootstrapped successfully");

    let app_state = services.app_state.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state).await {
            log::error!("server error: {e}");
        }
    });

    shutdown_signal().await;
    log::info!("shutdown signal received, cleaning up...");

    services.shutdown().await;
    server_handle.abort();

    log::info!("shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
