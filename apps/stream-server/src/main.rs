//! Encore Stream - HTTP audio streaming service.
//!
//! Serves song audio with byte-range support to authenticated listeners and
//! publishes a play event to the broker once enough of a track was delivered.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use encore_core::{bootstrap_services, start_server, StaticCatalog};
use tokio::signal;

use crate::config::ServerConfig;

/// Encore Stream - range-aware audio delivery with play tracking.
#[derive(Parser, Debug)]
#[command(name = "encore-stream")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "ENCORE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "ENCORE_BIND_PORT")]
    port: Option<u16>,

    /// Song manifest (overrides config file).
    #[arg(long, value_name = "FILE")]
    catalog: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Encore Stream v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(catalog) = args.catalog {
        config.catalog_path = catalog;
    }

    log::info!(
        "Configuration: bind={}:{}, source={}, origins={}",
        config.bind_address,
        config.bind_port,
        config.source.kind,
        config.allowed_origins.join(",")
    );

    let catalog = StaticCatalog::load(&config.catalog_path).with_context(|| {
        format!(
            "Failed to load song catalog: {}",
            config.catalog_path.display()
        )
    })?;
    log::info!("Catalog loaded: {} songs", catalog.len());

    let core_config = config.to_core_config();
    let services = bootstrap_services(&core_config, Arc::new(catalog))
        .context("Failed to bootstrap services")?;

    // A broker outage here is logged; publishes reconnect on demand.
    services.start_background_tasks().await;

    let app_state = services
        .app_state(config.allowed_origins.clone())
        .context("Failed to build application state")?;

    let addr = SocketAddr::new(config.bind_address, config.bind_port);
    let mut server_handle = tokio::spawn(start_server(
        app_state,
        addr,
        services.cancel_token.clone(),
    ));

    let server_result = tokio::select! {
        _ = shutdown_signal() => {
            log::info!("Shutdown signal received, cleaning up...");
            services.cancel_token.cancel();
            (&mut server_handle).await
        }
        result = &mut server_handle => {
            log::error!("HTTP server exited unexpectedly");
            result
        }
    };

    services.shutdown().await;

    server_result
        .context("HTTP server task panicked")?
        .context("HTTP server failed")?;

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
