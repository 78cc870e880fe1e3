//! Encore History - records song plays from the event queue.
//!
//! Consumes play events one at a time, appending each to the play journal,
//! and serves `GET /history` from that journal. Exits non-zero when the
//! broker is unreachable at startup past the retry budget.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use encore_core::{
    serve_history, AmqpConnector, EventConsumer, HistoryRecorder, HistoryState,
    JournalHistoryRecorder, JwtAuthenticator,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::config::HistoryConfig;

/// Encore History - play event consumer.
#[derive(Parser, Debug)]
#[command(name = "encore-history")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "ENCORE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Journal file (overrides config file).
    #[arg(short, long, value_name = "FILE")]
    journal: Option<PathBuf>,

    /// History API port (overrides config file).
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Encore History v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        HistoryConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(journal) = args.journal {
        config.journal_path = journal;
    }
    if let Some(port) = args.port {
        config.bind_port = port;
    }

    log::info!(
        "Configuration: port={}, queue={}, attempts={}, journal={}",
        config.bind_port,
        config.broker.queue,
        config.consumer.connect_attempts,
        config.journal_path.display()
    );

    let journal = Arc::new(
        JournalHistoryRecorder::open(&config.journal_path)
            .await
            .context("Failed to open play journal")?,
    );
    let recorder: Arc<dyn HistoryRecorder> = journal.clone();

    let addr = SocketAddr::new(config.bind_address, config.bind_port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let state = HistoryState {
        reader: journal,
        authenticator: Arc::new(JwtAuthenticator::new(&config.auth.jwt_secret)),
        allowed_origins: Arc::new(config.allowed_origins.clone()),
    };

    let consumer = EventConsumer::new(
        Arc::new(AmqpConnector::new(config.broker.url.clone())),
        config.broker.topology(),
        config.consumer.clone(),
    );

    let cancel = CancellationToken::new();
    let signal_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            log::info!("Shutdown signal received, finishing in-flight delivery...");
            cancel.cancel();
        })
    };

    let server_task = tokio::spawn(serve_history(listener, state, cancel.clone()));

    let result = consumer.run(cancel.clone(), recorder).await;
    signal_task.abort();

    // The API goes down with the consumer.
    cancel.cancel();
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("History API failed: {}", e),
        Err(e) => log::error!("History API task panicked: {}", e),
    }

    result.context("Event consumer stopped")?;

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
