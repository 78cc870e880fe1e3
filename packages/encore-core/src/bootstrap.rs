//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where the
//! streaming service's collaborators are instantiated and wired together.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::auth::{Authenticator, JwtAuthenticator};
use crate::broker::publisher::{EventPublisher, PublisherConfig};
use crate::broker::{AmqpConnector, BrokerConnector};
use crate::catalog::SongCatalog;
use crate::config::{Config, StreamingConfig};
use crate::error::{EncoreError, EncoreResult};
use crate::runtime::TokioSpawner;
use crate::source::{AudioOpener, SourceFactory};

/// Timeout for object storage requests (seconds).
const OBJECT_STORAGE_TIMEOUT_SECS: u64 = 30;

/// Container for all bootstrapped services.
#[derive(Clone)]
pub struct BootstrappedServices {
    /// Song lookup.
    pub catalog: Arc<dyn SongCatalog>,
    /// Audio source selection.
    pub audio: Arc<dyn AudioOpener>,
    /// Bearer token validation.
    pub authenticator: Arc<dyn Authenticator>,
    /// Shared play event publisher.
    pub publisher: EventPublisher,
    /// Validated streaming settings.
    pub streaming: StreamingConfig,
    /// Shared HTTP client for connection pooling.
    http_client: Client,
    /// Task spawner for background operations.
    pub spawner: TokioSpawner,
    /// How long shutdown waits for pending play publishes.
    drain_timeout: Duration,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
}

impl BootstrappedServices {
    /// Returns the shared HTTP client.
    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Connects the publisher. A broker outage does not prevent startup.
    pub async fn start_background_tasks(&self) {
        self.publisher.start().await;
    }

    /// Builds the API state from these services.
    pub fn app_state(&self, allowed_origins: Vec<String>) -> EncoreResult<AppState> {
        AppState::builder()
            .catalog(Arc::clone(&self.catalog))
            .audio(Arc::clone(&self.audio))
            .authenticator(Arc::clone(&self.authenticator))
            .publisher(Arc::new(self.publisher.clone()))
            .spawner(self.spawner.clone())
            .streaming(self.streaming.clone())
            .allowed_origins(allowed_origins)
            .build()
    }

    /// Initiates graceful shutdown: stops the server, lets pending play
    /// publishes finish, then closes the broker link.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.cancel_token.cancel();

        let pending = self.spawner.in_flight();
        if pending > 0 {
            log::info!("[Bootstrap] Waiting for {} pending play events", pending);
            if !self.spawner.drain(self.drain_timeout).await {
                log::warn!(
                    "[Bootstrap] {} play events still pending after {:?}",
                    self.spawner.in_flight(),
                    self.drain_timeout
                );
            }
        }

        if let Err(e) = self.publisher.close().await {
            log::warn!("[Bootstrap] Broker link closed with errors: {}", e);
        }

        log::info!("[Bootstrap] Shutdown complete");
    }
}

fn create_http_client() -> EncoreResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(OBJECT_STORAGE_TIMEOUT_SECS))
        .build()
        .map_err(|e| EncoreError::Configuration(format!("failed to create HTTP client: {}", e)))
}

/// Bootstraps the streaming service against the configured AMQP broker.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn bootstrap_services(
    config: &Config,
    catalog: Arc<dyn SongCatalog>,
) -> EncoreResult<BootstrappedServices> {
    let connector = Arc::new(AmqpConnector::new(config.broker.url.clone()));
    bootstrap_services_with_connector(config, catalog, connector)
}

/// Bootstraps the streaming service with an explicit broker transport.
///
/// Must be called inside a Tokio runtime.
pub fn bootstrap_services_with_connector(
    config: &Config,
    catalog: Arc<dyn SongCatalog>,
    connector: Arc<dyn BrokerConnector>,
) -> EncoreResult<BootstrappedServices> {
    config.validate().map_err(EncoreError::Configuration)?;

    let spawner = TokioSpawner::current();
    let http_client = create_http_client()?;
    let cancel_token = CancellationToken::new();

    let audio: Arc<dyn AudioOpener> = Arc::new(SourceFactory::new(
        config.source.clone(),
        http_client.clone(),
    ));
    let authenticator: Arc<dyn Authenticator> =
        Arc::new(JwtAuthenticator::new(&config.auth.jwt_secret));

    let publisher = EventPublisher::new(
        connector,
        config.broker.topology(),
        PublisherConfig::from(&config.broker),
    );

    log::info!(
        "[Bootstrap] Services wired: source={}, exchange={}, threshold={}",
        config.source.kind,
        config.broker.exchange,
        config.streaming.play_threshold
    );

    Ok(BootstrappedServices {
        catalog,
        audio,
        authenticator,
        publisher,
        streaming: config.streaming.clone(),
        http_client,
        spawner,
        drain_timeout: config.broker.publish_timeout(),
        cancel_token,
    })
}
