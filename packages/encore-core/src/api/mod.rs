//! HTTP API layer.
//!
//! Handlers stay thin: they authenticate, resolve the song through the
//! catalog and hand the bytes to the streaming responder. Router
//! construction and server startup live here as well.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::{Authenticator, Principal};
use crate::catalog::SongCatalog;
use crate::config::StreamingConfig;
use crate::error::{EncoreError, EncoreResult};
use crate::events::PlayEventPublisher;
use crate::runtime::TokioSpawner;
use crate::source::AudioOpener;

pub mod history;
pub mod http;
pub mod stream;

pub use history::{create_history_router, serve_history, HistoryState};
pub use http::create_router;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The server loop failed.
    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// This is a thin wrapper that holds references to services.
#[derive(Clone)]
pub struct AppState {
    /// Song key and metadata lookup.
    pub catalog: Arc<dyn SongCatalog>,
    /// Resolves storage keys into audio sources.
    pub audio: Arc<dyn AudioOpener>,
    /// Validates bearer tokens.
    pub authenticator: Arc<dyn Authenticator>,
    /// Sink for play events.
    pub publisher: Arc<dyn PlayEventPublisher>,
    /// Runs play-event publishes off the request path.
    pub spawner: TokioSpawner,
    /// Chunking, threshold and content type of audio bodies.
    pub streaming: Arc<StreamingConfig>,
    /// CORS origins; empty allows any origin without credentials.
    pub allowed_origins: Arc<Vec<String>>,
}

/// Builder for constructing an `AppState`.
#[derive(Default)]
pub struct AppStateBuilder {
    catalog: Option<Arc<dyn SongCatalog>>,
    audio: Option<Arc<dyn AudioOpener>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    publisher: Option<Arc<dyn PlayEventPublisher>>,
    spawner: Option<TokioSpawner>,
    streaming: Option<StreamingConfig>,
    allowed_origins: Vec<String>,
}

impl AppStateBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn catalog(mut self, catalog: Arc<dyn SongCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn audio(mut self, audio: Arc<dyn AudioOpener>) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn PlayEventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Sets the task spawner. Defaults to the current runtime.
    pub fn spawner(mut self, spawner: TokioSpawner) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Sets the streaming configuration. Defaults to [`StreamingConfig::default`].
    pub fn streaming(mut self, streaming: StreamingConfig) -> Self {
        self.streaming = Some(streaming);
        self
    }

    pub fn allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    /// Builds the `AppState`.
    ///
    /// Fails if a required collaborator is missing or the streaming
    /// configuration is invalid. Without an explicit spawner this must run
    /// inside a Tokio runtime.
    pub fn build(self) -> EncoreResult<AppState> {
        fn required<T>(value: Option<T>, name: &str) -> EncoreResult<T> {
            value.ok_or_else(|| EncoreError::Configuration(format!("{} is required", name)))
        }

        let streaming = self.streaming.unwrap_or_default();
        streaming.validate().map_err(EncoreError::Configuration)?;

        Ok(AppState {
            catalog: required(self.catalog, "catalog")?,
            audio: required(self.audio, "audio")?,
            authenticator: required(self.authenticator, "authenticator")?,
            publisher: required(self.publisher, "publisher")?,
            spawner: self.spawner.unwrap_or_else(TokioSpawner::current),
            streaming: Arc::new(streaming),
            allowed_origins: Arc::new(self.allowed_origins),
        })
    }
}

impl AppState {
    /// Creates a new builder for constructing an `AppState`.
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::new()
    }
}

/// The authenticated caller, extracted before the handler body runs.
///
/// Rejects with 401 when the bearer token is missing or invalid.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser(pub Principal);

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = EncoreError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        state.authenticator.authenticate(&parts.headers).map(Self)
    }
}

/// Serves the API on an already bound listener until `shutdown` fires.
///
/// In-flight responses are allowed to finish.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = http::create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    log::info!("[Server] Stopped");
    Ok(())
}

/// Binds `addr` and serves the API until `shutdown` fires.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let local = listener.local_addr().unwrap_or(addr);
    log::info!("Server listening on http://{}", local);
    serve(listener, state, shutdown).await
}
