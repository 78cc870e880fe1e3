//! Encore Core - shared library for the Encore media backend.
//!
//! This crate delivers audio byte-ranges to authenticated clients over HTTP
//! and carries "song played" facts to the history service through a message
//! broker. It is used by both the streaming server and the history consumer.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`range`]: HTTP `Range` header resolution
//! - [`source`]: Seekable audio byte sources (local files, object storage)
//! - [`catalog`]: Song lookup (storage key and metadata)
//! - [`auth`]: Bearer token validation into an authenticated principal
//! - [`events`]: The play event and its publishing seam
//! - [`broker`]: Broker topology, transports, publisher and consumer
//! - [`api`]: HTTP routers, the range-aware streaming responder and the history API
//! - [`bootstrap`]: Composition root wiring services together
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! Collaborators outside the delivery pipeline are consumed through traits so
//! that the core logic can be exercised without real infrastructure:
//!
//! - [`SongCatalog`](catalog::SongCatalog): Song key and metadata lookup
//! - [`Authenticator`](auth::Authenticator): Request principal resolution
//! - [`PlayEventPublisher`](events::PlayEventPublisher): Play-event sink
//! - [`BrokerConnector`](broker::BrokerConnector): Broker transport
//! - [`HistoryRecorder`](broker::consumer::HistoryRecorder): History store
//! - [`HistoryReader`](broker::consumer::HistoryReader): History lookup

#![warn(clippy::all)]

pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod broker;
pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod range;
pub mod runtime;
pub mod source;
pub mod utils;

// Re-export commonly used types at the crate root
pub use auth::{Authenticator, JwtAuthenticator, Principal};
pub use broker::consumer::{
    classify_delivery, DeliveryOutcome, EventConsumer, HistoryEntry, HistoryError, HistoryReader,
    HistoryRecorder, JournalHistoryRecorder, MemoryHistory,
};
pub use broker::publisher::{EventPublisher, PublisherConfig};
pub use broker::{
    AmqpConnector, BrokerConnector, BrokerError, BrokerResult, BrokerSession, MemoryBroker,
    Topology,
};
pub use catalog::{CatalogError, SongCatalog, SongInfo, StaticCatalog};
pub use config::{
    AuthConfig, BrokerConfig, Config, ConsumerConfig, SourceConfig, StreamingConfig,
};
pub use error::{EncoreError, EncoreResult};
pub use events::{PlayEvent, PlayEventPublisher};
pub use range::{parse_range, ByteRange};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use source::{AudioOpener, AudioReader, AudioSource, SourceError, SourceFactory, SourceKind};
pub use utils::{now_unix_secs, split_list};

// Re-export bootstrap types
pub use bootstrap::{bootstrap_services, bootstrap_services_with_connector, BootstrappedServices};

// Re-export API types
pub use api::{
    create_history_router, create_router, serve, serve_history, start_server, AppState,
    AppStateBuilder, HistoryState, ServerError,
};
