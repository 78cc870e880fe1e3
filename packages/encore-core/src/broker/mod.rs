//! Message broker plumbing for play events.
//!
//! The publisher and consumer talk to the broker through two traits:
//!
//! - [`BrokerConnector`] opens a [`BrokerSession`] (a transport connection
//!   plus one channel on it).
//! - [`BrokerSession`] declares the topology, publishes, consumes and reports
//!   its own closure through [`BrokerSession::closed`].
//!
//! [`AmqpConnector`] is the production transport. [`MemoryBroker`] is an
//! in-process fanout broker with the same semantics for tests and local runs.

pub mod amqp;
pub mod consumer;
pub mod memory;
pub mod publisher;
mod topology;

pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;
pub use topology::Topology;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::watch;

use self::consumer::DeliveryOutcome;

/// Content type of every event payload.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Broker-side failures.
///
/// These never reach HTTP clients: publish failures are logged by the
/// responder, consumer failures lead to retries or redelivery.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("broker channel failed: {0}")]
    Channel(String),

    #[error("topology declaration failed: {0}")]
    Topology(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("delivery acknowledgement failed: {0}")]
    Acknowledge(String),

    /// The link was closed (shutdown or broker-side close).
    #[error("broker link is closed")]
    Closed,

    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// One or more errors while closing the channel and connection.
    #[error("errors while closing broker link: {}", .0.join("; "))]
    Close(Vec<String>),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// A message ready to be published.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub content_type: &'static str,
    pub message_id: String,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
}

/// Which half of the link signalled closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOrigin {
    Connection,
    Channel,
}

/// Close notification of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkClosed {
    pub origin: LinkOrigin,
    /// `None` for a graceful close requested by this process.
    pub reason: Option<String>,
}

impl LinkClosed {
    pub fn is_error(&self) -> bool {
        self.reason.is_some()
    }
}

/// A message delivered to a consumer, awaiting settlement.
#[async_trait]
pub trait InboundDelivery: Send {
    fn payload(&self) -> &[u8];

    /// True if the broker delivered this message before.
    fn redelivered(&self) -> bool;

    /// Acknowledges or negatively acknowledges the message.
    async fn settle(self: Box<Self>, outcome: DeliveryOutcome) -> BrokerResult<()>;
}

/// Stream of deliveries from one queue; ends when the session closes.
pub type DeliveryStream = BoxStream<'static, BrokerResult<Box<dyn InboundDelivery>>>;

/// One live connection + channel to the broker.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declares exchange, queue and binding. Idempotent.
    async fn declare_topology(&self, topology: &Topology) -> BrokerResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BrokerResult<()>;

    /// Starts a manual-acknowledgement consumer receiving one message at a time.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream>;

    /// True while both the connection and the channel are open.
    fn is_open(&self) -> bool;

    /// Resolves once the connection or the channel has closed.
    async fn closed(&self) -> LinkClosed;

    /// Closes the channel, then the connection.
    async fn close(&self) -> BrokerResult<()>;
}

/// Opens sessions to a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerSession>>;
}

/// First-close-wins notification shared by a session and its watchers.
#[derive(Clone)]
pub(crate) struct CloseSignal {
    tx: Arc<watch::Sender<Option<LinkClosed>>>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Records the closure. Later notifications are ignored.
    pub(crate) fn notify(&self, origin: LinkOrigin, reason: Option<String>) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(LinkClosed { origin, reason });
            true
        });
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub(crate) async fn closed(&self) -> LinkClosed {
        let mut rx = self.tx.subscribe();
        let fallback = LinkClosed {
            origin: LinkOrigin::Connection,
            reason: Some("close notifier dropped".to_string()),
        };
        let closed = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(fallback),
            Err(_) => fallback,
        };
        closed
    }
}
