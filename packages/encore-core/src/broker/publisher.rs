//! Play event publisher with a reconnect supervisor.
//!
//! One publisher is shared by every request of the streaming service. The
//! broker link (session + "topology declared" flag) sits behind a
//! readers-writer lock:
//!
//! - publishes hold the read lock, so any number run in parallel;
//! - a publish that finds the link dead takes the write lock, re-checks, and
//!   reconnects. Concurrent publishes queue behind that single attempt;
//! - each successful connect arms a supervisor task that waits for the link's
//!   close notification and, on an error close, rebuilds the link in the
//!   background, pausing between failed attempts.
//!
//! A publish never fails because of a reconnect racing with it: it either
//! sees the old live link, or waits and sees the new one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;

use super::{
    BrokerConnector, BrokerError, BrokerResult, BrokerSession, OutboundMessage, Topology,
    JSON_CONTENT_TYPE,
};
use crate::config::BrokerConfig;
use crate::events::{PlayEvent, PlayEventPublisher};
use crate::utils::now_unix_secs;

/// Timing policy of the publisher.
#[derive(Debug, Clone, Copy)]
pub struct PublisherConfig {
    /// Upper bound for a single publish, reconnecting included.
    pub publish_timeout: Duration,
    /// Upper bound for each of connect and topology declaration.
    pub connect_timeout: Duration,
    /// Pause between failed supervisor reconnect attempts.
    pub reconnect_delay: Duration,
}

impl From<&BrokerConfig> for PublisherConfig {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            publish_timeout: config.publish_timeout(),
            connect_timeout: config.connect_timeout(),
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

#[derive(Default)]
struct BrokerLink {
    session: Option<Arc<dyn BrokerSession>>,
    topology_declared: bool,
    /// Bumped on every successful connect; a supervisor only acts on its own.
    generation: u64,
}

impl BrokerLink {
    fn is_live(&self) -> bool {
        self.topology_declared && self.session.as_ref().is_some_and(|s| s.is_open())
    }
}

struct PublisherInner {
    connector: Arc<dyn BrokerConnector>,
    topology: Topology,
    config: PublisherConfig,
    link: RwLock<BrokerLink>,
    shutdown: CancellationToken,
}

/// Shared, cloneable play event publisher.
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<PublisherInner>,
}

impl EventPublisher {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        topology: Topology,
        config: PublisherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                connector,
                topology,
                config,
                link: RwLock::new(BrokerLink::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Performs the initial connect.
    ///
    /// A failure is logged and not returned: the service starts anyway and
    /// the first publish retries the connection.
    pub async fn start(&self) {
        let mut link = self.inner.link.write().await;
        if link.is_live() {
            return;
        }
        if let Err(e) = self.inner.connect_locked(&mut link).await {
            log::warn!(
                "[Publisher] Initial broker connection failed: {}. Will retry on first publish",
                e
            );
        }
    }

    /// True while a declared, open link exists.
    ///
    /// Non-blocking: reports `false` while a reconnect holds the link.
    pub fn is_connected(&self) -> bool {
        self.inner
            .link
            .try_read()
            .map(|link| link.is_live())
            .unwrap_or(false)
    }

    /// Publishes one play event.
    ///
    /// Fails with [`BrokerError::Timeout`] when reconnecting and publishing
    /// together take longer than the publish timeout.
    pub async fn publish(&self, event: PlayEvent) -> BrokerResult<()> {
        let timeout = self.inner.config.publish_timeout;
        tokio::time::timeout(timeout, self.publish_within_deadline(event))
            .await
            .map_err(|_| BrokerError::Timeout(timeout))?
    }

    async fn publish_within_deadline(&self, event: PlayEvent) -> BrokerResult<()> {
        let timestamp = now_unix_secs();
        let message = OutboundMessage {
            payload: event.to_payload()?,
            content_type: JSON_CONTENT_TYPE,
            message_id: event.message_id(timestamp),
            timestamp,
        };

        let link = self.inner.live_link().await?;
        let session = link.session.as_ref().ok_or(BrokerError::Closed)?;

        let topology = &self.inner.topology;
        session
            .publish(&topology.exchange, &topology.routing_key, message)
            .await?;

        log::debug!(
            "[Publisher] Published play event: user={}, song={}",
            event.user_id,
            event.song_id
        );
        Ok(())
    }

    /// Stops the supervisor and closes the link (channel, then connection).
    ///
    /// Publishes after this fail with [`BrokerError::Closed`].
    pub async fn close(&self) -> BrokerResult<()> {
        self.inner.shutdown.cancel();
        let mut link = self.inner.link.write().await;
        link.topology_declared = false;
        match link.session.take() {
            Some(session) => {
                log::info!("[Publisher] Closing broker link");
                session.close().await
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PlayEventPublisher for EventPublisher {
    async fn publish(&self, event: PlayEvent) -> BrokerResult<()> {
        EventPublisher::publish(self, event).await
    }

    fn is_connected(&self) -> bool {
        EventPublisher::is_connected(self)
    }
}

impl PublisherInner {
    /// Returns a read guard on a live link, reconnecting first if needed.
    async fn live_link(self: &Arc<Self>) -> BrokerResult<RwLockReadGuard<'_, BrokerLink>> {
        {
            let link = self.link.read().await;
            if link.is_live() {
                return Ok(link);
            }
        }

        let mut link = self.link.write().await;
        if !link.is_live() {
            if self.shutdown.is_cancelled() {
                return Err(BrokerError::Closed);
            }
            self.connect_locked(&mut link).await?;
        }
        Ok(link.downgrade())
    }

    /// Replaces the link with a freshly connected and declared session.
    ///
    /// Caller holds the write lock.
    async fn connect_locked(self: &Arc<Self>, link: &mut BrokerLink) -> BrokerResult<()> {
        link.topology_declared = false;

        let limit = self.config.connect_timeout;

        log::info!("[Publisher] Connecting to broker");
        let session = tokio::time::timeout(limit, self.connector.connect())
            .await
            .map_err(|_| BrokerError::Timeout(limit))??;

        let declared = tokio::time::timeout(limit, session.declare_topology(&self.topology))
            .await
            .unwrap_or(Err(BrokerError::Timeout(limit)));
        if let Err(e) = declared {
            let _ = session.close().await;
            return Err(e);
        }

        let stale = link.session.replace(session.clone());
        link.topology_declared = true;
        link.generation += 1;

        log::info!(
            "[Publisher] Broker link ready (exchange '{}')",
            self.topology.exchange
        );
        self.spawn_supervisor(session, link.generation);

        if let Some(stale) = stale {
            if let Err(e) = stale.close().await {
                log::debug!("[Publisher] Closing stale broker link: {}", e);
            }
        }
        Ok(())
    }

    fn spawn_supervisor(self: &Arc<Self>, session: Arc<dyn BrokerSession>, generation: u64) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.supervise(session, generation).await });
    }

    async fn supervise(self: Arc<Self>, session: Arc<dyn BrokerSession>, generation: u64) {
        let closed = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            closed = session.closed() => closed,
        };
        drop(session);

        let Some(reason) = closed.reason else {
            log::debug!("[Publisher] Broker link closed gracefully");
            return;
        };
        log::warn!(
            "[Publisher] Broker {:?} closed: {}. Reconnecting",
            closed.origin,
            reason
        );

        loop {
            {
                let mut link = self.link.write().await;
                if self.shutdown.is_cancelled() || link.generation != generation {
                    // Shut down, or a publish already rebuilt the link.
                    return;
                }
                match self.connect_locked(&mut link).await {
                    Ok(()) => {
                        log::info!("[Publisher] Reconnected to broker");
                        return;
                    }
                    Err(e) => log::error!(
                        "[Publisher] Reconnect failed: {}. Retrying in {:?}",
                        e,
                        self.config.reconnect_delay
                    ),
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }
}
