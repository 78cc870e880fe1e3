//! In-process fanout broker.
//!
//! Mirrors the parts of AMQP the pipeline relies on: durable exchanges fan
//! out to bound queues, deliveries are manually acknowledged, a requeued
//! message is redelivered with the `redelivered` flag set, and publishing to
//! an undeclared exchange fails. Links can be severed from the outside to
//! exercise reconnect paths, and upcoming connects can be made to fail.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::consumer::DeliveryOutcome;
use super::{
    BrokerConnector, BrokerError, BrokerResult, BrokerSession, CloseSignal, DeliveryStream,
    InboundDelivery, LinkClosed, LinkOrigin, OutboundMessage, Topology,
};

#[derive(Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    message_id: Option<String>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
    acked: usize,
    discarded: usize,
}

#[derive(Default)]
struct BrokerState {
    /// Exchange name to bound queue names.
    bindings: HashMap<String, Vec<String>>,
    queues: HashMap<String, QueueState>,
    sessions: Vec<Arc<SessionLink>>,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, message: StoredMessage) -> BrokerResult<()> {
        let queues = self
            .bindings
            .get(exchange)
            .ok_or_else(|| BrokerError::Publish(format!("no exchange '{}'", exchange)))?
            .clone();
        for name in queues {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(message.clone());
                queue.notify.notify_one();
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    publish_delay: Mutex<Option<Duration>>,
}

/// Cloneable handle to one in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connection attempts so far, failed ones included.
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Makes the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Delays every publish by `delay`.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        *self.shared.publish_delay.lock() = delay;
    }

    /// Closes every open session with an error, as a broker restart would.
    pub fn sever_links(&self, reason: &str) {
        let sessions = std::mem::take(&mut self.shared.state.lock().sessions);
        for link in sessions {
            link.open.store(false, Ordering::SeqCst);
            link.signal
                .notify(LinkOrigin::Connection, Some(reason.to_string()));
        }
    }

    /// Number of currently open sessions.
    pub fn open_sessions(&self) -> usize {
        self.shared
            .state
            .lock()
            .sessions
            .iter()
            .filter(|s| s.open.load(Ordering::SeqCst))
            .count()
    }

    /// Publishes raw bytes to an exchange, bypassing any session.
    pub fn inject(&self, exchange: &str, payload: &[u8]) -> BrokerResult<()> {
        self.shared.state.lock().route(
            exchange,
            StoredMessage {
                payload: payload.to_vec(),
                message_id: None,
                redelivered: false,
            },
        )
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.shared.state.lock().bindings.contains_key(exchange)
    }

    /// Ready (unconsumed) messages in a queue.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.ready.len())
    }

    pub fn ready_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |q| q.ready.iter().map(|m| m.payload.clone()).collect())
    }

    pub fn ready_message_ids(&self, queue: &str) -> Vec<Option<String>> {
        self.with_queue(queue, |q| {
            q.ready.iter().map(|m| m.message_id.clone()).collect()
        })
    }

    pub fn acked(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.acked)
    }

    pub fn discarded(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.discarded)
    }

    fn with_queue<T: Default>(&self, queue: &str, f: impl FnOnce(&QueueState) -> T) -> T {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(f)
            .unwrap_or_default()
    }

    fn pop_ready(&self, queue: &str) -> Option<StoredMessage> {
        self.shared
            .state
            .lock()
            .queues
            .get_mut(queue)
            .and_then(|q| q.ready.pop_front())
    }

    fn settle(&self, queue: &str, mut message: StoredMessage, outcome: DeliveryOutcome) {
        let mut state = self.shared.state.lock();
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        match outcome {
            DeliveryOutcome::Accept => q.acked += 1,
            DeliveryOutcome::RejectDiscard => q.discarded += 1,
            DeliveryOutcome::RejectRequeue => {
                message.redelivered = true;
                q.ready.push_front(message);
                q.notify.notify_one();
            }
        }
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerSession>> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        let failing = self.shared.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.shared
                .failing_connects
                .store(failing - 1, Ordering::SeqCst);
            return Err(BrokerError::Connect("connection refused".to_string()));
        }

        let link = Arc::new(SessionLink {
            open: AtomicBool::new(true),
            signal: CloseSignal::new(),
        });
        self.shared.state.lock().sessions.push(link.clone());

        Ok(Arc::new(MemorySession {
            broker: self.clone(),
            link,
        }))
    }
}

struct SessionLink {
    open: AtomicBool,
    signal: CloseSignal,
}

struct MemorySession {
    broker: MemoryBroker,
    link: Arc<SessionLink>,
}

impl MemorySession {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.link.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Closed)
        }
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_topology(&self, topology: &Topology) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.shared.state.lock();
        state.queues.entry(topology.queue.clone()).or_default();
        let bound = state.bindings.entry(topology.exchange.clone()).or_default();
        if !bound.contains(&topology.queue) {
            bound.push(topology.queue.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        _routing_key: &str,
        message: OutboundMessage,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let delay = *self.broker.shared.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.ensure_open()?;
        }
        self.broker.shared.state.lock().route(
            exchange,
            StoredMessage {
                payload: message.payload,
                message_id: Some(message.message_id),
                redelivered: false,
            },
        )
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        self.ensure_open()?;
        let notify = self
            .broker
            .shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.notify.clone())
            .ok_or_else(|| BrokerError::Consume(format!("no queue '{}'", queue)))?;

        let broker = self.broker.clone();
        let link = self.link.clone();
        let queue = queue.to_string();

        let deliveries = futures::stream::unfold((), move |()| {
            let broker = broker.clone();
            let link = link.clone();
            let notify = notify.clone();
            let queue = queue.clone();
            async move {
                loop {
                    if !link.open.load(Ordering::SeqCst) {
                        return None;
                    }
                    if let Some(message) = broker.pop_ready(&queue) {
                        let delivery: Box<dyn InboundDelivery> = Box::new(MemoryDelivery {
                            broker: broker.clone(),
                            queue: queue.clone(),
                            message,
                        });
                        return Some((Ok(delivery), ()));
                    }
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = link.signal.closed() => return None,
                    }
                }
            }
        });
        Ok(deliveries.boxed())
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }

    async fn closed(&self) -> LinkClosed {
        self.link.signal.closed().await
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.link.open.swap(false, Ordering::SeqCst) {
            self.link.signal.notify(LinkOrigin::Connection, None);
            self.broker
                .shared
                .state
                .lock()
                .sessions
                .retain(|s| !Arc::ptr_eq(s, &self.link));
        }
        Ok(())
    }
}

struct MemoryDelivery {
    broker: MemoryBroker,
    queue: String,
    message: StoredMessage,
}

#[async_trait]
impl InboundDelivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    async fn settle(self: Box<Self>, outcome: DeliveryOutcome) -> BrokerResult<()> {
        let MemoryDelivery {
            broker,
            queue,
            message,
        } = *self;
        broker.settle(&queue, message, outcome);
        Ok(())
    }
}
