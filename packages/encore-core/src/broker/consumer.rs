//! Play event consumer for the history service.
//!
//! Deliveries are processed one at a time with manual acknowledgement:
//!
//! | payload / store result | outcome                               |
//! |------------------------|---------------------------------------|
//! | malformed JSON         | reject, discard (poison message)      |
//! | store failure          | reject, requeue (transient; retried)  |
//! | stored                 | acknowledge                           |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::{BrokerConnector, BrokerError, BrokerResult, BrokerSession, Topology};
use crate::config::ConsumerConfig;
use crate::events::PlayEvent;
use crate::utils::now_unix_secs;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history store unavailable: {0}")]
    Unavailable(String),

    #[error("history I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persists "user played song" facts.
#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    async fn record(&self, user_id: u64, song_id: u64) -> Result<(), HistoryError>;
}

/// One play of a user's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub song_id: u64,
    /// Unix seconds.
    pub played_at: u64,
}

/// Reads back what a [`HistoryRecorder`] stored.
#[async_trait]
pub trait HistoryReader: Send + Sync {
    /// The user's last `limit` plays, newest first.
    async fn recent(&self, user_id: u64, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError>;
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Accept,
    RejectRequeue,
    RejectDiscard,
}

impl DeliveryOutcome {
    pub const fn requeue(&self) -> bool {
        matches!(self, Self::RejectRequeue)
    }
}

/// Decodes a payload and records it, deciding how the delivery is settled.
pub async fn classify_delivery(payload: &[u8], recorder: &dyn HistoryRecorder) -> DeliveryOutcome {
    let event = match PlayEvent::from_payload(payload) {
        Ok(event) => event,
        Err(e) => {
            log::error!(
                "[Consumer] Discarding malformed event ({} bytes): {}",
                payload.len(),
                e
            );
            return DeliveryOutcome::RejectDiscard;
        }
    };

    match recorder.record(event.user_id, event.song_id).await {
        Ok(()) => {
            log::info!(
                "[Consumer] Recorded play: user={}, song={}",
                event.user_id,
                event.song_id
            );
            DeliveryOutcome::Accept
        }
        Err(e) => {
            log::error!(
                "[Consumer] Failed to record play (user={}, song={}): {}. Requeueing",
                event.user_id,
                event.song_id,
                e
            );
            DeliveryOutcome::RejectRequeue
        }
    }
}

/// Long-running consumer of the play event queue.
pub struct EventConsumer {
    connector: Arc<dyn BrokerConnector>,
    topology: Topology,
    config: ConsumerConfig,
}

impl EventConsumer {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        topology: Topology,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            connector,
            topology,
            config,
        }
    }

    /// Consumes until `cancel` fires.
    ///
    /// The first connect retries `connect_attempts` times; running out of
    /// attempts is the only error returned. Once a link has been
    /// established, a lost link is re-established without an attempt limit.
    /// On cancellation the in-flight delivery is settled before the link is
    /// closed.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        recorder: Arc<dyn HistoryRecorder>,
    ) -> BrokerResult<()> {
        let mut budget = Some(self.config.connect_attempts.max(1));
        loop {
            let Some(session) = self.connect_with_retry(&cancel, budget).await? else {
                return Ok(());
            };
            budget = None;

            let result = self.consume(session.as_ref(), &cancel, recorder.as_ref()).await;

            if let Err(e) = session.close().await {
                log::warn!("[Consumer] Error closing broker link: {}", e);
            }

            match result {
                Ok(()) => {
                    log::info!("[Consumer] Stopped");
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "[Consumer] Consumption interrupted: {}. Reconnecting in {:?}",
                        e,
                        self.config.connect_retry_delay()
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.connect_retry_delay()) => {}
                    }
                }
            }
        }
    }

    /// Connects, retrying up to `attempts` times (forever when `None`).
    ///
    /// Returns `None` when cancelled while waiting between attempts.
    async fn connect_with_retry(
        &self,
        cancel: &CancellationToken,
        attempts: Option<u32>,
    ) -> BrokerResult<Option<Arc<dyn BrokerSession>>> {
        let delay = self.config.connect_retry_delay();

        let mut attempt: u32 = 1;
        loop {
            match self.connector.connect().await {
                Ok(session) => {
                    log::info!("[Consumer] Connected to broker");
                    return Ok(Some(session));
                }
                Err(e) => match attempts {
                    Some(limit) if attempt >= limit => {
                        log::error!(
                            "[Consumer] Giving up after {} connection attempts: {}",
                            limit,
                            e
                        );
                        return Err(e);
                    }
                    Some(limit) => log::warn!(
                        "[Consumer] Broker not ready (attempt {}/{}): {}. Retrying in {:?}",
                        attempt,
                        limit,
                        e,
                        delay
                    ),
                    None => log::warn!(
                        "[Consumer] Reconnect attempt {} failed: {}. Retrying in {:?}",
                        attempt,
                        e,
                        delay
                    ),
                },
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Returns `Ok` on cancellation, `Err` when the link breaks.
    async fn consume(
        &self,
        session: &dyn BrokerSession,
        cancel: &CancellationToken,
        recorder: &dyn HistoryRecorder,
    ) -> BrokerResult<()> {
        session.declare_topology(&self.topology).await?;
        let mut deliveries = session
            .consume(&self.topology.queue, &self.config.consumer_tag)
            .await?;

        log::info!(
            "[Consumer] Waiting for play events on queue '{}'",
            self.topology.queue
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(e),
                None => return Err(BrokerError::Closed),
            };

            if delivery.redelivered() {
                log::debug!("[Consumer] Processing redelivered message");
            }
            let outcome = classify_delivery(delivery.payload(), recorder).await;
            if let Err(e) = delivery.settle(outcome).await {
                log::error!("[Consumer] Failed to settle delivery ({:?}): {}", outcome, e);
            }
        }
    }
}

/// In-memory recorder; failures can be injected.
#[derive(Default)]
pub struct MemoryHistory {
    plays: Mutex<Vec<PlayEvent>>,
    failures_left: Mutex<usize>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` records fail.
    pub fn fail_next(&self, n: usize) {
        *self.failures_left.lock() = n;
    }

    pub fn plays(&self) -> Vec<PlayEvent> {
        self.plays.lock().clone()
    }
}

#[async_trait]
impl HistoryRecorder for MemoryHistory {
    async fn record(&self, user_id: u64, song_id: u64) -> Result<(), HistoryError> {
        {
            let mut failures = self.failures_left.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(HistoryError::Unavailable("injected failure".to_string()));
            }
        }
        self.plays.lock().push(PlayEvent::new(user_id, song_id));
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct JournalEntry {
    user_id: u64,
    song_id: u64,
    played_at: u64,
}

/// Appends one JSON line per play to a journal file.
pub struct JournalHistoryRecorder {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JournalHistoryRecorder {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        log::info!("[History] Journal at {}", path.display());
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistoryRecorder for JournalHistoryRecorder {
    async fn record(&self, user_id: u64, song_id: u64) -> Result<(), HistoryError> {
        let entry = JournalEntry {
            user_id,
            song_id,
            played_at: now_unix_secs(),
        };
        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| HistoryError::Unavailable(e.to_string()))?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryReader for JournalHistoryRecorder {
    async fn recent(&self, user_id: u64, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError> {
        // Holding the writer lock keeps half-written lines out of the read.
        let content = {
            let _writer = self.file.lock().await;
            tokio::fs::read_to_string(&self.path).await?
        };

        let mut entries: Vec<HistoryEntry> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    log::warn!("[History] Skipping unreadable journal line: {}", e);
                    None
                }
            })
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| HistoryEntry {
                song_id: entry.song_id,
                played_at: entry.played_at,
            })
            .collect();

        // Journal order is play order; equal timestamps keep it.
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use std::time::Duration;

    const EXCHANGE: &str = "song_events";
    const QUEUE: &str = "song_events_queue";

    fn consumer(broker: &MemoryBroker, attempts: u32) -> EventConsumer {
        EventConsumer::new(
            Arc::new(broker.clone()),
            Topology::default(),
            ConsumerConfig {
                connect_attempts: attempts,
                connect_retry_delay_secs: 3,
                consumer_tag: "test".to_string(),
            },
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..5000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn classify_accepts_recorded_event() {
        let history = MemoryHistory::new();
        let outcome = classify_delivery(br#"{"user_id":5,"song_id":42}"#, &history).await;
        assert_eq!(outcome, DeliveryOutcome::Accept);
        assert_eq!(history.plays(), vec![PlayEvent::new(5, 42)]);
    }

    #[tokio::test]
    async fn classify_discards_malformed_payload() {
        let history = MemoryHistory::new();
        let outcome = classify_delivery(b"{not json", &history).await;
        assert_eq!(outcome, DeliveryOutcome::RejectDiscard);
        assert!(!outcome.requeue());
        assert!(history.plays().is_empty());
    }

    #[tokio::test]
    async fn classify_requeues_on_store_failure() {
        let history = MemoryHistory::new();
        history.fail_next(1);
        let outcome = classify_delivery(br#"{"user_id":5,"song_id":42}"#, &history).await;
        assert_eq!(outcome, DeliveryOutcome::RejectRequeue);
        assert!(outcome.requeue());
    }

    #[tokio::test]
    async fn run_records_discards_and_retries() {
        let broker = MemoryBroker::new();
        let history = Arc::new(MemoryHistory::new());
        history.fail_next(1);

        let cancel = CancellationToken::new();
        let consumer = consumer(&broker, 3);
        let task = {
            let cancel = cancel.clone();
            let history: Arc<dyn HistoryRecorder> = history.clone();
            tokio::spawn(async move { consumer.run(cancel, history).await })
        };

        wait_until(|| broker.has_exchange(EXCHANGE)).await;
        broker.inject(EXCHANGE, b"garbage").unwrap();
        broker.inject(EXCHANGE, br#"{"user_id":5,"song_id":42}"#).unwrap();

        wait_until(|| broker.acked(QUEUE) == 1).await;
        assert_eq!(broker.discarded(QUEUE), 1);
        // Failed once, then redelivered and stored exactly once.
        assert_eq!(history.plays(), vec![PlayEvent::new(5, 42)]);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_connect_attempts_are_fatal() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(100);
        let history: Arc<dyn HistoryRecorder> = Arc::new(MemoryHistory::new());

        let result = consumer(&broker, 4)
            .run(CancellationToken::new(), history)
            .await;

        assert!(matches!(result, Err(BrokerError::Connect(_))));
        assert_eq!(broker.connect_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_waits_for_late_broker() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let history = Arc::new(MemoryHistory::new());
        let cancel = CancellationToken::new();

        let consumer = consumer(&broker, 10);
        let task = {
            let cancel = cancel.clone();
            let history: Arc<dyn HistoryRecorder> = history.clone();
            tokio::spawn(async move { consumer.run(cancel, history).await })
        };

        wait_until(|| broker.has_exchange(EXCHANGE)).await;
        assert_eq!(broker.connect_count(), 3);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lost_link_is_reestablished() {
        let broker = MemoryBroker::new();
        let history = Arc::new(MemoryHistory::new());
        let cancel = CancellationToken::new();

        let consumer = consumer(&broker, 10);
        let task = {
            let cancel = cancel.clone();
            let history: Arc<dyn HistoryRecorder> = history.clone();
            tokio::spawn(async move { consumer.run(cancel, history).await })
        };

        wait_until(|| broker.open_sessions() == 1).await;
        broker.sever_links("node down");
        wait_until(|| broker.connect_count() == 2 && broker.open_sessions() == 1).await;

        broker.inject(EXCHANGE, br#"{"user_id":1,"song_id":2}"#).unwrap();
        wait_until(|| broker.acked(QUEUE) == 1).await;
        assert_eq!(history.plays(), vec![PlayEvent::new(1, 2)]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn outage_after_first_link_outlasts_attempt_budget() {
        let broker = MemoryBroker::new();
        let history = Arc::new(MemoryHistory::new());
        let cancel = CancellationToken::new();

        let consumer = consumer(&broker, 3);
        let task = {
            let cancel = cancel.clone();
            let history: Arc<dyn HistoryRecorder> = history.clone();
            tokio::spawn(async move { consumer.run(cancel, history).await })
        };

        wait_until(|| broker.open_sessions() == 1).await;
        broker.fail_next_connects(11);
        broker.sever_links("broker down");

        // One initial connect, eleven refused, then back.
        wait_until(|| broker.connect_count() == 13 && broker.open_sessions() == 1).await;
        assert!(!task.is_finished());

        broker.inject(EXCHANGE, br#"{"user_id":4,"song_id":8}"#).unwrap();
        wait_until(|| broker.acked(QUEUE) == 1).await;
        assert_eq!(history.plays(), vec![PlayEvent::new(4, 8)]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn journal_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history").join("plays.jsonl");
        let journal = JournalHistoryRecorder::open(&path).await.unwrap();

        journal.record(5, 42).await.unwrap();
        journal.record(6, 43).await.unwrap();

        let content = std::fs::read_to_string(journal.path()).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["user_id"], 5);
        assert_eq!(lines[1]["song_id"], 43);
        assert!(lines[0]["played_at"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn journal_returns_users_latest_plays_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalHistoryRecorder::open(dir.path().join("plays/history.jsonl"))
            .await
            .unwrap();

        for song in 1..=20 {
            journal.record(7, song).await.unwrap();
            journal.record(8, 100 + song).await.unwrap();
        }

        let recent = journal.recent(7, 15).await.unwrap();
        let songs: Vec<u64> = recent.iter().map(|e| e.song_id).collect();
        assert_eq!(songs, (6..=20).rev().collect::<Vec<_>>());
        assert!(recent.windows(2).all(|w| w[0].played_at >= w[1].played_at));

        assert!(journal.recent(9, 15).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn journal_read_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        std::fs::write(
            &path,
            "{\"user_id\":3,\"song_id\":1,\"played_at\":10}\n{truncated\n",
        )
        .unwrap();

        let journal = JournalHistoryRecorder::open(&path).await.unwrap();
        journal.record(3, 2).await.unwrap();

        let songs: Vec<u64> = journal
            .recent(3, 15)
            .await
            .unwrap()
            .iter()
            .map(|e| e.song_id)
            .collect();
        assert_eq!(songs, vec![2, 1]);
    }
}
