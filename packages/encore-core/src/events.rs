//! Play events.
//!
//! A [`PlayEvent`] is created by the streaming responder the instant a play
//! crosses the counting threshold and travels to the history service as the
//! JSON payload `{"user_id": .., "song_id": ..}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::BrokerResult;

/// "User `user_id` played song `song_id`."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayEvent {
    pub user_id: u64,
    pub song_id: u64,
}

impl PlayEvent {
    pub const fn new(user_id: u64, song_id: u64) -> Self {
        Self { user_id, song_id }
    }

    /// Broker message identifier: `{user_id}-{song_id}-{unix_secs}`.
    #[must_use]
    pub fn message_id(&self, unix_secs: u64) -> String {
        format!("{}-{}-{}", self.user_id, self.song_id, unix_secs)
    }

    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// Sink for play events, safe for concurrent use by many requests.
#[async_trait]
pub trait PlayEventPublisher: Send + Sync {
    async fn publish(&self, event: PlayEvent) -> BrokerResult<()>;

    /// Whether events can currently reach the broker without reconnecting.
    fn is_connected(&self) -> bool {
        true
    }
}
