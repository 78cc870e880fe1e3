/// Exchange, queue and binding shared by publisher and consumer.
///
/// The exchange is a durable fanout: every bound queue receives a copy of
/// each event, so more consumers can bind their own queues without any
/// change on the publishing side. Both sides declare the topology; whichever
/// starts first creates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    /// Always empty: fanout ignores routing keys.
    pub routing_key: String,
}

impl Topology {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: String::new(),
        }
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new("song_events", "song_events_queue")
    }
}
