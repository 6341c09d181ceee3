//! Topic-based publish/subscribe of opaque byte payloads.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use crate::BusError;

const TOPIC_DEPTH: usize = 256;

/// Delivery is at-most-once per subscriber, best effort. Subscribers that
/// fall behind lose the oldest payloads first.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError>;
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
}

pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<Bytes>,
}

impl Subscription {
    /// Next payload, or `None` once the topic is gone. Lagged gaps are
    /// skipped silently; recipients already tolerate reordering and loss.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    trace!(topic = %self.topic, dropped = n, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Releases the subscriber slot. Dropping has the same effect.
    pub fn close(self) {}
}

/// In-process fan-out over per-topic broadcast channels.
#[derive(Default)]
pub struct MemoryBus {
    topics: DashMap<String, broadcast::Sender<Bytes>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        let dead = match self.topics.get(topic) {
            // send only fails when every receiver is gone
            Some(tx) => tx.send(payload).is_err(),
            None => false,
        };
        if dead {
            self.topics.remove_if(topic, |_, tx| tx.receiver_count() == 0);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let rx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_DEPTH).0)
            .subscribe();
        Ok(Subscription { topic: topic.to_string(), rx })
    }
}
