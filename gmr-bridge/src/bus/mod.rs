//! Publish/subscribe message bus.
//!
//! The bridge only needs two primitives from a bus client: publish a byte
//! payload on a topic, and receive the payloads published on a topic. They
//! are captured by the [`MessageBus`] trait. [`LocalBus`] implements it
//! in-process on top of [`tokio::sync::broadcast`] channels, one per topic,
//! so every subscriber receives every message without a slow subscriber
//! blocking the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod payload;

/// Default number of buffered messages per topic before slow subscribers lag
const DEFAULT_CAPACITY: usize = 1024;

/// A message as delivered to subscribers
pub type BusMessage = Arc<[u8]>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Bus is closed")]
    Closed,
    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },
}

/// The bus primitives the bridge depends on.
///
/// Implementations must allow concurrent publish and receive from
/// different tasks.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` on `topic`. Having no subscribers is not an error.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Receive every message published on `topic` from now on.
    fn subscribe(&self, topic: &str) -> BusSubscription;
}

/// Stream of messages for one topic
#[derive(Debug)]
pub struct BusSubscription {
    topic: String,
    receiver: broadcast::Receiver<BusMessage>,
}

impl BusSubscription {
    pub fn new(topic: impl Into<String>, receiver: broadcast::Receiver<BusMessage>) -> Self {
        Self {
            topic: topic.into(),
            receiver,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next message.
    ///
    /// Messages dropped because this subscriber fell behind are logged and
    /// skipped. Returns `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("{}: subscriber lagged, skipped {} messages", self.topic, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next message if one is already waiting
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    log::warn!("{}: subscriber lagged, skipped {} messages", self.topic, n);
                }
                Err(_) => return None,
            }
        }
    }
}

/// In-process bus. Clone it cheaply; all clones share the same topics.
#[derive(Clone, Debug)]
pub struct LocalBus {
    capacity: usize,
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<BusMessage>>>>,
}

impl LocalBus {
    /// Create a new bus; `capacity` applies to every topic independently.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let receivers = self.sender(topic).send(payload.into()).unwrap_or(0);
        log::trace!("{}: published to {} subscribers", topic, receivers);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> BusSubscription {
        BusSubscription::new(topic, self.sender(topic).subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = LocalBus::default();
        let mut a = bus.subscribe("garmin/radar/command");
        let mut b = bus.subscribe("garmin/radar/command");
        let mut other = bus.subscribe("garmin/gmr18radar/status");

        bus.publish("garmin/radar/command", b"hello".to_vec())
            .await
            .unwrap();

        assert_eq!(&*a.recv().await.unwrap(), b"hello");
        assert_eq!(&*b.recv().await.unwrap(), b"hello");
        assert!(other.try_recv().is_none());
        assert_eq!(a.topic(), "garmin/radar/command");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = LocalBus::default();
        assert_eq!(bus.publish("nobody", vec![1, 2, 3]).await, Ok(()));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_continues() {
        let bus = LocalBus::new(2);
        let mut sub = bus.subscribe("t");
        for i in 0..5u8 {
            bus.publish("t", vec![i]).await.unwrap();
        }
        // Oldest messages were dropped, the newest are still delivered
        assert_eq!(&*sub.recv().await.unwrap(), &[3u8]);
        assert_eq!(&*sub.recv().await.unwrap(), &[4u8]);
    }

    #[tokio::test]
    async fn test_clones_share_topics() {
        let bus = LocalBus::default();
        let clone = bus.clone();
        let mut sub = bus.subscribe("t");
        clone.publish("t", vec![7]).await.unwrap();
        assert_eq!(&*sub.recv().await.unwrap(), &[7u8]);
    }
}
