//! Publish/subscribe port for fanning operations out across processes.
//!
//! The sync core only depends on the [`PubSub`] trait. A networked broker
//! is plugged in by the deployment; [`InMemoryPubSub`] covers single-process
//! deployments and tests.
//!
//! Each channel is a tokio broadcast channel: O(1) send to all subscribers,
//! every subscriber buffers up to `capacity` messages before lagging.
//!
//! Reference: Kleppmann, DDIA, Chapter 11 (Message Brokers)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

use crate::config::SyncConfig;

/// Abstract publish/subscribe contract.
///
/// Messages are pre-encoded bytes shared between subscribers.
pub trait PubSub: Send + Sync {
    /// Publish to every current subscriber of `channel`. Returns the number
    /// of subscribers reached (0 when nobody listens).
    fn publish(&self, channel: &str, message: Arc<Vec<u8>>) -> usize;

    /// Subscribe to `channel`, creating it if needed.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Arc<Vec<u8>>>;

    /// Drop `channel` if it has no subscribers left.
    fn remove_if_unused(&self, channel: &str) -> bool;
}

/// Statistics for monitoring pub/sub health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PubSubStats {
    pub messages_published: u64,
    /// Published while nobody was subscribed
    pub messages_undelivered: u64,
    pub active_channels: usize,
}

/// Atomic counters so `publish` never takes a write lock.
struct AtomicPubSubStats {
    messages_published: AtomicU64,
    messages_undelivered: AtomicU64,
}

/// Process-local [`PubSub`] backed by tokio broadcast channels.
pub struct InMemoryPubSub {
    channels: RwLock<HashMap<String, broadcast::Sender<Arc<Vec<u8>>>>>,
    capacity: usize,
    stats: AtomicPubSubStats,
}

impl InMemoryPubSub {
    /// `capacity` is the per-subscriber buffer before messages are dropped.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicPubSubStats {
                messages_published: AtomicU64::new(0),
                messages_undelivered: AtomicU64::new(0),
            },
        }
    }

    /// Sized from `pubsub_capacity`.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.pubsub_capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn channel_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Current subscriber count of a channel (0 if it does not exist).
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }

    pub fn stats(&self) -> PubSubStats {
        PubSubStats {
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            messages_undelivered: self.stats.messages_undelivered.load(Ordering::Relaxed),
            active_channels: self.channel_count(),
        }
    }
}

impl PubSub for InMemoryPubSub {
    fn publish(&self, channel: &str, message: Arc<Vec<u8>>) -> usize {
        let reached = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .and_then(|sender| sender.send(message).ok())
            .unwrap_or(0);

        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        if reached == 0 {
            self.stats.messages_undelivered.fetch_add(1, Ordering::Relaxed);
        }
        reached
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Arc<Vec<u8>>> {
        // Fast path: read lock
        {
            let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(sender) = channels.get(channel) {
                return sender.subscribe();
            }
        }

        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let sender = channels.entry(channel.to_string()).or_insert_with(|| {
            log::debug!("Opening pub/sub channel {channel}");
            broadcast::channel(self.capacity).0
        });
        sender.subscribe()
    }

    fn remove_if_unused(&self, channel: &str) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        match channels.get(channel) {
            Some(sender) if sender.receiver_count() == 0 => {
                channels.remove(channel);
                log::debug!("Closed pub/sub channel {channel}");
                true
            }
            _ => false,
        }
    }
}
