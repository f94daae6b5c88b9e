//! Cross-process operation relay over the [`PubSub`] port.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬────────────────────────┐
//! │ origin   │ canvas_id │ operation_json         │
//! │ string   │ string    │ JSON bytes (variable)  │
//! └──────────┴───────────┴────────────────────────┘
//! ```
//!
//! The operation travels as JSON because its payload is arbitrary JSON
//! that a non-self-describing format cannot carry.
//!
//! ```text
//! node-a: record_operation ─► publish("canvas:{id}") ─► broker
//!                                                         │
//! node-b: record_remote ◄──── ingest ◄──── subscribe ◄────┘
//! ```
//!
//! Every node holding a live session for a canvas subscribes to its channel
//! and records forwarded operations into its own replica log. Each replica
//! numbers operations in arrival order, so versions differ between nodes;
//! the origin clock an operation carries does not. A client reconnecting
//! through another node is served from its clock, which yields the same
//! missing operations on every replica that has ingested them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::manager::{SharedSessionManager, SyncSessionManager};
use crate::operation::Operation;
use crate::pubsub::PubSub;

/// Envelope for one forwarded operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    /// Node that recorded the operation
    pub origin: String,
    pub canvas_id: String,
    /// JSON-encoded [`Operation`]
    pub operation_json: Vec<u8>,
}

impl RelayMessage {
    pub fn new(origin: &str, canvas_id: &str, op: &Operation) -> Result<Self, RelayError> {
        let operation_json = op
            .to_json()
            .map_err(|e| RelayError::SerializationError(e.to_string()))?;
        Ok(Self {
            origin: origin.to_string(),
            canvas_id: canvas_id.to_string(),
            operation_json,
        })
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, RelayError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RelayError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, RelayError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| RelayError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the carried operation.
    pub fn operation(&self) -> Result<Operation, RelayError> {
        Operation::from_json(&self.operation_json)
            .map_err(|e| RelayError::DeserializationError(e.to_string()))
    }
}

/// Relay errors.
#[derive(Debug, Clone)]
pub enum RelayError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for RelayError {}

/// Publishes local operations and ingests forwarded ones for one node.
#[derive(Clone)]
pub struct CanvasRelay {
    node_id: String,
    pubsub: Arc<dyn PubSub>,
}

impl CanvasRelay {
    pub fn new(node_id: impl Into<String>, pubsub: Arc<dyn PubSub>) -> Self {
        Self {
            node_id: node_id.into(),
            pubsub,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Pub/sub channel carrying a canvas's operations.
    pub fn channel_for(canvas_id: &str) -> String {
        format!("canvas:{canvas_id}")
    }

    /// Forward a locally recorded operation to other nodes.
    ///
    /// Returns the number of subscribers reached.
    pub fn publish_operation(&self, canvas_id: &str, op: &Operation) -> Result<usize, RelayError> {
        let encoded = RelayMessage::new(&self.node_id, canvas_id, op)?.encode()?;
        let reached = self
            .pubsub
            .publish(&Self::channel_for(canvas_id), Arc::new(encoded));
        log::debug!(
            "Relayed v{} on canvas {canvas_id} to {reached} subscribers",
            op.version
        );
        Ok(reached)
    }

    pub fn subscribe(&self, canvas_id: &str) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.pubsub.subscribe(&Self::channel_for(canvas_id))
    }

    /// Drop the canvas channel once nobody listens.
    pub fn release(&self, canvas_id: &str) -> bool {
        self.pubsub.remove_if_unused(&Self::channel_for(canvas_id))
    }

    /// Record a relayed message into the local replica log.
    ///
    /// Messages published by this node and operations already present are
    /// skipped with `Ok(None)`.
    pub fn ingest(
        &self,
        manager: &mut SyncSessionManager,
        bytes: &[u8],
    ) -> Result<Option<Operation>, RelayError> {
        let msg = RelayMessage::decode(bytes)?;
        if msg.origin == self.node_id {
            return Ok(None);
        }
        let op = msg.operation()?;
        Ok(manager
            .get_or_create_operation_log(&msg.canvas_id)
            .record_remote(&op))
    }
}

/// Feed a canvas channel into the shared manager until the channel closes.
///
/// Lagged receivers skip the dropped messages and keep going; the affected
/// clients recover through the normal reconnect delta.
pub fn spawn_relay_listener(
    relay: CanvasRelay,
    manager: SharedSessionManager,
    canvas_id: String,
) -> JoinHandle<()> {
    let mut rx = relay.subscribe(&canvas_id);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(bytes) => {
                    let mut guard = manager.lock().await;
                    if let Err(e) = relay.ingest(&mut guard, &bytes) {
                        log::error!("Dropping relay message on canvas {canvas_id}: {e}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Relay listener for canvas {canvas_id} lagged by {skipped} messages");
                }
                Err(RecvError::Closed) => {
                    log::info!("Relay channel for canvas {canvas_id} closed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::operation::NewOperation;
    use crate::pubsub::InMemoryPubSub;
    use serde_json::json;

    fn recorded(manager: &mut SyncSessionManager, canvas: &str) -> Operation {
        manager
            .get_or_create_operation_log(canvas)
            .record_operation(NewOperation::new(
                "resize",
                "rect-1",
                "shape",
                json!({"w": 120, "h": 80, "meta": {"locked": false}}),
                "alice",
            ))
    }

    #[test]
    fn test_relay_message_roundtrip() {
        let mut manager = SyncSessionManager::new(SyncConfig::for_node("node-a"));
        let op = recorded(&mut manager, "canvas-1");

        let msg = RelayMessage::new("node-a", "canvas-1", &op).unwrap();
        let decoded = RelayMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.operation().unwrap(), op);
    }

    #[test]
    fn test_decode_garbage_errors() {
        assert!(RelayMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());

        let msg = RelayMessage {
            origin: "node-a".into(),
            canvas_id: "c".into(),
            operation_json: b"not json".to_vec(),
        };
        let err = msg.operation().unwrap_err();
        assert!(err.to_string().starts_with("Deserialization error"));
    }

    #[test]
    fn test_ingest_records_into_replica() {
        let pubsub: Arc<dyn PubSub> = Arc::new(InMemoryPubSub::new(16));
        let relay_a = CanvasRelay::new("node-a", pubsub.clone());
        let relay_b = CanvasRelay::new("node-b", pubsub);

        let mut node_a = SyncSessionManager::new(SyncConfig::for_node("node-a"));
        let mut node_b = SyncSessionManager::new(SyncConfig::for_node("node-b"));

        let op = recorded(&mut node_a, "canvas-1");
        let bytes = RelayMessage::new(relay_a.node_id(), "canvas-1", &op)
            .unwrap()
            .encode()
            .unwrap();

        let ingested = relay_b.ingest(&mut node_b, &bytes).unwrap().unwrap();
        assert_eq!(ingested.id, op.id);
        assert_eq!(ingested.payload, op.payload);
        assert_eq!(node_b.get_operation_log("canvas-1").unwrap().version(), 1);

        // Replayed delivery is a no-op
        assert!(relay_b.ingest(&mut node_b, &bytes).unwrap().is_none());
    }

    #[test]
    fn test_ingest_skips_own_messages() {
        let pubsub: Arc<dyn PubSub> = Arc::new(InMemoryPubSub::new(16));
        let relay = CanvasRelay::new("node-a", pubsub);
        let mut manager = SyncSessionManager::new(SyncConfig::for_node("node-a"));

        let op = recorded(&mut manager, "canvas-1");
        let bytes = RelayMessage::new("node-a", "canvas-1", &op).unwrap().encode().unwrap();

        assert!(relay.ingest(&mut manager, &bytes).unwrap().is_none());
        assert_eq!(manager.get_operation_log("canvas-1").unwrap().version(), 1);
    }

    #[test]
    fn test_concurrent_writers_serve_same_missing_ops() {
        let pubsub: Arc<dyn PubSub> = Arc::new(InMemoryPubSub::new(16));
        let relay_a = CanvasRelay::new("node-a", pubsub.clone());
        let relay_b = CanvasRelay::new("node-b", pubsub);

        let mut node_a = SyncSessionManager::new(SyncConfig::for_node("node-a"));
        let mut node_b = SyncSessionManager::new(SyncConfig::for_node("node-b"));

        let a1 = recorded(&mut node_a, "c");
        let b1 = recorded(&mut node_b, "c");

        // Carol syncs on node-a before b1 arrives there
        let carol_clock = node_a.get_operation_log("c").unwrap().vector_clock();

        let to_b = RelayMessage::new("node-a", "c", &a1).unwrap().encode().unwrap();
        let to_a = RelayMessage::new("node-b", "c", &b1).unwrap().encode().unwrap();
        relay_b.ingest(&mut node_b, &to_b).unwrap().unwrap();
        relay_a.ingest(&mut node_a, &to_a).unwrap().unwrap();

        // Same version, different edits
        let a_v1 = node_a.get_operation_log("c").unwrap().operations_since(0)[0].id;
        let b_v1 = node_b.get_operation_log("c").unwrap().operations_since(0)[0].id;
        assert_ne!(a_v1, b_v1);

        for node in [&mut node_a, &mut node_b] {
            let handshake =
                node.create_session("carol", "c", "k", Some(1), Some(carol_clock.clone()));
            let delta = handshake.delta.unwrap();
            let ids: Vec<_> = delta.operations.iter().map(|op| op.id).collect();
            assert_eq!(ids, vec![b1.id]);
            assert!(!handshake.resync_required);
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let pubsub: Arc<dyn PubSub> = Arc::new(InMemoryPubSub::new(16));
        let relay = CanvasRelay::new("node-a", pubsub);
        let mut rx = relay.subscribe("canvas-1");

        let mut manager = SyncSessionManager::new(SyncConfig::for_node("node-a"));
        let op = recorded(&mut manager, "canvas-1");
        assert_eq!(relay.publish_operation("canvas-1", &op).unwrap(), 1);

        let bytes = rx.recv().await.unwrap();
        let msg = RelayMessage::decode(&bytes).unwrap();
        assert_eq!(msg.origin, "node-a");
        assert_eq!(msg.canvas_id, "canvas-1");

        drop(rx);
        assert!(relay.release("canvas-1"));
    }

    #[test]
    fn test_channel_naming() {
        assert_eq!(CanvasRelay::channel_for("abc"), "canvas:abc");
    }
}
