//! Versioned, clock-stamped canvas edits.
//!
//! The core never looks inside an operation: `op_type` is a routing key
//! and `payload` is an opaque JSON value owned by the editor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::clock::VectorClock;

/// Caller-supplied half of an operation, before the log stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOperation {
    pub op_type: String,
    pub target_id: String,
    pub target_type: String,
    pub payload: Value,
    pub user_id: String,
}

impl NewOperation {
    pub fn new(
        op_type: impl Into<String>,
        target_id: impl Into<String>,
        target_type: impl Into<String>,
        payload: Value,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            op_type: op_type.into(),
            target_id: target_id.into(),
            target_type: target_type.into(),
            payload,
            user_id: user_id.into(),
        }
    }
}

/// One recorded edit to a canvas entity.
///
/// `version` is assigned by the owning
/// [`OperationLog`](crate::operation_log::OperationLog) and only means something
/// on that node. `vector_clock` is stamped once by the node that recorded the
/// edit and travels unchanged to replicas. `timestamp` is wall-clock
/// milliseconds for display and never participates in ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub op_type: String,
    pub target_id: String,
    pub target_type: String,
    pub payload: Value,
    pub user_id: String,
    pub version: u64,
    pub vector_clock: VectorClock,
    pub timestamp: u64,
}

impl Operation {
    /// Stamp a new operation. Only the log calls this.
    pub(crate) fn stamp(new: NewOperation, version: u64, vector_clock: VectorClock) -> Self {
        Self {
            id: Uuid::new_v4(),
            op_type: new.op_type,
            target_id: new.target_id,
            target_type: new.target_type,
            payload: new.payload,
            user_id: new.user_id,
            version,
            vector_clock,
            timestamp: now_millis(),
        }
    }

    /// Give an operation forwarded from another process a local version.
    /// Identity, author, timestamp and origin clock are kept.
    pub(crate) fn restamp(remote: &Operation, version: u64) -> Self {
        Self {
            version,
            ..remote.clone()
        }
    }

    /// Encode as JSON bytes (payloads are arbitrary JSON, so the relay
    /// carries operations in this form).
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Milliseconds since the UNIX epoch (0 if the system clock is before it).
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
