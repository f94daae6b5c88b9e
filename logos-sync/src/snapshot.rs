//! Full-state snapshots and incremental deltas.
//!
//! A reconnecting client rebuilds from the last [`StateSnapshot`] and then
//! applies a [`StateDelta`]:
//!
//! ```text
//!   snapshot @ v10 ──► op v11 ──► op v12 ──► op v13
//!                     └────── StateDelta(10, 13) ──────┘
//! ```
//!
//! Snapshots are produced by an external state builder and cached here
//! LZ4-compressed, one slot per canvas.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (Log-Structured Storage)

use serde::{Deserialize, Serialize};

use crate::operation::Operation;

/// Full serialized canvas state at `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub canvas_id: String,
    /// Opaque state bytes (format owned by the state builder).
    pub state: Vec<u8>,
    pub version: u64,
}

impl StateSnapshot {
    pub fn new(canvas_id: impl Into<String>, state: Vec<u8>, version: u64) -> Self {
        Self {
            canvas_id: canvas_id.into(),
            state,
            version,
        }
    }
}

/// Operations in `(from_version, to_version]`, ascending. A delta computed
/// from a client clock leaves out operations in that range it already has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub canvas_id: String,
    pub from_version: u64,
    pub to_version: u64,
    pub operations: Vec<Operation>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

/// Snapshot decompression errors.
#[derive(Debug, Clone)]
pub enum SnapshotError {
    DecompressionFailed(String),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::DecompressionFailed(e) => write!(f, "Decompression failed: {e}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

/// A snapshot held in the cache with its state LZ4-compressed.
#[derive(Debug, Clone)]
pub struct CompressedSnapshot {
    pub canvas_id: String,
    pub version: u64,
    /// Original uncompressed size in bytes
    pub original_size: usize,
    compressed: Vec<u8>,
}

impl CompressedSnapshot {
    /// Compress a snapshot for storage.
    pub fn compress(snapshot: StateSnapshot) -> Self {
        let compressed = lz4_flex::compress_prepend_size(&snapshot.state);
        Self {
            canvas_id: snapshot.canvas_id,
            version: snapshot.version,
            original_size: snapshot.state.len(),
            compressed,
        }
    }

    /// Restore the full snapshot.
    pub fn decompress(&self) -> Result<StateSnapshot, SnapshotError> {
        let state = lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| SnapshotError::DecompressionFailed(e.to_string()))?;
        Ok(StateSnapshot {
            canvas_id: self.canvas_id.clone(),
            state,
            version: self.version,
        })
    }

    pub fn compressed_size(&self) -> usize {
        self.compressed.len()
    }

    /// Compression ratio (original / compressed).
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }
}
