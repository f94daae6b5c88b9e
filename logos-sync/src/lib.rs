//! # logos-sync: Causal edit history and reconnect sync for Logos canvases
//!
//! Tracks the causal order of concurrent edits on a shared canvas and
//! serves gap-free incremental deltas to clients that reconnect, instead
//! of re-sending full state.
//!
//! ## Architecture
//!
//! ```text
//!  transport (WebSocket, out of crate)
//!        │ connect / disconnect / submit
//!        ▼
//! ┌──────────────────────┐      ┌─────────────────────┐
//! │ SyncSessionManager   │─────►│ OperationLog (1 per │
//! │ sessions · snapshots │      │ canvas, versioned,  │
//! │ idle sweep           │      │ VectorClock-stamped)│
//! └──────────┬───────────┘      └─────────────────────┘
//!            │ record_remote
//!     ┌──────┴───────┐   publish/subscribe   ┌──────────────┐
//!     │ CanvasRelay  │ ◄────────────────────► │ PubSub port  │
//!     └──────────────┘                        └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`clock`]: Vector clocks (pure values, JSON wire format)
//! - [`operation`]: Versioned, clock-stamped edit records
//! - [`operation_log`]: Per-canvas append-only log and delta computation
//! - [`snapshot`]: Snapshots (LZ4 cached) and deltas
//! - [`session`]: Sessions and the three-way session index
//! - [`manager`]: Session lifecycle, reconnect deltas, idle sweep
//! - [`pubsub`]: Publish/subscribe port and in-process implementation
//! - [`relay`]: Cross-process operation fan-out
//! - [`config`]: Tunables

pub mod clock;
pub mod config;
pub mod manager;
pub mod operation;
pub mod operation_log;
pub mod pubsub;
pub mod relay;
pub mod session;
pub mod snapshot;

// Re-exports for convenience
pub use clock::{ClockOrdering, VectorClock};
pub use config::SyncConfig;
pub use manager::{
    SessionHandshake, SharedSessionManager, SyncSessionManager, SyncStats, spawn_idle_sweeper,
};
pub use operation::{NewOperation, Operation};
pub use operation_log::OperationLog;
pub use pubsub::{InMemoryPubSub, PubSub, PubSubStats};
pub use relay::{CanvasRelay, RelayError, RelayMessage, spawn_relay_listener};
pub use session::{SessionStore, SyncSession};
pub use snapshot::{CompressedSnapshot, SnapshotError, StateDelta, StateSnapshot};
