//! Sync core configuration.

use std::time::Duration;

/// Configuration for a [`SyncSessionManager`](crate::manager::SyncSessionManager).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity of this process in vector clocks
    pub node_id: String,
    /// Retention cap per operation log (None = unbounded)
    pub max_operations_per_log: Option<usize>,
    /// Maximum operations queued per session
    pub max_pending_operations: usize,
    /// How long a canvas may sit with zero sessions before its log and
    /// snapshot are evicted
    pub idle_log_ttl: Duration,
    /// Interval between idle sweeps
    pub idle_sweep_interval: Duration,
    /// Upper bound on evictions per sweep, keeps each sweep short
    pub max_evictions_per_sweep: usize,
    /// How long an evicted canvas's last version is remembered so a
    /// recreated log does not reissue it
    pub evicted_watermark_ttl: Duration,
    /// Buffered messages per pub/sub channel
    pub pubsub_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            node_id: "node-local".to_string(),
            max_operations_per_log: Some(10_000),
            max_pending_operations: 1_000,
            idle_log_ttl: Duration::from_secs(600),
            idle_sweep_interval: Duration::from_secs(60),
            max_evictions_per_sweep: 256,
            evicted_watermark_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            pubsub_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Default configuration stamped with the given node id.
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }
}
