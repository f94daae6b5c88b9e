//! Session manager: connection lifecycle, per-canvas logs, reconnect deltas.
//!
//! Architecture:
//! ```text
//!  connect(user, canvas, conn, v?, clock?)
//!        │
//!        ▼
//!  SyncSessionManager ──► SessionStore (conn / user / canvas indices)
//!        │
//!        ├──► logs:      canvas → OperationLog   (lazy)
//!        ├──► snapshots: canvas → CompressedSnapshot (last writer wins)
//!        ├──► idle:      canvas → Instant it lost its last session
//!        │                     │
//!        │            sweep_idle() every N seconds
//!        │                     ▼
//!        └──► evicted:   canvas → last version + clock (aged out)
//! ```
//!
//! Reconnect deltas are computed from the client's clock when it sends one,
//! and from its version otherwise. Versions are local to the node that
//! issued them, so a client moving between nodes must present its clock.
//!
//! All mutation goes through `&mut self`. Async callers share one manager
//! as [`SharedSessionManager`], which serializes `record_operation` per
//! canvas and keeps versions gap-free.
//!
//! Absence (unknown connection, canvas without a log) is steady state
//! during connect/disconnect races and is reported as `None`/empty, never
//! as an error.
//!
//! Reference: Kleppmann, DDIA, Chapter 5 (Replication Lag)

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::VectorClock;
use crate::config::SyncConfig;
use crate::operation::Operation;
use crate::operation_log::OperationLog;
use crate::session::{SessionStore, SyncSession};
use crate::snapshot::{CompressedSnapshot, StateDelta, StateSnapshot};

/// A manager shared between async connection handlers.
pub type SharedSessionManager = Arc<Mutex<SyncSessionManager>>;

/// Result of [`SyncSessionManager::create_session`].
#[derive(Debug, Clone)]
pub struct SessionHandshake {
    pub session: SyncSession,
    /// Operations the client missed, if it is behind the canvas log
    pub delta: Option<StateDelta>,
    /// The client's watermark is outside retained history; send the stored
    /// snapshot before (or instead of) the delta
    pub resync_required: bool,
}

/// Monitoring counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub total_sessions: usize,
    pub total_users: usize,
    pub total_canvases: usize,
    pub operation_log_count: usize,
    pub snapshot_count: usize,
    pub idle_canvases: usize,
    pub evicted_watermarks: usize,
}

/// Where an evicted canvas's history ended.
#[derive(Debug, Clone)]
struct EvictedWatermark {
    version: u64,
    clock: VectorClock,
    evicted_at: Instant,
}

/// Tracks one session per live connection and owns every canvas log.
pub struct SyncSessionManager {
    config: SyncConfig,
    sessions: SessionStore,
    logs: HashMap<String, OperationLog>,
    snapshots: HashMap<String, CompressedSnapshot>,
    /// Canvases with state but no sessions, and since when
    idle_since: HashMap<String, Instant>,
    /// Last version and clock of evicted logs
    evicted: HashMap<String, EvictedWatermark>,
    /// Eviction order for aging out `evicted`; may hold stale entries
    evicted_order: VecDeque<(Instant, String)>,
}

impl SyncSessionManager {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            sessions: SessionStore::new(),
            logs: HashMap::new(),
            snapshots: HashMap::new(),
            idle_since: HashMap::new(),
            evicted: HashMap::new(),
            evicted_order: VecDeque::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SyncConfig::default())
    }

    /// Wrap for sharing between connection handlers.
    pub fn into_shared(self) -> SharedSessionManager {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register a connection (first connect or reconnect).
    ///
    /// An existing session of the same user on the same canvas is evicted
    /// and its watermark and pending queue become the defaults for the new
    /// one; explicit `last_known_*` arguments win over carried values.
    /// A delta is returned only when the client has a non-zero watermark
    /// and the canvas log has moved past it. With a non-empty clock the
    /// delta holds exactly the retained operations that clock has not seen;
    /// without one it is every operation after the version.
    pub fn create_session(
        &mut self,
        user_id: &str,
        canvas_id: &str,
        connection_id: &str,
        last_known_version: Option<u64>,
        last_known_clock: Option<VectorClock>,
    ) -> SessionHandshake {
        let stale = self.sessions.find(user_id, canvas_id).map(str::to_string);
        let previous = stale.and_then(|conn| self.sessions.remove(&conn));

        let (carried_version, carried_clock, carried_pending) = match previous {
            Some(prev) => {
                log::info!(
                    "Evicting connection {} of {user_id} on canvas {canvas_id} (reconnect as {connection_id})",
                    prev.connection_id()
                );
                (prev.last_sync_version, prev.last_sync_clock, prev.pending_operations)
            }
            None => (0, VectorClock::new(), VecDeque::new()),
        };

        let mut session = SyncSession::new(user_id, canvas_id, connection_id);
        session.last_sync_version = last_known_version.unwrap_or(carried_version);
        session.last_sync_clock = last_known_clock.unwrap_or(carried_clock);
        session.pending_operations = carried_pending;

        if let Some(replaced) = self.sessions.insert(session.clone()) {
            // Same connection id re-registered for another canvas
            self.mark_idle_if_empty(replaced.canvas_id());
        }
        self.idle_since.remove(canvas_id);

        let (delta, resync_required) = self.reconnect_delta(
            canvas_id,
            session.last_sync_version,
            &session.last_sync_clock,
        );

        log::info!(
            "Session {connection_id} opened: user {user_id} on canvas {canvas_id} at v{} ({} missed ops)",
            session.last_sync_version,
            delta.as_ref().map_or(0, StateDelta::len)
        );

        SessionHandshake {
            session,
            delta,
            resync_required,
        }
    }

    fn reconnect_delta(
        &self,
        canvas_id: &str,
        since: u64,
        seen: &VectorClock,
    ) -> (Option<StateDelta>, bool) {
        if since == 0 {
            return (None, false);
        }
        // No log: evicted or never written here, the client's state is
        // unverifiable.
        let Some(oplog) = self.logs.get(canvas_id) else {
            return (None, true);
        };

        let (delta, resync) = if seen.is_empty() {
            if oplog.version() > since {
                let resync = !oplog.can_serve_delta_from(since);
                (Some(oplog.delta(canvas_id, since)), resync)
            } else {
                // A version this log never issued
                (None, since > oplog.version())
            }
        } else {
            (
                oplog.delta_for_clock(canvas_id, seen),
                !oplog.can_serve_delta_for_clock(seen),
            )
        };

        if resync {
            log::warn!("Canvas {canvas_id}: history the client missed is gone, client needs a snapshot");
        }
        (delta, resync)
    }

    /// Advance a session's watermark and clear its pending queue.
    ///
    /// `clock` should be the log clock at `version`, so a later reconnect
    /// through another node can be matched against that node's replica.
    ///
    /// Returns `false` if the connection is unknown.
    pub fn update_session(&mut self, connection_id: &str, version: u64, clock: VectorClock) -> bool {
        match self.sessions.get_mut(connection_id) {
            Some(session) => {
                session.last_sync_version = version;
                session.last_sync_clock = clock;
                session.pending_operations.clear();
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Queue an operation for a slow or offline client.
    ///
    /// Returns `false` if the connection is unknown or its queue is full.
    pub fn queue_operation(&mut self, connection_id: &str, op: Operation) -> bool {
        let max_pending = self.config.max_pending_operations;
        match self.sessions.get_mut(connection_id) {
            Some(session) => {
                let queued = session.enqueue(op, max_pending);
                if !queued {
                    log::warn!("Pending queue full for connection {connection_id}");
                }
                queued
            }
            None => false,
        }
    }

    /// Queued operations in FIFO order (empty if unknown).
    pub fn pending_operations(&self, connection_id: &str) -> Vec<Operation> {
        self.sessions
            .get(connection_id)
            .map(|s| s.pending_operations.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drain the pending queue for delivery.
    pub fn take_pending_operations(&mut self, connection_id: &str) -> Vec<Operation> {
        self.sessions
            .get_mut(connection_id)
            .map(|s| s.pending_operations.drain(..).collect())
            .unwrap_or_default()
    }

    /// Disconnect: remove the session from every index.
    pub fn remove_session(&mut self, connection_id: &str) -> Option<SyncSession> {
        let session = self.sessions.remove(connection_id)?;
        self.mark_idle_if_empty(session.canvas_id());
        log::info!(
            "Session {connection_id} closed: user {} on canvas {}",
            session.user_id(),
            session.canvas_id()
        );
        Some(session)
    }

    fn mark_idle_if_empty(&mut self, canvas_id: &str) {
        if self.sessions.has_canvas(canvas_id) {
            return;
        }
        if self.logs.contains_key(canvas_id) || self.snapshots.contains_key(canvas_id) {
            self.idle_since
                .entry(canvas_id.to_string())
                .or_insert_with(Instant::now);
        }
    }

    pub fn get_session(&self, connection_id: &str) -> Option<&SyncSession> {
        self.sessions.get(connection_id)
    }

    /// Live sessions on a canvas, for broadcast fan-out.
    pub fn get_canvas_sessions(&self, canvas_id: &str) -> Vec<&SyncSession> {
        self.sessions.canvas_sessions(canvas_id)
    }

    pub fn get_user_sessions(&self, user_id: &str) -> Vec<&SyncSession> {
        self.sessions.user_sessions(user_id)
    }

    /// The canvas's log, created on first use.
    ///
    /// A canvas whose log was evicted gets a log resumed above the evicted
    /// version, so versions are never reissued.
    pub fn get_or_create_operation_log(&mut self, canvas_id: &str) -> &mut OperationLog {
        let entry = match self.logs.entry(canvas_id.to_string()) {
            Entry::Occupied(entry) => return entry.into_mut(),
            Entry::Vacant(entry) => entry,
        };

        if !self.sessions.has_canvas(canvas_id) {
            self.idle_since
                .entry(canvas_id.to_string())
                .or_insert_with(Instant::now);
        }

        let node_id = self.config.node_id.clone();
        let retention = self.config.max_operations_per_log;
        let oplog = match self.evicted.remove(canvas_id) {
            Some(mark) => {
                log::debug!(
                    "Resuming operation log for canvas {canvas_id} after v{}",
                    mark.version
                );
                OperationLog::resume(node_id, retention, mark.version, mark.clock)
            }
            None => {
                log::debug!("Creating operation log for canvas {canvas_id}");
                match retention {
                    Some(max) => OperationLog::with_retention(node_id, max),
                    None => OperationLog::new(node_id),
                }
            }
        };
        entry.insert(oplog)
    }

    pub fn get_operation_log(&self, canvas_id: &str) -> Option<&OperationLog> {
        self.logs.get(canvas_id)
    }

    /// Replace the canvas's baseline snapshot.
    pub fn store_snapshot(&mut self, snapshot: StateSnapshot) {
        let canvas_id = snapshot.canvas_id.clone();
        let compressed = CompressedSnapshot::compress(snapshot);
        log::debug!(
            "Stored snapshot for canvas {canvas_id} at v{} ({} → {} bytes)",
            compressed.version,
            compressed.original_size,
            compressed.compressed_size()
        );
        self.snapshots.insert(canvas_id.clone(), compressed);
        self.mark_idle_if_empty(&canvas_id);
    }

    /// Latest snapshot for a canvas. A corrupt entry reads as absent.
    pub fn get_snapshot(&self, canvas_id: &str) -> Option<StateSnapshot> {
        let compressed = self.snapshots.get(canvas_id)?;
        match compressed.decompress() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                log::error!("Snapshot for canvas {canvas_id} unreadable: {e}");
                None
            }
        }
    }

    /// Evict logs and snapshots of canvases that have had no sessions for
    /// at least `idle_log_ttl` as of `now`.
    ///
    /// Only idle-marked canvases are visited and at most
    /// `max_evictions_per_sweep` are evicted per call. Returns the number
    /// of canvases evicted.
    pub fn sweep_idle(&mut self, now: Instant) -> usize {
        let ttl = self.config.idle_log_ttl;
        let expired: Vec<String> = self
            .idle_since
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) >= ttl)
            .map(|(canvas, _)| canvas.clone())
            .take(self.config.max_evictions_per_sweep)
            .collect();

        for canvas_id in &expired {
            self.idle_since.remove(canvas_id);
            self.snapshots.remove(canvas_id);
            if let Some(oplog) = self.logs.remove(canvas_id) {
                if oplog.version() > 0 {
                    self.evicted.insert(
                        canvas_id.clone(),
                        EvictedWatermark {
                            version: oplog.version(),
                            clock: oplog.vector_clock(),
                            evicted_at: now,
                        },
                    );
                    self.evicted_order.push_back((now, canvas_id.clone()));
                }
            }
        }
        self.expire_watermarks(now);

        if !expired.is_empty() {
            log::info!(
                "Idle sweep evicted {} canvases ({} still idle)",
                expired.len(),
                self.idle_since.len()
            );
        }
        expired.len()
    }

    /// Forget evicted watermarks older than `evicted_watermark_ttl`.
    fn expire_watermarks(&mut self, now: Instant) {
        let ttl = self.config.evicted_watermark_ttl;
        while let Some((evicted_at, _)) = self.evicted_order.front() {
            if now.saturating_duration_since(*evicted_at) < ttl {
                break;
            }
            let Some((evicted_at, canvas_id)) = self.evicted_order.pop_front() else {
                break;
            };
            // Skip entries superseded by a resume and a later eviction
            if self
                .evicted
                .get(&canvas_id)
                .is_some_and(|mark| mark.evicted_at == evicted_at)
            {
                self.evicted.remove(&canvas_id);
            }
        }
    }

    /// Number of canvases waiting out the idle TTL.
    pub fn idle_canvas_count(&self) -> usize {
        self.idle_since.len()
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            total_sessions: self.sessions.session_count(),
            total_users: self.sessions.user_count(),
            total_canvases: self.sessions.canvas_count(),
            operation_log_count: self.logs.len(),
            snapshot_count: self.snapshots.len(),
            idle_canvases: self.idle_since.len(),
            evicted_watermarks: self.evicted.len(),
        }
    }

    /// Whether the session indices agree with each other (O(n)).
    pub fn indices_consistent(&self) -> bool {
        self.sessions.indices_consistent()
    }
}

/// Run [`SyncSessionManager::sweep_idle`] every `idle_sweep_interval`.
///
/// The lock is held only for the duration of one bounded sweep. Abort the
/// returned handle to stop sweeping.
pub fn spawn_idle_sweeper(manager: SharedSessionManager) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = manager
            .lock()
            .await
            .config()
            .idle_sweep_interval
            .max(Duration::from_millis(1));

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = manager.lock().await.sweep_idle(Instant::now());
            if evicted > 0 {
                log::debug!("Idle sweeper evicted {evicted} canvases");
            }
        }
    })
}
