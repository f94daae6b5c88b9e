//! Per-connection sync sessions and the indices that locate them.
//!
//! ```text
//!   sessions:  connection ──► SyncSession
//!   by_user:   user       ──► {connection, …}
//!   by_canvas: canvas     ──► {connection, …}
//! ```
//!
//! [`SessionStore`] is the only owner of the three maps and only mutates
//! them in `insert` / `remove`, so they cannot drift apart. Empty buckets
//! are dropped immediately so user/canvas counts stay exact.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use crate::clock::VectorClock;
use crate::operation::Operation;

/// Server-side record of one live connection's sync watermark.
///
/// A user may hold several sessions (tabs, devices) but at most one per
/// canvas.
#[derive(Debug, Clone)]
pub struct SyncSession {
    user_id: String,
    canvas_id: String,
    connection_id: String,
    /// Highest canvas version the client has acknowledged
    pub last_sync_version: u64,
    /// Clock the client reported with that version
    pub last_sync_clock: VectorClock,
    /// Operations queued for a slow or offline client, FIFO
    pub pending_operations: VecDeque<Operation>,
    pub connected_at: Instant,
    pub last_activity: Instant,
}

impl SyncSession {
    pub fn new(
        user_id: impl Into<String>,
        canvas_id: impl Into<String>,
        connection_id: impl Into<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            user_id: user_id.into(),
            canvas_id: canvas_id.into(),
            connection_id: connection_id.into(),
            last_sync_version: 0,
            last_sync_clock: VectorClock::new(),
            pending_operations: VecDeque::new(),
            connected_at: now,
            last_activity: now,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn canvas_id(&self) -> &str {
        &self.canvas_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue an operation, refusing once `max_pending` are waiting.
    pub fn enqueue(&mut self, op: Operation, max_pending: usize) -> bool {
        if self.pending_operations.len() >= max_pending {
            return false;
        }
        self.pending_operations.push_back(op);
        true
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Connection, user and canvas indices over live sessions.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, SyncSession>,
    by_user: HashMap<String, HashSet<String>>,
    by_canvas: HashMap<String, HashSet<String>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session into all three indices, creating buckets on demand.
    ///
    /// A session already registered under the same connection id is
    /// removed first and returned.
    pub fn insert(&mut self, session: SyncSession) -> Option<SyncSession> {
        let replaced = self.remove(&session.connection_id);

        self.by_user
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.connection_id.clone());
        self.by_canvas
            .entry(session.canvas_id.clone())
            .or_default()
            .insert(session.connection_id.clone());
        self.sessions.insert(session.connection_id.clone(), session);

        replaced
    }

    /// Remove a session from all three indices, dropping empty buckets.
    pub fn remove(&mut self, connection_id: &str) -> Option<SyncSession> {
        let session = self.sessions.remove(connection_id)?;
        Self::unlink(&mut self.by_user, &session.user_id, connection_id);
        Self::unlink(&mut self.by_canvas, &session.canvas_id, connection_id);
        Some(session)
    }

    fn unlink(index: &mut HashMap<String, HashSet<String>>, key: &str, connection_id: &str) {
        if let Some(bucket) = index.get_mut(key) {
            bucket.remove(connection_id);
            if bucket.is_empty() {
                index.remove(key);
            }
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<&SyncSession> {
        self.sessions.get(connection_id)
    }

    pub fn get_mut(&mut self, connection_id: &str) -> Option<&mut SyncSession> {
        self.sessions.get_mut(connection_id)
    }

    /// Connection id of `user_id`'s session on `canvas_id`, if any.
    pub fn find(&self, user_id: &str, canvas_id: &str) -> Option<&str> {
        self.by_user
            .get(user_id)?
            .iter()
            .find(|conn| {
                self.sessions
                    .get(conn.as_str())
                    .is_some_and(|s| s.canvas_id == canvas_id)
            })
            .map(String::as_str)
    }

    /// Live sessions on a canvas.
    pub fn canvas_sessions(&self, canvas_id: &str) -> Vec<&SyncSession> {
        self.bucket_sessions(self.by_canvas.get(canvas_id))
    }

    /// Live sessions held by a user across canvases.
    pub fn user_sessions(&self, user_id: &str) -> Vec<&SyncSession> {
        self.bucket_sessions(self.by_user.get(user_id))
    }

    fn bucket_sessions(&self, bucket: Option<&HashSet<String>>) -> Vec<&SyncSession> {
        bucket
            .map(|conns| {
                conns
                    .iter()
                    .filter_map(|conn| self.sessions.get(conn))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_canvas(&self, canvas_id: &str) -> bool {
        self.by_canvas.contains_key(canvas_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    pub fn canvas_count(&self) -> usize {
        self.by_canvas.len()
    }

    /// Check that every session sits in exactly its own user and canvas
    /// bucket, that every bucket entry resolves to a session, and that no
    /// bucket is empty. O(n); meant for tests.
    pub fn indices_consistent(&self) -> bool {
        let sessions_linked = self.sessions.iter().all(|(conn, s)| {
            conn == &s.connection_id
                && self.by_user.get(&s.user_id).is_some_and(|b| b.contains(conn))
                && self.by_canvas.get(&s.canvas_id).is_some_and(|b| b.contains(conn))
        });

        let user_entries: usize = self.by_user.values().map(HashSet::len).sum();
        let canvas_entries: usize = self.by_canvas.values().map(HashSet::len).sum();

        let buckets_resolve = self.by_user.iter().all(|(user, bucket)| {
            !bucket.is_empty()
                && bucket
                    .iter()
                    .all(|c| self.sessions.get(c).is_some_and(|s| &s.user_id == user))
        }) && self.by_canvas.iter().all(|(canvas, bucket)| {
            !bucket.is_empty()
                && bucket
                    .iter()
                    .all(|c| self.sessions.get(c).is_some_and(|s| &s.canvas_id == canvas))
        });

        sessions_linked
            && buckets_resolve
            && user_entries == self.sessions.len()
            && canvas_entries == self.sessions.len()
    }
}
