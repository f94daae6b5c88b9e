//! Per-canvas append-only operation log.
//!
//! Architecture:
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                 OperationLog (canvas)              │
//! │                                                   │
//! │  pruned ┆ op v4 │ op v5 │ op v6 │ op v7  ◄── append│
//! │   ≤ v3  ┆                                         │
//! │                                                   │
//! │  version: 7        clock: {node-a: 6, node-b: 1}  │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! `record_operation` is the only place versions are allocated, so the
//! sequence is gap-free and strictly increasing as long as calls for one
//! canvas are serialized (the manager's `&mut self` guarantees that).
//! With a retention cap the oldest operations are dropped, but version and
//! clock never roll back. A log recreated after eviction is
//! [`resume`](OperationLog::resume)d above the evicted one's version.
//!
//! Versions are local to this node. Replicated operations keep the clock
//! they were stamped with at their origin, so a client's clock (unlike its
//! version) can be checked against any replica with
//! [`delta_for_clock`](OperationLog::delta_for_clock).
//!
//! Reference: Kleppmann, DDIA, Chapter 11 (Log-based Message Brokers)

use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::operation::{NewOperation, Operation};
use crate::snapshot::StateDelta;

/// Ordered record of one canvas's edits on this node.
#[derive(Debug, Clone)]
pub struct OperationLog {
    /// Clock entry advanced by this log
    node_id: String,
    /// Retained operations, ascending by version
    operations: VecDeque<Operation>,
    /// Ids of retained operations (replica dedup)
    ids: HashSet<Uuid>,
    /// Highest allocated version (0 = empty)
    version: u64,
    clock: VectorClock,
    /// Retention cap (None = keep everything)
    max_operations: Option<usize>,
    /// Highest version dropped by retention
    pruned_through: u64,
    /// Merge of every dropped operation's clock
    pruned_clock: VectorClock,
}

impl OperationLog {
    /// Create an unbounded log whose clock entries are stamped as `node_id`.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            operations: VecDeque::new(),
            ids: HashSet::new(),
            version: 0,
            clock: VectorClock::new(),
            max_operations: None,
            pruned_through: 0,
            pruned_clock: VectorClock::new(),
        }
    }

    /// Create a log that retains at most `max_operations` operations.
    pub fn with_retention(node_id: impl Into<String>, max_operations: usize) -> Self {
        let mut log = Self::new(node_id);
        log.max_operations = Some(max_operations.max(1));
        log
    }

    /// Continue a canvas's history after its previous log was evicted.
    ///
    /// Versions restart above `version` and everything up to it counts as
    /// pruned, so clients holding an older watermark are sent to a snapshot
    /// instead of being matched against reissued versions.
    pub fn resume(
        node_id: impl Into<String>,
        max_operations: Option<usize>,
        version: u64,
        clock: VectorClock,
    ) -> Self {
        let mut log = match max_operations {
            Some(max) => Self::with_retention(node_id, max),
            None => Self::new(node_id),
        };
        log.version = version;
        log.pruned_through = version;
        log.pruned_clock = clock.clone();
        log.clock = clock;
        log
    }

    /// Record a local edit: allocate the next version, advance this node's
    /// clock entry, and append.
    pub fn record_operation(&mut self, new: NewOperation) -> Operation {
        let version = self.version + 1;
        let clock = self.clock.increment(&self.node_id);
        let op = Operation::stamp(new, version, clock);
        self.append(op.clone());

        log::debug!(
            "Recorded {} on {} ({}) as v{version}",
            op.op_type,
            op.target_id,
            op.user_id
        );
        op
    }

    /// Record an operation forwarded from another node into this replica.
    ///
    /// The operation keeps its origin clock, which is merged into the log
    /// clock, and gets a local version through the same path as local
    /// edits. Returns `None` if the log has already seen it, including
    /// operations since dropped by retention.
    pub fn record_remote(&mut self, remote: &Operation) -> Option<Operation> {
        if self.ids.contains(&remote.id) || self.clock.dominates(&remote.vector_clock) {
            log::debug!("Ignoring already seen remote operation {}", remote.id);
            return None;
        }

        let op = Operation::restamp(remote, self.version + 1);
        let version = op.version;
        self.append(op.clone());

        log::debug!(
            "Ingested remote {} ({}) as v{version}",
            op.id,
            op.op_type
        );
        Some(op)
    }

    fn append(&mut self, op: Operation) {
        self.version = op.version;
        self.clock = self.clock.merge(&op.vector_clock);
        self.ids.insert(op.id);
        self.operations.push_back(op);
        self.prune();
    }

    fn prune(&mut self) {
        let Some(max) = self.max_operations else {
            return;
        };
        while self.operations.len() > max {
            if let Some(dropped) = self.operations.pop_front() {
                self.ids.remove(&dropped.id);
                self.pruned_through = dropped.version;
                self.pruned_clock = self.pruned_clock.merge(&dropped.vector_clock);
            }
        }
    }

    /// Current max version (0 if nothing recorded).
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Clone of the current clock.
    pub fn vector_clock(&self) -> VectorClock {
        self.clock.clone()
    }

    /// Operations with `version > since`, ascending.
    pub fn operations_since(&self, since: u64) -> Vec<Operation> {
        let start = self.operations.partition_point(|op| op.version <= since);
        self.operations.range(start..).cloned().collect()
    }

    /// Operations addressed to `target_id`, in recorded order.
    pub fn operations_for_target(&self, target_id: &str) -> Vec<Operation> {
        self.operations
            .iter()
            .filter(|op| op.target_id == target_id)
            .cloned()
            .collect()
    }

    /// Operations in `(from_version, version()]` for `canvas_id`.
    pub fn delta(&self, canvas_id: &str, from_version: u64) -> StateDelta {
        StateDelta {
            canvas_id: canvas_id.to_string(),
            from_version,
            to_version: self.version,
            operations: self.operations_since(from_version),
        }
    }

    /// Whether every operation after `version` is still retained.
    ///
    /// False means retention dropped history the client never saw and it
    /// needs a snapshot before the delta.
    pub fn can_serve_delta_from(&self, version: u64) -> bool {
        version >= self.pruned_through
    }

    /// Retained operations a client whose state reflects `seen` is missing.
    ///
    /// `from_version` is the version just before the first missing
    /// operation; operations in between that `seen` already covers are left
    /// out. `None` when nothing is missing.
    pub fn delta_for_clock(&self, canvas_id: &str, seen: &VectorClock) -> Option<StateDelta> {
        let missing: Vec<Operation> = self
            .operations
            .iter()
            .filter(|op| !seen.dominates(&op.vector_clock))
            .cloned()
            .collect();
        let first = missing.first()?.version;

        Some(StateDelta {
            canvas_id: canvas_id.to_string(),
            from_version: first - 1,
            to_version: self.version,
            operations: missing,
        })
    }

    /// Whether a client at `seen` has observed everything retention dropped.
    pub fn can_serve_delta_for_clock(&self, seen: &VectorClock) -> bool {
        seen.dominates(&self.pruned_clock)
    }

    /// Reset to empty. Breaks every client tracking a prior version, so
    /// this is only for tests and explicit resets.
    pub fn clear(&mut self) {
        self.operations.clear();
        self.ids.clear();
        self.version = 0;
        self.clock = VectorClock::new();
        self.pruned_through = 0;
        self.pruned_clock = VectorClock::new();
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Number of retained operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
