//! Vector clocks for causal ordering of canvas edits.
//!
//! Each server process (node) owns one entry. A clock is a value: every
//! operation returns a new clock and leaves the receiver untouched, so a
//! clock stamped on an [`Operation`](crate::operation::Operation) can never
//! drift after the fact.
//!
//! ```text
//!   A = {s1: 3, s2: 1}        B = {s1: 1, s2: 5}
//!
//!   s1: 3 > 1  → A ≰ B
//!   s2: 1 < 5  → B ≰ A        ⇒ concurrent
//! ```
//!
//! Wire format is a JSON object of node id → non-negative integer.
//! Deserialization never fails: a malformed clock degrades to the empty
//! clock (worst case the client gets a full resync).
//!
//! Reference: Kleppmann, DDIA, Chapter 5 (Detecting Concurrent Writes)

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockOrdering {
    /// Every component of the left clock is ≤ the right one, at least one <.
    Before,
    /// Every component of the right clock is ≤ the left one, at least one <.
    After,
    /// Neither clock precedes the other.
    Concurrent,
    /// Identical on every component.
    Equal,
}

/// Node id → logical counter. Absent keys read as 0.
///
/// Zero entries are never stored, so structural equality matches
/// causal equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, u64>", into = "BTreeMap<String, u64>")]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `node` (0 if absent).
    pub fn get(&self, node: &str) -> u64 {
        self.entries.get(node).copied().unwrap_or(0)
    }

    /// Return a new clock with `node` advanced by one.
    pub fn increment(&self, node: &str) -> Self {
        let mut next = self.clone();
        *next.entries.entry(node.to_string()).or_insert(0) += 1;
        next
    }

    /// Component-wise max over the union of both key sets.
    pub fn merge(&self, other: &VectorClock) -> Self {
        let mut merged = self.clone();
        for (node, &count) in &other.entries {
            let entry = merged.entries.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
        merged
    }

    /// Compare two clocks over the union of their keys.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_le = true;
        let mut other_le = true;

        for node in self.entries.keys().chain(other.entries.keys()) {
            let a = self.get(node);
            let b = other.get(node);
            if a > b {
                self_le = false;
            }
            if b > a {
                other_le = false;
            }
            if !self_le && !other_le {
                return ClockOrdering::Concurrent;
            }
        }

        match (self_le, other_le) {
            (true, true) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (false, false) => ClockOrdering::Concurrent,
        }
    }

    /// `self` has seen everything `other` has (after or equal).
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::After | ClockOrdering::Equal
        )
    }

    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// Encode as a JSON object string.
    pub fn encode(&self) -> String {
        serde_json::to_string(&self.entries).unwrap_or_else(|_| "{}".to_string())
    }

    /// Decode a clock produced by [`encode`](Self::encode).
    ///
    /// Malformed input yields an empty clock.
    pub fn decode(encoded: &str) -> Self {
        match serde_json::from_str::<BTreeMap<String, u64>>(encoded) {
            Ok(entries) => Self::from(entries),
            Err(e) => {
                log::warn!("Discarding malformed vector clock ({e}); assuming empty");
                Self::new()
            }
        }
    }

    /// Number of nodes with a non-zero counter.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(node, counter)` pairs in node order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(node, &count)| (node.as_str(), count))
    }
}

impl From<BTreeMap<String, u64>> for VectorClock {
    fn from(mut entries: BTreeMap<String, u64>) -> Self {
        entries.retain(|_, count| *count > 0);
        Self { entries }
    }
}

impl From<VectorClock> for BTreeMap<String, u64> {
    fn from(clock: VectorClock) -> Self {
        clock.entries
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        let entries: BTreeMap<String, u64> =
            iter.into_iter().map(|(node, count)| (node.into(), count)).collect();
        Self::from(entries)
    }
}

/// Causal partial order: `None` for concurrent clocks.
impl PartialOrd for VectorClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.compare(other) {
            ClockOrdering::Before => Some(Ordering::Less),
            ClockOrdering::After => Some(Ordering::Greater),
            ClockOrdering::Equal => Some(Ordering::Equal),
            ClockOrdering::Concurrent => None,
        }
    }
}
