//! Vector clocks for happens-before and concurrency detection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Unique identifier for a storage node in the cluster.
pub type NodeId = String;

/// Relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Both clocks carry identical history
    Equal,
    /// The left clock has seen everything the right one has, and more
    Dominates,
    /// The right clock has seen everything the left one has, and more
    Dominated,
    /// Each side has writes the other has not seen
    Concurrent,
}

/// Map from node id to a per-node monotonic write counter.
///
/// Nodes with no entry count as 0, so clocks from clusters with
/// different write histories compare correctly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: HashMap<NodeId, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a node; missing entries are 0.
    #[must_use]
    pub fn get(&self, node: &str) -> u64 {
        self.counters.get(node).copied().unwrap_or(0)
    }

    /// Record one write by `node`.
    pub fn increment(&mut self, node: &str) {
        *self.counters.entry(node.to_string()).or_insert(0) += 1;
    }

    /// Number of nodes that have ever written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// True when no node has written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Element-wise maximum of two clocks.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut counters = self.counters.clone();
        for (node, &count) in &other.counters {
            let entry = counters.entry(node.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
        Self { counters }
    }

    /// Fold another clock into this one (element-wise maximum).
    pub fn merge(&mut self, other: &Self) {
        for (node, &count) in &other.counters {
            let entry = self.counters.entry(node.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    /// Compare two clocks.
    #[must_use]
    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut any_greater = false;
        let mut any_less = false;

        for node in self.counters.keys().chain(other.counters.keys()) {
            let left = self.get(node);
            let right = other.get(node);
            if left > right {
                any_greater = true;
            } else if left < right {
                any_less = true;
            }
        }

        match (any_greater, any_less) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Dominates,
            (false, true) => ClockOrdering::Dominated,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True when this clock strictly dominates `other`.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Dominates
    }

    /// True when neither clock dominates and they are not equal.
    #[must_use]
    pub fn concurrent_with(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// Iterate over (node, counter) entries.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.counters.iter()
    }
}
