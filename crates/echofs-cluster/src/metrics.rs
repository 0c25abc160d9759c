//! Cluster metrics for monitoring the controller and replication
//! engine.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Controller and dispatch counters.
#[derive(Debug, Default)]
pub struct ClusterMetrics {
    /// Evaluation cycles completed
    cycles_total: AtomicU64,
    /// Cycles skipped for missing metrics
    cycles_skipped: AtomicU64,
    /// Mode transitions enacted
    transitions_total: AtomicU64,
    /// Emergency activations
    emergency_activations: AtomicU64,
    /// Admin commands processed
    commands_processed: AtomicU64,
    /// Writes routed to the sync strategy
    writes_sync: AtomicU64,
    /// Writes routed to the async strategy
    writes_async: AtomicU64,
    /// Reads routed
    reads_total: AtomicU64,
}

impl ClusterMetrics {
    /// Fresh zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed evaluation cycle.
    pub fn record_cycle(&self) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cycle skipped because metrics were unavailable.
    pub fn record_cycle_skipped(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an enacted mode transition.
    pub fn record_transition(&self) {
        self.transitions_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an emergency activation.
    pub fn record_emergency(&self) {
        self.emergency_activations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one processed admin command.
    pub fn record_command(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write routed to the sync strategy.
    pub fn record_sync_write(&self) {
        self.writes_sync.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write routed to the async strategy.
    pub fn record_async_write(&self) {
        self.writes_async.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a routed read.
    pub fn record_read(&self) {
        self.reads_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> ClusterMetricsSnapshot {
        ClusterMetricsSnapshot {
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            transitions_total: self.transitions_total.load(Ordering::Relaxed),
            emergency_activations: self.emergency_activations.load(Ordering::Relaxed),
            commands_processed: self.commands_processed.load(Ordering::Relaxed),
            writes_sync: self.writes_sync.load(Ordering::Relaxed),
            writes_async: self.writes_async.load(Ordering::Relaxed),
            reads_total: self.reads_total.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`ClusterMetrics`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterMetricsSnapshot {
    /// Evaluation cycles completed
    pub cycles_total: u64,
    /// Cycles skipped for missing metrics
    pub cycles_skipped: u64,
    /// Mode transitions enacted
    pub transitions_total: u64,
    /// Emergency activations
    pub emergency_activations: u64,
    /// Admin commands processed
    pub commands_processed: u64,
    /// Writes routed to the sync strategy
    pub writes_sync: u64,
    /// Writes routed to the async strategy
    pub writes_async: u64,
    /// Reads routed
    pub reads_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = ClusterMetrics::new();
        metrics.record_cycle();
        metrics.record_cycle();
        metrics.record_cycle_skipped();
        metrics.record_transition();
        metrics.record_sync_write();
        metrics.record_async_write();

        let snap = metrics.snapshot();
        assert_eq!(snap.cycles_total, 2);
        assert_eq!(snap.cycles_skipped, 1);
        assert_eq!(snap.transitions_total, 1);
        assert_eq!(snap.writes_sync, 1);
        assert_eq!(snap.writes_async, 1);
    }
}
