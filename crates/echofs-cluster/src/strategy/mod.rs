//! Replication strategies.
//!
//! The replication manager dispatches every operation to one of two
//! strategies: synchronous quorum replication or asynchronous
//! primary-ack replication. Both implement [`ReplicationStrategy`] so
//! the dispatch stays a mode switch rather than a type decision.

mod async_repl;
mod sync;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use echofs_core::{ChunkRef, ObjectMeta};

use crate::error::ClusterResult;

pub use async_repl::{AsyncStrategy, ReplicationTask};
pub use sync::SyncStrategy;

/// Which strategy handled an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Synchronous quorum replication
    Sync,
    /// Asynchronous primary-ack replication
    Async,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
        }
    }
}

/// Result of an acknowledged write.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// Version the write embedded
    pub version: u64,
    /// Replicas that acked before the strategy returned
    pub replicas_acked: usize,
    /// Ids of the acking nodes, coordinator first
    pub acked_nodes: Vec<String>,
    /// Time from dispatch to ack
    pub latency: Duration,
}

/// A replication strategy: how a chunk write fans out and how a read
/// picks a replica.
#[async_trait]
pub trait ReplicationStrategy: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> StrategyKind;

    /// Replicate one chunk write.
    ///
    /// The chunk reference carries the pre-allocated version; the
    /// object's `last_version` is only advanced by the caller after an
    /// ack, so failed writes never advance it.
    ///
    /// # Errors
    ///
    /// Returns the strategy's failure mode: `QuorumFailed`,
    /// `InsufficientReplicas`, `NoReplicas`, `Timeout`, or a transport
    /// error from the primary.
    async fn write(
        &self,
        meta: &ObjectMeta,
        chunk: &ChunkRef,
        data: Vec<u8>,
    ) -> ClusterResult<WriteOutcome>;

    /// Read one chunk, trying replicas in preference order.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown chunk or `AllReplicasDown`
    /// when no replica serves it.
    async fn read(&self, meta: &ObjectMeta, chunk_id: Uuid) -> ClusterResult<Vec<u8>>;

    /// Counter snapshot.
    fn stats(&self) -> StrategyStatsSnapshot;
}

const LATENCY_ALPHA: f64 = 0.1;

/// Lock-free operation counters kept by each strategy.
#[derive(Debug, Default)]
pub struct StrategyStats {
    writes_total: AtomicU64,
    writes_success: AtomicU64,
    writes_failed: AtomicU64,
    quorum_failures: AtomicU64,
    reads_total: AtomicU64,
    reads_failed: AtomicU64,
    backpressure_drops: AtomicU64,
    retries_exhausted: AtomicU64,
    tasks_replicated: AtomicU64,
    flush_ticks: AtomicU64,
    latency_ewma_us: AtomicU64,
}

impl StrategyStats {
    /// Fresh zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a write attempt.
    pub fn record_write(&self) {
        self.writes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acked write and fold its latency into the average.
    pub fn record_write_success(&self, latency: Duration) {
        self.writes_success.fetch_add(1, Ordering::Relaxed);
        let sample = latency.as_micros() as u64;
        let current = self.latency_ewma_us.load(Ordering::Relaxed);
        let next = if current == 0 {
            sample
        } else {
            (LATENCY_ALPHA * sample as f64 + (1.0 - LATENCY_ALPHA) * current as f64) as u64
        };
        self.latency_ewma_us.store(next, Ordering::Relaxed);
    }

    /// Record a failed write.
    pub fn record_write_failure(&self) {
        self.writes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write abandoned for lack of quorum.
    pub fn record_quorum_failure(&self) {
        self.quorum_failures.fetch_add(1, Ordering::Relaxed);
        self.writes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a read attempt.
    pub fn record_read(&self) {
        self.reads_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a read that found no serving replica.
    pub fn record_read_failure(&self) {
        self.reads_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a background task dropped at a full queue.
    pub fn record_backpressure_drop(&self) {
        self.backpressure_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a background task that ran out of retries.
    pub fn record_retries_exhausted(&self) {
        self.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a background task fully replicated.
    pub fn record_task_replicated(&self) {
        self.tasks_replicated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one flush tick.
    pub fn record_flush_tick(&self) {
        self.flush_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> StrategyStatsSnapshot {
        StrategyStatsSnapshot {
            writes_total: self.writes_total.load(Ordering::Relaxed),
            writes_success: self.writes_success.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
            quorum_failures: self.quorum_failures.load(Ordering::Relaxed),
            reads_total: self.reads_total.load(Ordering::Relaxed),
            reads_failed: self.reads_failed.load(Ordering::Relaxed),
            backpressure_drops: self.backpressure_drops.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            tasks_replicated: self.tasks_replicated.load(Ordering::Relaxed),
            flush_ticks: self.flush_ticks.load(Ordering::Relaxed),
            latency_ewma_ms: self.latency_ewma_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Serializable view of [`StrategyStats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyStatsSnapshot {
    /// Write attempts
    pub writes_total: u64,
    /// Acked writes
    pub writes_success: u64,
    /// Failed writes
    pub writes_failed: u64,
    /// Writes abandoned for lack of quorum
    pub quorum_failures: u64,
    /// Read attempts
    pub reads_total: u64,
    /// Reads with no serving replica
    pub reads_failed: u64,
    /// Background tasks dropped at a full queue
    pub backpressure_drops: u64,
    /// Background tasks that ran out of retries
    pub retries_exhausted: u64,
    /// Background tasks fully replicated
    pub tasks_replicated: u64,
    /// Flush ticks observed
    pub flush_ticks: u64,
    /// Smoothed ack latency in milliseconds
    pub latency_ewma_ms: f64,
}
