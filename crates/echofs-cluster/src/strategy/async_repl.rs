//! Asynchronous replication: primary-ack writes with background
//! fan-out.
//!
//! A write is acked as soon as the primary stores it. Remaining
//! replicas are populated by a fixed pool of background workers
//! draining a bounded queue; a full queue drops the task and only
//! costs opportunistic redundancy, never the acked data.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use echofs_core::{ChunkRef, MetaStore, ObjectMeta};

use crate::config::{ReplicationConfig, WorkerAddr};
use crate::error::{ClusterError, ClusterResult};
use crate::pool::WorkerPool;
use crate::strategy::{
    ReplicationStrategy, StrategyKind, StrategyStats, StrategyStatsSnapshot, WriteOutcome,
};
use crate::transport::{WorkerTransport, WriteChunkRequest};

const LAG_ALPHA: f64 = 0.2;

/// One queued background replication unit.
///
/// Tasks are immutable; a retry is a fresh task with the counter
/// incremented and only the still-missing targets.
#[derive(Debug, Clone)]
pub struct ReplicationTask {
    /// Task identifier
    pub task_id: Uuid,
    /// Object being replicated
    pub object_id: String,
    /// Chunk being replicated
    pub chunk_id: Uuid,
    /// Chunk position
    pub index: u32,
    /// Content checksum
    pub checksum: String,
    /// Chunk bytes
    pub data: Vec<u8>,
    /// Version the write embedded
    pub version: u64,
    /// Replicas still missing the chunk
    pub targets: Vec<WorkerAddr>,
    /// When the task entered the queue
    pub enqueued_at: Instant,
    /// Re-enqueue count so far
    pub retries: u32,
}

struct AsyncShared {
    pool: Arc<WorkerPool>,
    transport: Arc<dyn WorkerTransport>,
    store: Arc<MetaStore>,
    config: ReplicationConfig,
    stats: StrategyStats,
    queue_tx: mpsc::Sender<ReplicationTask>,
    queue_depth: AtomicUsize,
    lag_ewma_ms: AtomicU64,
}

impl AsyncShared {
    fn offer(&self, task: ReplicationTask) -> bool {
        match self.queue_tx.try_send(task) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                let task = match err {
                    mpsc::error::TrySendError::Full(task)
                    | mpsc::error::TrySendError::Closed(task) => task,
                };
                warn!(
                    object_id = %task.object_id,
                    chunk_id = %task.chunk_id,
                    retries = task.retries,
                    "Replication queue full, dropping task"
                );
                self.stats.record_backpressure_drop();
                false
            }
        }
    }

    fn observe_dequeue(&self, task: &ReplicationTask) {
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
        let wait_ms = task.enqueued_at.elapsed().as_millis() as u64;
        let current = self.lag_ewma_ms.load(Ordering::Relaxed);
        let next = if current == 0 {
            wait_ms
        } else {
            (LAG_ALPHA * wait_ms as f64 + (1.0 - LAG_ALPHA) * current as f64) as u64
        };
        self.lag_ewma_ms.store(next, Ordering::Relaxed);
    }

    /// Write the task's chunk to every target; returns the targets that
    /// still failed.
    async fn replicate(&self, task: &ReplicationTask) -> Vec<WorkerAddr> {
        let request = WriteChunkRequest {
            object_id: task.object_id.clone(),
            chunk_id: task.chunk_id,
            index: task.index,
            version: task.version,
            checksum: task.checksum.clone(),
            data: task.data.clone(),
        };

        let mut acked = Vec::new();
        let mut failed = Vec::new();
        for target in &task.targets {
            let started = Instant::now();
            match self
                .transport
                .write_chunk(target, &request, self.config.async_write_timeout)
                .await
            {
                Ok(_) => {
                    self.pool.mark_healthy(&target.id, started.elapsed()).await;
                    acked.push(target.id.clone());
                }
                Err(err) => {
                    self.pool.mark_unhealthy(&target.id, &err.to_string()).await;
                    failed.push(target.clone());
                }
            }
        }

        if !acked.is_empty() {
            self.record_replicas(task, &acked, failed.is_empty()).await;
        }
        failed
    }

    /// Fold freshly acked replicas into the stored metadata.
    async fn record_replicas(&self, task: &ReplicationTask, acked: &[String], complete: bool) {
        let Some(mut meta) = self.store.try_get(&task.object_id).await else {
            return;
        };
        let Some(chunk) = meta.chunks.iter_mut().find(|c| c.chunk_id == task.chunk_id) else {
            return;
        };
        for node in acked {
            chunk.workers.insert(node.clone());
        }
        if complete {
            meta.last_sync_ts = Some(Utc::now());
        }
        if let Err(err) = self.store.put(meta).await {
            warn!(
                object_id = %task.object_id,
                error = %err,
                "Failed to record background replicas"
            );
        }
    }

    async fn handle(&self, task: ReplicationTask) {
        self.observe_dequeue(&task);

        let failed = self.replicate(&task).await;
        if failed.is_empty() {
            self.stats.record_task_replicated();
            debug!(
                object_id = %task.object_id,
                chunk_id = %task.chunk_id,
                targets = task.targets.len(),
                "Background replication complete"
            );
            return;
        }

        let retries = task.retries + 1;
        if retries < self.config.max_retries {
            let retry = ReplicationTask {
                task_id: Uuid::new_v4(),
                targets: failed,
                enqueued_at: Instant::now(),
                retries,
                ..task
            };
            debug!(
                object_id = %retry.object_id,
                chunk_id = %retry.chunk_id,
                retries,
                remaining_targets = retry.targets.len(),
                "Re-enqueueing replication task"
            );
            self.offer(retry);
        } else {
            warn!(
                object_id = %task.object_id,
                chunk_id = %task.chunk_id,
                retries,
                "Replication task exhausted retries"
            );
            self.stats.record_retries_exhausted();
        }
    }
}

/// Async strategy: primary-ack writes plus a background worker pool.
pub struct AsyncStrategy {
    shared: Arc<AsyncShared>,
    queue_rx: Mutex<Option<mpsc::Receiver<ReplicationTask>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for AsyncStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncStrategy")
            .field("queue_size", &self.shared.config.async_queue_size)
            .field("workers", &self.shared.config.async_workers)
            .finish_non_exhaustive()
    }
}

impl AsyncStrategy {
    /// Build the strategy; call [`AsyncStrategy::start`] to spawn the
    /// background workers.
    #[must_use]
    pub fn new(
        pool: Arc<WorkerPool>,
        transport: Arc<dyn WorkerTransport>,
        store: Arc<MetaStore>,
        config: ReplicationConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.async_queue_size);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(AsyncShared {
                pool,
                transport,
                store,
                config,
                stats: StrategyStats::new(),
                queue_tx,
                queue_depth: AtomicUsize::new(0),
                lag_ewma_ms: AtomicU64::new(0),
            }),
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown_tx,
        }
    }

    /// Spawn the background worker pool and the flush tick.
    ///
    /// Idempotent: the second call is a no-op.
    pub async fn start(&self) {
        let Some(queue_rx) = self.queue_rx.lock().await.take() else {
            return;
        };
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        info!(
            workers = self.shared.config.async_workers,
            queue_size = self.shared.config.async_queue_size,
            "Starting async replication workers"
        );

        for worker in 0..self.shared.config.async_workers {
            let shared = Arc::clone(&self.shared);
            let queue_rx = Arc::clone(&queue_rx);
            let mut shutdown = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                loop {
                    let task = tokio::select! {
                        task = async { queue_rx.lock().await.recv().await } => task,
                        _ = shutdown.changed() => None,
                    };
                    let Some(task) = task else {
                        debug!(worker, "Replication worker stopped");
                        break;
                    };
                    shared.handle(task).await;
                }
            });
        }

        // Flush tick, reserved for batched operations.
        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(shared.config.async_flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        shared.stats.record_flush_tick();
                        debug!(
                            depth = shared.queue_depth.load(Ordering::Relaxed),
                            "Async flush tick"
                        );
                    }
                    _ = shutdown.changed() => {
                        debug!("Flush worker stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Signal the background workers to stop after their current task.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Current queue depth.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.shared.queue_depth.load(Ordering::Relaxed)
    }

    /// Smoothed queue drain time; the staleness bound for reads.
    #[must_use]
    pub fn replication_lag(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shared.lag_ewma_ms.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl ReplicationStrategy for AsyncStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Async
    }

    async fn write(
        &self,
        meta: &ObjectMeta,
        chunk: &ChunkRef,
        data: Vec<u8>,
    ) -> ClusterResult<WriteOutcome> {
        let shared = &self.shared;
        shared.stats.record_write();

        let primary = match shared.pool.select(1).await {
            Ok(mut nodes) => nodes.remove(0),
            Err(ClusterError::InsufficientReplicas { healthy: 0, .. }) => {
                shared.stats.record_write_failure();
                return Err(ClusterError::NoReplicas);
            }
            Err(err) => {
                shared.stats.record_write_failure();
                return Err(err);
            }
        };

        let request = WriteChunkRequest {
            object_id: meta.object_id.clone(),
            chunk_id: chunk.chunk_id,
            index: chunk.index,
            version: chunk.version,
            checksum: chunk.checksum.clone(),
            data: data.clone(),
        };

        let started = Instant::now();
        match shared
            .transport
            .write_chunk(&primary, &request, shared.config.write_timeout)
            .await
        {
            Ok(_) => {
                shared.pool.mark_healthy(&primary.id, started.elapsed()).await;
            }
            Err(err) => {
                shared.pool.mark_unhealthy(&primary.id, &err.to_string()).await;
                shared.stats.record_write_failure();
                return Err(err);
            }
        }
        let latency = started.elapsed();

        // Remaining replicas are populated opportunistically.
        let mut targets = shared
            .pool
            .ranked_healthy(std::slice::from_ref(&primary.id))
            .await;
        targets.truncate(shared.config.replication_factor.saturating_sub(1));
        if !targets.is_empty() {
            shared.offer(ReplicationTask {
                task_id: Uuid::new_v4(),
                object_id: meta.object_id.clone(),
                chunk_id: chunk.chunk_id,
                index: chunk.index,
                checksum: chunk.checksum.clone(),
                data,
                version: chunk.version,
                targets,
                enqueued_at: Instant::now(),
                retries: 0,
            });
        }

        shared.stats.record_write_success(latency);
        debug!(
            object_id = %meta.object_id,
            version = chunk.version,
            primary = %primary.id,
            latency_ms = latency.as_millis() as u64,
            "Primary write acked"
        );

        Ok(WriteOutcome {
            version: chunk.version,
            replicas_acked: 1,
            acked_nodes: vec![primary.id],
            latency,
        })
    }

    async fn read(&self, meta: &ObjectMeta, chunk_id: Uuid) -> ClusterResult<Vec<u8>> {
        let shared = &self.shared;
        shared.stats.record_read();

        let chunk = meta.chunk_by_id(chunk_id).ok_or_else(|| {
            ClusterError::NotFound(format!("{}/{}", meta.object_id, chunk_id))
        })?;

        let candidates: Vec<String> = chunk.workers.iter().cloned().collect();
        let ordered = shared.pool.order_preference(&candidates).await;
        if ordered.is_empty() {
            shared.stats.record_read_failure();
            return Err(ClusterError::AllReplicasDown(meta.object_id.clone()));
        }

        // Reads may observe stale data; staleness is bounded by the
        // queue drain time and worker health.
        for node in ordered {
            let started = Instant::now();
            match shared
                .transport
                .read_chunk(&node, &meta.object_id, chunk_id, shared.config.write_timeout)
                .await
            {
                Ok(bytes) => {
                    shared.pool.mark_healthy(&node.id, started.elapsed()).await;
                    return Ok(bytes);
                }
                Err(err) => {
                    debug!(node = %node.id, error = %err, "Replica read failed, trying next");
                    shared.pool.mark_unhealthy(&node.id, &err.to_string()).await;
                }
            }
        }

        shared.stats.record_read_failure();
        Err(ClusterError::AllReplicasDown(meta.object_id.clone()))
    }

    fn stats(&self) -> StrategyStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::transport::{InMemoryTransport, NodeBehavior};
    use echofs_core::{ModeHint, StoreConfig};
    use std::time::Duration;

    struct Fixture {
        pool: Arc<WorkerPool>,
        transport: Arc<InMemoryTransport>,
        store: Arc<MetaStore>,
        strategy: AsyncStrategy,
        _dir: tempfile::TempDir,
    }

    async fn setup(n: usize, config: ReplicationConfig) -> Fixture {
        let pool = Arc::new(WorkerPool::new(PoolConfig {
            workers: (1..=n)
                .map(|i| WorkerAddr::new(format!("n{i}"), format!("http://n{i}.local")))
                .collect(),
            ..Default::default()
        }));
        let transport = Arc::new(InMemoryTransport::new());
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MetaStore::open(dir.path(), StoreConfig::default())
                .await
                .unwrap(),
        );

        let strategy = AsyncStrategy::new(
            Arc::clone(&pool),
            Arc::clone(&transport) as Arc<dyn WorkerTransport>,
            Arc::clone(&store),
            config,
        );
        Fixture {
            pool,
            transport,
            store,
            strategy,
            _dir: dir,
        }
    }

    fn object() -> (ObjectMeta, ChunkRef) {
        let meta = ObjectMeta::new("obj1", ModeHint::Available);
        let chunk = ChunkRef::new(0, 4, "crc", meta.next_version());
        (meta, chunk)
    }

    #[tokio::test]
    async fn test_primary_ack_without_workers_started() {
        let fx = setup(3, ReplicationConfig::default()).await;
        let (meta, chunk) = object();

        let outcome = fx
            .strategy
            .write(&meta, &chunk, b"data".to_vec())
            .await
            .unwrap();
        assert_eq!(outcome.replicas_acked, 1);
        assert_eq!(outcome.version, 1);

        // Primary durably holds the chunk even though the queue is
        // not being drained.
        let primary = &outcome.acked_nodes[0];
        assert!(fx
            .transport
            .stored_chunk(primary, "obj1", chunk.chunk_id)
            .await
            .is_some());
        assert_eq!(fx.strategy.queue_depth(), 1);
    }

    #[tokio::test]
    async fn test_primary_failure_means_no_ack() {
        let fx = setup(1, ReplicationConfig::default()).await;
        fx.transport.set_behavior("n1", NodeBehavior::Fail).await;
        let (meta, chunk) = object();

        let err = fx
            .strategy
            .write(&meta, &chunk, b"data".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Transport { .. }));
        assert_eq!(fx.strategy.queue_depth(), 0);

        let stats = fx.pool.stats().await;
        assert_eq!(stats.nodes[0].error_count, 1);
    }

    #[tokio::test]
    async fn test_background_workers_drain_queue() {
        let fx = setup(3, ReplicationConfig::default()).await;
        let (mut meta, chunk) = object();

        let outcome = fx
            .strategy
            .write(&meta, &chunk, b"data".to_vec())
            .await
            .unwrap();
        let mut stored = chunk.clone();
        stored.add_worker(&outcome.acked_nodes[0]);
        meta.record_write(stored, &outcome.acked_nodes[0]).unwrap();
        fx.store.put(meta).await.unwrap();

        fx.strategy.start().await;

        // Wait for the queue to drain.
        for _ in 0..50 {
            if fx.strategy.queue_depth() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        // All three nodes now hold the chunk.
        for node in ["n1", "n2", "n3"] {
            assert!(
                fx.transport
                    .stored_chunk(node, "obj1", chunk.chunk_id)
                    .await
                    .is_some(),
                "{node} missing chunk"
            );
        }

        // The store records the new replicas and the sync point.
        let meta = fx.store.get("obj1").await.unwrap();
        assert_eq!(meta.chunks[0].workers.len(), 3);
        assert!(meta.last_sync_ts.is_some());

        let snap = ReplicationStrategy::stats(&fx.strategy);
        assert_eq!(snap.tasks_replicated, 1);
        fx.strategy.stop();
    }

    #[tokio::test]
    async fn test_queue_full_drops_but_acks() {
        let config = ReplicationConfig {
            async_queue_size: 1,
            ..Default::default()
        };
        let fx = setup(3, config).await;
        // Workers not started: the queue cannot drain.

        let (meta, chunk1) = object();
        let outcome = fx.strategy.write(&meta, &chunk1, b"a".to_vec()).await.unwrap();
        assert_eq!(outcome.replicas_acked, 1);

        let chunk2 = ChunkRef::new(1, 1, "crc", 2);
        let outcome = fx.strategy.write(&meta, &chunk2, b"b".to_vec()).await.unwrap();
        // Second write still acks even though its task was dropped.
        assert_eq!(outcome.replicas_acked, 1);

        let snap = ReplicationStrategy::stats(&fx.strategy);
        assert_eq!(snap.backpressure_drops, 1);
        assert_eq!(fx.strategy.queue_depth(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_counted() {
        let config = ReplicationConfig {
            max_retries: 2,
            async_write_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let fx = setup(3, config).await;
        // Background targets always fail.
        fx.transport.set_behavior("n2", NodeBehavior::Fail).await;
        fx.transport.set_behavior("n3", NodeBehavior::Fail).await;
        let (meta, chunk) = object();

        fx.strategy.start().await;
        fx.strategy
            .write(&meta, &chunk, b"data".to_vec())
            .await
            .unwrap();

        for _ in 0..100 {
            if ReplicationStrategy::stats(&fx.strategy).retries_exhausted == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snap = ReplicationStrategy::stats(&fx.strategy);
        assert_eq!(snap.retries_exhausted, 1);
        assert_eq!(snap.tasks_replicated, 0);
        fx.strategy.stop();
    }

    #[tokio::test]
    async fn test_no_replicas_when_all_down() {
        let fx = setup(2, ReplicationConfig::default()).await;
        for _ in 0..5 {
            fx.pool.mark_unhealthy("n1", "down").await;
            fx.pool.mark_unhealthy("n2", "down").await;
        }
        let (meta, chunk) = object();

        let err = fx
            .strategy
            .write(&meta, &chunk, b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoReplicas));
    }
}
