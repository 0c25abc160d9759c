//! Replication manager: routes every write and read to the strategy
//! selected by the object's current mode.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use echofs_core::{
    ChunkRef, ConsistencyMode, MetaStore, ModeHint, ObjectMeta, PendingConflicts, Resolution,
    ResolverRegistry,
};

use crate::config::EchoConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::metrics::{ClusterMetrics, ClusterMetricsSnapshot};
use crate::policy::{MetricsSource, ObjectMetrics};
use crate::pool::{PoolStats, WorkerPool};
use crate::strategy::{
    AsyncStrategy, ReplicationStrategy, StrategyKind, StrategyStatsSnapshot, SyncStrategy,
};
use crate::transport::WorkerTransport;

/// Sliding window for per-object write rates.
const RATE_WINDOW: Duration = Duration::from_secs(10);

/// Acked-write summary returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteReceipt {
    /// Always true; failed writes return an error instead
    pub acked: bool,
    /// Version the write embedded
    pub version: u64,
    /// Replicas that held the chunk at ack time
    pub replicas: usize,
    /// Time from dispatch to ack in milliseconds
    pub latency_ms: u64,
}

/// Aggregate counters across strategies, pool, and dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Sync strategy counters
    pub sync: StrategyStatsSnapshot,
    /// Async strategy counters
    #[serde(rename = "async")]
    pub async_: StrategyStatsSnapshot,
    /// Worker pool state
    pub pool: PoolStats,
    /// Dispatch counters
    pub dispatch: ClusterMetricsSnapshot,
    /// Registered objects
    pub objects: usize,
    /// Background queue depth
    pub queue_depth: usize,
}

#[derive(Debug, Default)]
struct RateWindow {
    samples: VecDeque<Instant>,
}

impl RateWindow {
    fn record(&mut self) {
        let now = Instant::now();
        self.samples.push_back(now);
        while let Some(front) = self.samples.front() {
            if now.duration_since(*front) > RATE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn rate(&mut self) -> f64 {
        let now = Instant::now();
        while let Some(front) = self.samples.front() {
            if now.duration_since(*front) > RATE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.len() as f64 / RATE_WINDOW.as_secs_f64()
    }
}

/// Owns both strategies and the worker pool; a thin dispatcher keyed on
/// the object's `current_mode`.
pub struct ReplicationManager {
    store: Arc<MetaStore>,
    pool: Arc<WorkerPool>,
    sync: SyncStrategy,
    async_strategy: Arc<AsyncStrategy>,
    resolvers: ResolverRegistry,
    pending_conflicts: Arc<PendingConflicts>,
    metrics: Arc<ClusterMetrics>,
    write_rates: RwLock<HashMap<String, RateWindow>>,
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager").finish_non_exhaustive()
    }
}

impl ReplicationManager {
    /// Build the manager and its strategies.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured conflict strategy is
    /// unknown.
    pub fn new(
        config: &EchoConfig,
        store: Arc<MetaStore>,
        pool: Arc<WorkerPool>,
        transport: Arc<dyn WorkerTransport>,
        metrics: Arc<ClusterMetrics>,
    ) -> ClusterResult<Self> {
        let sync = SyncStrategy::new(
            Arc::clone(&pool),
            Arc::clone(&transport),
            config.replication.clone(),
        );
        let async_strategy = Arc::new(AsyncStrategy::new(
            Arc::clone(&pool),
            Arc::clone(&transport),
            Arc::clone(&store),
            config.replication.clone(),
        ));

        let mut resolvers = ResolverRegistry::with_defaults();
        resolvers.set_default(&config.replication.conflict_strategy)?;

        Ok(Self {
            store,
            pool,
            sync,
            async_strategy,
            resolvers,
            pending_conflicts: Arc::new(PendingConflicts::new()),
            metrics,
            write_rates: RwLock::new(HashMap::new()),
        })
    }

    /// Start the async strategy's background workers.
    pub async fn start(&self) {
        self.async_strategy.start().await;
    }

    /// Stop background work.
    pub fn stop(&self) {
        self.async_strategy.stop();
    }

    /// The strategy the object's mode selects for one operation.
    ///
    /// Hybrid is not a third strategy: it routes per operation by the
    /// caller's hint.
    fn route(&self, mode: ConsistencyMode, hint: ModeHint) -> &dyn ReplicationStrategy {
        let kind = match mode {
            ConsistencyMode::Strong => StrategyKind::Sync,
            ConsistencyMode::Available => StrategyKind::Async,
            ConsistencyMode::Hybrid => {
                if hint == ModeHint::Strong {
                    StrategyKind::Sync
                } else {
                    StrategyKind::Async
                }
            }
        };
        match kind {
            StrategyKind::Sync => &self.sync,
            StrategyKind::Async => self.async_strategy.as_ref(),
        }
    }

    /// Write one chunk of an object.
    ///
    /// The object is registered on first write. The chunk embeds
    /// `last_version + 1`; metadata is only advanced and persisted
    /// after the strategy acked, so failed writes leave the version
    /// untouched and a retry re-allocates the same version.
    ///
    /// # Errors
    ///
    /// Surfaces the strategy's failure (`QuorumFailed`,
    /// `InsufficientReplicas`, `NoReplicas`, `Timeout`, transport) or a
    /// store error.
    pub async fn write(
        &self,
        object_id: &str,
        data: Vec<u8>,
        hint: Option<ModeHint>,
    ) -> ClusterResult<WriteReceipt> {
        let mut meta = match self.store.try_get(object_id).await {
            Some(meta) => meta,
            None => {
                let meta = ObjectMeta::new(object_id, hint.unwrap_or_default());
                info!(object_id, mode = %meta.current_mode, "Object registered on first write");
                meta
            }
        };
        if !meta.is_active() {
            return Err(ClusterError::NotFound(object_id.to_string()));
        }
        if let Some(hint) = hint {
            meta.mode_hint = hint;
        }

        let mut chunk = ChunkRef::new(
            meta.chunks.len() as u32,
            data.len() as u64,
            format!("{:08x}", crc32fast::hash(&data)),
            meta.next_version(),
        );

        let strategy = self.route(meta.current_mode, meta.mode_hint);
        match strategy.kind() {
            StrategyKind::Sync => self.metrics.record_sync_write(),
            StrategyKind::Async => self.metrics.record_async_write(),
        }

        let outcome = strategy.write(&meta, &chunk, data).await?;

        for node in &outcome.acked_nodes {
            chunk.add_worker(node);
        }
        let coordinator = outcome
            .acked_nodes
            .first()
            .cloned()
            .unwrap_or_else(|| "local".to_string());
        meta.record_write(chunk, &coordinator)?;
        self.store.put(meta).await?;

        self.write_rates
            .write()
            .await
            .entry(object_id.to_string())
            .or_default()
            .record();

        debug!(
            object_id,
            version = outcome.version,
            replicas = outcome.replicas_acked,
            strategy = %strategy.kind(),
            "Write acked"
        );

        Ok(WriteReceipt {
            acked: true,
            version: outcome.version,
            replicas: outcome.replicas_acked,
            latency_ms: outcome.latency.as_millis() as u64,
        })
    }

    /// Read one chunk of an object.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown objects or chunks and
    /// `AllReplicasDown` when no replica serves the chunk.
    pub async fn read(&self, object_id: &str, chunk_id: Uuid) -> ClusterResult<Vec<u8>> {
        let meta = self
            .store
            .try_get(object_id)
            .await
            .filter(ObjectMeta::is_active)
            .ok_or_else(|| ClusterError::NotFound(object_id.to_string()))?;

        self.metrics.record_read();
        let strategy = self.route(meta.current_mode, meta.mode_hint);
        strategy.read(&meta, chunk_id).await
    }

    /// Reconcile an incoming copy of an object's metadata against the
    /// stored one, typically on partition heal or delayed async
    /// delivery.
    ///
    /// A merged result is persisted durably; a manual-resolution
    /// verdict parks the conflict for the operator. Conflicts are never
    /// surfaced to write callers.
    ///
    /// # Errors
    ///
    /// Returns resolver or store errors.
    pub async fn reconcile(&self, incoming: ObjectMeta) -> ClusterResult<Resolution> {
        let Some(local) = self.store.try_get(&incoming.object_id).await else {
            self.store.put_durable(incoming.clone()).await?;
            return Ok(Resolution::Merged(incoming));
        };

        let resolution = self.resolvers.reconcile(&local, &incoming)?;
        match &resolution {
            Resolution::Merged(merged) => {
                self.store.put_durable(merged.clone()).await?;
            }
            Resolution::Pending(conflict) => {
                self.pending_conflicts.enqueue(conflict.clone()).await;
            }
        }
        Ok(resolution)
    }

    /// The queue of conflicts awaiting operator resolution.
    #[must_use]
    pub fn pending_conflicts(&self) -> Arc<PendingConflicts> {
        Arc::clone(&self.pending_conflicts)
    }

    /// Apply an operator's verdict on a queued conflict and persist the
    /// chosen copy.
    ///
    /// # Errors
    ///
    /// Returns `UnknownConflict` for ids not in the queue, or a store
    /// error.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        side: echofs_core::conflict::ConflictSide,
    ) -> ClusterResult<ObjectMeta> {
        let winner = self.pending_conflicts.resolve(conflict_id, side).await?;
        self.store.put_durable(winner.clone()).await?;
        Ok(winner)
    }

    /// Recent writes per second for one object.
    pub async fn write_rate(&self, object_id: &str) -> f64 {
        let mut rates = self.write_rates.write().await;
        rates.get_mut(object_id).map_or(0.0, RateWindow::rate)
    }

    /// Aggregate statistics.
    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            sync: ReplicationStrategy::stats(&self.sync),
            async_: ReplicationStrategy::stats(self.async_strategy.as_ref()),
            pool: self.pool.stats().await,
            dispatch: self.metrics.snapshot(),
            objects: self.store.len().await,
            queue_depth: self.async_strategy.queue_depth(),
        }
    }
}

#[async_trait]
impl MetricsSource for ReplicationManager {
    async fn cluster_partition_risk(&self) -> ClusterResult<f64> {
        Ok(self.pool.partition_risk().await)
    }

    async fn sample(&self, object_id: &str) -> ClusterResult<ObjectMetrics> {
        Ok(ObjectMetrics {
            partition_risk: self.pool.partition_risk().await,
            replication_lag: self.async_strategy.replication_lag(),
            write_rate: self.write_rate(object_id).await,
        })
    }
}
