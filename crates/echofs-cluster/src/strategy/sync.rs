//! Synchronous quorum replication.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use echofs_core::{ChunkRef, ObjectMeta};

use crate::config::ReplicationConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::pool::WorkerPool;
use crate::strategy::{
    ReplicationStrategy, StrategyKind, StrategyStats, StrategyStatsSnapshot, WriteOutcome,
};
use crate::transport::{WorkerTransport, WriteChunkRequest};

/// Quorum strategy: a write is acked once `quorum_size` replicas
/// confirmed it, all within the write deadline.
pub struct SyncStrategy {
    pool: Arc<WorkerPool>,
    transport: Arc<dyn WorkerTransport>,
    config: ReplicationConfig,
    stats: StrategyStats,
}

impl std::fmt::Debug for SyncStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStrategy")
            .field("replication_factor", &self.config.replication_factor)
            .field("quorum_size", &self.config.quorum_size)
            .finish_non_exhaustive()
    }
}

impl SyncStrategy {
    /// Build the strategy over a pool and transport.
    #[must_use]
    pub fn new(
        pool: Arc<WorkerPool>,
        transport: Arc<dyn WorkerTransport>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            pool,
            transport,
            config,
            stats: StrategyStats::new(),
        }
    }

    async fn select_replicas(&self) -> ClusterResult<Vec<crate::config::WorkerAddr>> {
        match self.pool.select(self.config.replication_factor).await {
            Ok(replicas) => Ok(replicas),
            Err(ClusterError::InsufficientReplicas { healthy: 0, .. }) => {
                Err(ClusterError::NoReplicas)
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl ReplicationStrategy for SyncStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Sync
    }

    async fn write(
        &self,
        meta: &ObjectMeta,
        chunk: &ChunkRef,
        data: Vec<u8>,
    ) -> ClusterResult<WriteOutcome> {
        self.stats.record_write();

        let replicas = match self.select_replicas().await {
            Ok(replicas) => replicas,
            Err(err) => {
                self.stats.record_write_failure();
                return Err(err);
            }
        };

        let request = WriteChunkRequest {
            object_id: meta.object_id.clone(),
            chunk_id: chunk.chunk_id,
            index: chunk.index,
            version: chunk.version,
            checksum: chunk.checksum.clone(),
            data,
        };

        let quorum = self.config.quorum_size;
        let total = replicas.len();
        let started = Instant::now();

        let mut join_set = JoinSet::new();
        for node in replicas {
            let transport = Arc::clone(&self.transport);
            let request = request.clone();
            let deadline = self.config.write_timeout;
            join_set.spawn(async move {
                let result = transport.write_chunk(&node, &request, deadline).await;
                (node, result)
            });
        }

        let mut acked_nodes: Vec<String> = Vec::with_capacity(total);
        let mut failures = 0usize;

        let gather = async {
            while let Some(joined) = join_set.join_next().await {
                let Ok((node, result)) = joined else {
                    failures += 1;
                    continue;
                };
                match result {
                    Ok(_) => {
                        self.pool.mark_healthy(&node.id, started.elapsed()).await;
                        acked_nodes.push(node.id);
                        if acked_nodes.len() >= quorum {
                            return true;
                        }
                    }
                    Err(err) => {
                        self.pool.mark_unhealthy(&node.id, &err.to_string()).await;
                        failures += 1;
                        // Quorum is out of reach once too few calls remain.
                        if total - failures < quorum {
                            return false;
                        }
                    }
                }
            }
            false
        };

        let reached = tokio::time::timeout(self.config.write_timeout, gather)
            .await
            .unwrap_or(false);

        if !reached {
            warn!(
                object_id = %meta.object_id,
                version = chunk.version,
                acked = acked_nodes.len(),
                required = quorum,
                "Quorum write failed"
            );
            self.stats.record_quorum_failure();
            return Err(ClusterError::QuorumFailed {
                acked: acked_nodes.len(),
                required: quorum,
            });
        }

        let latency = started.elapsed();
        self.stats.record_write_success(latency);
        debug!(
            object_id = %meta.object_id,
            version = chunk.version,
            replicas = acked_nodes.len(),
            latency_ms = latency.as_millis() as u64,
            "Quorum write acked"
        );

        Ok(WriteOutcome {
            version: chunk.version,
            replicas_acked: acked_nodes.len(),
            acked_nodes,
            latency,
        })
    }

    async fn read(&self, meta: &ObjectMeta, chunk_id: Uuid) -> ClusterResult<Vec<u8>> {
        self.stats.record_read();

        let chunk = meta.chunk_by_id(chunk_id).ok_or_else(|| {
            ClusterError::NotFound(format!("{}/{}", meta.object_id, chunk_id))
        })?;

        let candidates: Vec<String> = chunk.workers.iter().cloned().collect();
        let ordered = self.pool.order_preference(&candidates).await;
        if ordered.is_empty() {
            self.stats.record_read_failure();
            return Err(ClusterError::AllReplicasDown(meta.object_id.clone()));
        }

        for node in ordered {
            let started = Instant::now();
            match self
                .transport
                .read_chunk(&node, &meta.object_id, chunk_id, self.config.write_timeout)
                .await
            {
                Ok(bytes) => {
                    self.pool.mark_healthy(&node.id, started.elapsed()).await;
                    return Ok(bytes);
                }
                Err(err) => {
                    debug!(node = %node.id, error = %err, "Replica read failed, trying next");
                    self.pool.mark_unhealthy(&node.id, &err.to_string()).await;
                }
            }
        }

        self.stats.record_read_failure();
        Err(ClusterError::AllReplicasDown(meta.object_id.clone()))
    }

    fn stats(&self) -> StrategyStatsSnapshot {
        self.stats.snapshot()
    }
}
