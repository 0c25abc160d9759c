//! Worker pool: health tracking and weighted selection over the
//! configured storage nodes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, WorkerAddr};
use crate::error::{ClusterError, ClusterResult};
use crate::transport::WorkerTransport;

/// Tracked state of one storage node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNode {
    /// Node identifier
    pub id: String,
    /// RPC endpoint
    pub address: String,
    /// Whether the node currently receives traffic
    pub healthy: bool,
    /// Last successful contact
    pub last_seen: Option<DateTime<Utc>>,
    /// Smoothed round-trip latency in milliseconds
    pub latency_ewma_ms: f64,
    /// Lifetime error count
    pub error_count: u64,
    /// Errors since the last success
    pub consecutive_errors: u32,
}

impl WorkerNode {
    fn new(addr: &WorkerAddr) -> Self {
        Self {
            id: addr.id.clone(),
            address: addr.address.clone(),
            healthy: true,
            last_seen: None,
            latency_ewma_ms: 0.0,
            error_count: 0,
            consecutive_errors: 0,
        }
    }

    fn addr(&self) -> WorkerAddr {
        WorkerAddr::new(self.id.clone(), self.address.clone())
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    /// Per-node state
    pub nodes: Vec<WorkerNode>,
    /// Nodes currently healthy
    pub healthy: usize,
    /// Configured membership size
    pub total: usize,
}

/// Health-tracked set of storage nodes.
///
/// Membership is authoritative from configuration: nodes are starved of
/// traffic while unhealthy but never removed.
pub struct WorkerPool {
    config: PoolConfig,
    nodes: RwLock<HashMap<String, WorkerNode>>,
    running: RwLock<bool>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("members", &self.config.workers.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Build a pool over the configured membership. All nodes start
    /// healthy; the first probe cycle corrects that if needed.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let nodes = config
            .workers
            .iter()
            .map(|addr| (addr.id.clone(), WorkerNode::new(addr)))
            .collect();
        info!(members = config.workers.len(), "Worker pool created");
        Self {
            config,
            nodes: RwLock::new(nodes),
            running: RwLock::new(false),
        }
    }

    /// Select `k` healthy nodes, lowest latency and error count first.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::InsufficientReplicas`] when fewer than
    /// `k` nodes are healthy.
    pub async fn select(&self, k: usize) -> ClusterResult<Vec<WorkerAddr>> {
        self.select_excluding(k, &[]).await
    }

    /// Select `k` healthy nodes, skipping the given ids.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::InsufficientReplicas`] when fewer than
    /// `k` eligible nodes are healthy.
    pub async fn select_excluding(
        &self,
        k: usize,
        exclude: &[String],
    ) -> ClusterResult<Vec<WorkerAddr>> {
        let ranked = self.ranked_healthy(exclude).await;
        if ranked.len() < k {
            return Err(ClusterError::InsufficientReplicas {
                healthy: ranked.len(),
                requested: k,
            });
        }
        Ok(ranked.into_iter().take(k).collect())
    }

    /// All healthy nodes in preference order, best first.
    pub async fn ranked_healthy(&self, exclude: &[String]) -> Vec<WorkerAddr> {
        let nodes = self.nodes.read().await;
        let mut healthy: Vec<&WorkerNode> = nodes
            .values()
            .filter(|n| n.healthy && !exclude.contains(&n.id))
            .collect();
        healthy.sort_by(|a, b| {
            a.latency_ewma_ms
                .total_cmp(&b.latency_ewma_ms)
                .then(a.error_count.cmp(&b.error_count))
                .then(a.id.cmp(&b.id))
        });
        healthy.iter().map(|n| n.addr()).collect()
    }

    /// Order a specific candidate set by current preference, dropping
    /// unhealthy members. Used for read paths that must stick to the
    /// nodes holding a chunk.
    pub async fn order_preference(&self, candidates: &[String]) -> Vec<WorkerAddr> {
        let ranked = self.ranked_healthy(&[]).await;
        ranked
            .into_iter()
            .filter(|addr| candidates.contains(&addr.id))
            .collect()
    }

    /// Record a successful contact with `id`.
    ///
    /// The first success after a failure streak makes the node healthy
    /// again.
    pub async fn mark_healthy(&self, id: &str, rtt: Duration) {
        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get_mut(id) else {
            warn!(node = id, "Health report for unknown worker");
            return;
        };

        let rtt_ms = rtt.as_secs_f64() * 1000.0;
        node.latency_ewma_ms = if node.latency_ewma_ms == 0.0 {
            rtt_ms
        } else {
            self.config.latency_alpha * rtt_ms
                + (1.0 - self.config.latency_alpha) * node.latency_ewma_ms
        };
        node.last_seen = Some(Utc::now());
        node.consecutive_errors = 0;
        if !node.healthy {
            info!(node = id, rtt_ms, "Worker recovered");
            node.healthy = true;
        }
    }

    /// Record a failed contact with `id`.
    ///
    /// Transient errors only count; the node turns unhealthy after the
    /// configured consecutive-error streak.
    pub async fn mark_unhealthy(&self, id: &str, detail: &str) {
        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get_mut(id) else {
            warn!(node = id, "Error report for unknown worker");
            return;
        };

        node.error_count += 1;
        node.consecutive_errors += 1;
        debug!(
            node = id,
            consecutive = node.consecutive_errors,
            detail,
            "Worker error recorded"
        );
        if node.healthy && node.consecutive_errors >= self.config.unhealthy_after {
            warn!(
                node = id,
                errors = node.consecutive_errors,
                "Worker marked unhealthy"
            );
            node.healthy = false;
        }
    }

    /// Per-node state and healthy count.
    pub async fn stats(&self) -> PoolStats {
        let nodes = self.nodes.read().await;
        let mut list: Vec<WorkerNode> = nodes.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        let healthy = list.iter().filter(|n| n.healthy).count();
        PoolStats {
            healthy,
            total: list.len(),
            nodes: list,
        }
    }

    /// Number of currently healthy nodes.
    pub async fn healthy_count(&self) -> usize {
        self.nodes.read().await.values().filter(|n| n.healthy).count()
    }

    /// Estimated probability that a quorum is unreachable, derived from
    /// the unhealthy fraction of the membership.
    pub async fn partition_risk(&self) -> f64 {
        let nodes = self.nodes.read().await;
        if nodes.is_empty() {
            return 1.0;
        }
        let unhealthy = nodes.values().filter(|n| !n.healthy).count();
        unhealthy as f64 / nodes.len() as f64
    }

    /// Start the background probe loop.
    ///
    /// Each round probes every member with the configured deadline and
    /// feeds the result back into the health state.
    pub async fn start_probing(self: &Arc<Self>, transport: Arc<dyn WorkerTransport>) {
        {
            let mut running = self.running.write().await;
            if *running {
                return;
            }
            *running = true;
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.health_check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if !*pool.running.read().await {
                    debug!("Probe loop stopped");
                    break;
                }
                pool.probe_all(transport.as_ref()).await;
            }
        });
    }

    /// Stop the background probe loop after its current round.
    pub async fn stop_probing(&self) {
        *self.running.write().await = false;
    }

    /// Probe every member once.
    pub async fn probe_all(&self, transport: &dyn WorkerTransport) {
        let members: Vec<WorkerAddr> = self.config.workers.clone();
        for member in members {
            match transport.health(&member, self.config.probe_timeout).await {
                Ok(rtt) => self.mark_healthy(&member.id, rtt).await,
                Err(err) => self.mark_unhealthy(&member.id, &err.to_string()).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemoryTransport, NodeBehavior};

    fn pool_config(n: usize) -> PoolConfig {
        PoolConfig {
            workers: (1..=n)
                .map(|i| WorkerAddr::new(format!("n{i}"), format!("http://n{i}.local")))
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_select_prefers_low_latency() {
        let pool = WorkerPool::new(pool_config(3));
        pool.mark_healthy("n1", Duration::from_millis(50)).await;
        pool.mark_healthy("n2", Duration::from_millis(5)).await;
        pool.mark_healthy("n3", Duration::from_millis(20)).await;

        let picked = pool.select(2).await.unwrap();
        assert_eq!(picked[0].id, "n2");
        assert_eq!(picked[1].id, "n3");
    }

    #[tokio::test]
    async fn test_select_fails_when_short() {
        let pool = WorkerPool::new(pool_config(2));
        for _ in 0..5 {
            pool.mark_unhealthy("n1", "boom").await;
        }
        let err = pool.select(2).await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::InsufficientReplicas {
                healthy: 1,
                requested: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_unhealthy_after_streak_and_recovery() {
        let pool = WorkerPool::new(pool_config(1));

        for _ in 0..4 {
            pool.mark_unhealthy("n1", "transient").await;
        }
        assert_eq!(pool.healthy_count().await, 1);

        pool.mark_unhealthy("n1", "fifth strike").await;
        assert_eq!(pool.healthy_count().await, 0);

        // First success flips it back.
        pool.mark_healthy("n1", Duration::from_millis(3)).await;
        assert_eq!(pool.healthy_count().await, 1);
    }

    #[tokio::test]
    async fn test_success_resets_streak() {
        let pool = WorkerPool::new(pool_config(1));
        for _ in 0..4 {
            pool.mark_unhealthy("n1", "transient").await;
        }
        pool.mark_healthy("n1", Duration::from_millis(3)).await;
        for _ in 0..4 {
            pool.mark_unhealthy("n1", "transient").await;
        }
        // 4 + 4 with a success between: still healthy.
        assert_eq!(pool.healthy_count().await, 1);
    }

    #[tokio::test]
    async fn test_latency_ewma_smoothing() {
        let pool = WorkerPool::new(pool_config(1));
        pool.mark_healthy("n1", Duration::from_millis(100)).await;
        pool.mark_healthy("n1", Duration::from_millis(200)).await;

        let stats = pool.stats().await;
        // 0.1 * 200 + 0.9 * 100
        assert!((stats.nodes[0].latency_ewma_ms - 110.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_partition_risk_tracks_unhealthy_fraction() {
        let pool = WorkerPool::new(pool_config(4));
        assert_eq!(pool.partition_risk().await, 0.0);

        for _ in 0..5 {
            pool.mark_unhealthy("n1", "down").await;
            pool.mark_unhealthy("n2", "down").await;
        }
        assert!((pool.partition_risk().await - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_probe_round_updates_health() {
        let pool = WorkerPool::new(PoolConfig {
            unhealthy_after: 1,
            ..pool_config(2)
        });
        let transport = InMemoryTransport::new();
        transport.set_behavior("n2", NodeBehavior::Fail).await;

        pool.probe_all(&transport).await;
        assert_eq!(pool.healthy_count().await, 1);

        transport.set_behavior("n2", NodeBehavior::Ok).await;
        pool.probe_all(&transport).await;
        assert_eq!(pool.healthy_count().await, 2);
    }

    #[tokio::test]
    async fn test_order_preference_sticks_to_candidates() {
        let pool = WorkerPool::new(pool_config(3));
        pool.mark_healthy("n1", Duration::from_millis(30)).await;
        pool.mark_healthy("n2", Duration::from_millis(10)).await;
        pool.mark_healthy("n3", Duration::from_millis(20)).await;

        let ordered = pool
            .order_preference(&["n1".to_string(), "n3".to_string()])
            .await;
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].id, "n3");
        assert_eq!(ordered[1].id, "n1");
    }
}
