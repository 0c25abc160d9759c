//! Cluster configuration and builder.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};

/// A configured storage node.
///
/// Membership is static: the configured set is authoritative and nodes
/// are never removed at runtime, only marked unhealthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAddr {
    /// Unique node identifier
    pub id: String,
    /// Base URL for the node's RPC endpoint (e.g. "http://node1:7400")
    pub address: String,
}

impl WorkerAddr {
    /// Convenience constructor.
    #[must_use]
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// Top-level configuration for the EchoFS core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EchoConfig {
    /// Consistency controller settings
    pub controller: ControllerConfig,
    /// Replication strategy settings
    pub replication: ReplicationConfig,
    /// Worker pool settings
    pub pool: PoolConfig,
    /// Policy engine weights and thresholds
    pub policy: PolicyConfig,
    /// Directory for the metadata store
    pub store_dir: PathBuf,
}

/// Consistency controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Evaluation cycle period
    pub poll_interval: Duration,
    /// Consecutive agreeing samples required to transition
    pub confirmation_count: u32,
    /// Post-transition wait before another transition may be proposed
    pub cooldown_period: Duration,
    /// Partition risk above which mode A is forced immediately
    pub emergency_threshold: f64,
    /// TTL reported with cached mode answers
    pub mode_ttl: Duration,
    /// Deadline for controller -> store operations
    pub store_op_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            confirmation_count: 3,
            cooldown_period: Duration::from_secs(30),
            emergency_threshold: 0.8,
            mode_ttl: Duration::from_secs(300),
            store_op_timeout: Duration::from_secs(10),
        }
    }
}

/// Replication strategy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Total replicas per chunk
    pub replication_factor: usize,
    /// Acks required for a sync write (must exceed half the factor)
    pub quorum_size: usize,
    /// Per-call deadline for sync writes and the primary async write
    pub write_timeout: Duration,
    /// Per-call deadline for background async writes
    pub async_write_timeout: Duration,
    /// Bound of the background replication queue
    pub async_queue_size: usize,
    /// Background workers draining the queue
    pub async_workers: usize,
    /// Tasks drained per flush batch (reserved for batched operations)
    pub async_batch_size: usize,
    /// Period of the flush tick
    pub async_flush_interval: Duration,
    /// Re-enqueue attempts before a task is dropped as failed
    pub max_retries: u32,
    /// Default conflict resolution strategy name
    pub conflict_strategy: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            quorum_size: 2,
            write_timeout: Duration::from_secs(5),
            async_write_timeout: Duration::from_secs(30),
            async_queue_size: 100,
            async_workers: 3,
            async_batch_size: 10,
            async_flush_interval: Duration::from_secs(5),
            max_retries: 3,
            conflict_strategy: "vector_clock_merge".to_string(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Static cluster membership
    pub workers: Vec<WorkerAddr>,
    /// Period of the background health probe
    pub health_check_interval: Duration,
    /// Per-probe deadline
    pub probe_timeout: Duration,
    /// Consecutive errors before a node is marked unhealthy
    pub unhealthy_after: u32,
    /// Smoothing factor for the latency moving average
    pub latency_alpha: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            health_check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            unhealthy_after: 5,
            latency_alpha: 0.1,
        }
    }
}

/// Policy engine weights, thresholds, and normalization ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Weight of the partition-risk term
    pub w_partition: f64,
    /// Weight of the replication-lag term
    pub w_lag: f64,
    /// Weight of the write-rate term
    pub w_write: f64,
    /// Weight of the caller-hint bias
    pub w_hint: f64,
    /// Weight of the recent-change penalty
    pub w_penalty: f64,
    /// Score above which mode A is recommended
    pub available_threshold: f64,
    /// Score below which mode C is recommended
    pub strong_threshold: f64,
    /// Replication lag mapping to 1.0
    pub lag_ceiling: Duration,
    /// Write rate (ops/s) mapping to 1.0
    pub write_rate_ceiling: f64,
    /// Half-life of the recency penalty decay
    pub penalty_half_life: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            w_partition: 0.4,
            w_lag: 0.3,
            w_write: 0.2,
            w_hint: 0.1,
            w_penalty: 0.2,
            available_threshold: 0.6,
            strong_threshold: 0.3,
            lag_ceiling: Duration::from_millis(500),
            write_rate_ceiling: 50.0,
            penalty_half_life: Duration::from_secs(60),
        }
    }
}

/// Builder for cluster configuration.
#[derive(Debug, Default)]
pub struct EchoConfigBuilder {
    config: EchoConfig,
}

impl EchoConfig {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> EchoConfigBuilder {
        EchoConfigBuilder::default()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Config`] describing the first violated
    /// constraint.
    pub fn validate(&self) -> ClusterResult<()> {
        let r = self.replication.replication_factor;
        let q = self.replication.quorum_size;

        if r == 0 {
            return Err(ClusterError::Config(
                "Replication factor must be greater than 0".into(),
            ));
        }
        if q == 0 || q > r {
            return Err(ClusterError::Config(format!(
                "Quorum size must be in 1..={r}, got {q}"
            )));
        }
        if q * 2 <= r {
            return Err(ClusterError::Config(format!(
                "Quorum size {q} must exceed half the replication factor {r}"
            )));
        }
        if self.replication.async_workers == 0 {
            return Err(ClusterError::Config(
                "At least one async replication worker is required".into(),
            ));
        }
        if self.replication.async_queue_size == 0 {
            return Err(ClusterError::Config(
                "Async queue size must be greater than 0".into(),
            ));
        }
        if self.pool.workers.is_empty() {
            return Err(ClusterError::Config(
                "Worker membership must not be empty".into(),
            ));
        }
        if self.pool.workers.len() < r {
            return Err(ClusterError::Config(format!(
                "Replication factor {r} exceeds configured workers {}",
                self.pool.workers.len()
            )));
        }
        if !(0.0..=1.0).contains(&self.controller.emergency_threshold) {
            return Err(ClusterError::Config(
                "Emergency threshold must lie in [0, 1]".into(),
            ));
        }
        if self.policy.strong_threshold >= self.policy.available_threshold {
            return Err(ClusterError::Config(
                "Strong threshold must be below the available threshold".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.pool.latency_alpha) || self.pool.latency_alpha == 0.0 {
            return Err(ClusterError::Config(
                "Latency smoothing factor must lie in (0, 1)".into(),
            ));
        }
        Ok(())
    }
}

impl EchoConfigBuilder {
    /// Set the static worker membership.
    #[must_use]
    pub fn workers(mut self, workers: Vec<WorkerAddr>) -> Self {
        self.config.pool.workers = workers;
        self
    }

    /// Set the replication factor.
    #[must_use]
    pub fn replication_factor(mut self, factor: usize) -> Self {
        self.config.replication.replication_factor = factor;
        self
    }

    /// Set the quorum size.
    #[must_use]
    pub fn quorum_size(mut self, quorum: usize) -> Self {
        self.config.replication.quorum_size = quorum;
        self
    }

    /// Set the sync write deadline.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.replication.write_timeout = timeout;
        self
    }

    /// Set the controller cycle period.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.controller.poll_interval = interval;
        self
    }

    /// Set the hysteresis confirmation count.
    #[must_use]
    pub fn confirmation_count(mut self, count: u32) -> Self {
        self.config.controller.confirmation_count = count;
        self
    }

    /// Set the post-transition cooldown.
    #[must_use]
    pub fn cooldown_period(mut self, period: Duration) -> Self {
        self.config.controller.cooldown_period = period;
        self
    }

    /// Set the emergency partition-risk threshold.
    #[must_use]
    pub fn emergency_threshold(mut self, threshold: f64) -> Self {
        self.config.controller.emergency_threshold = threshold;
        self
    }

    /// Set the metadata store directory.
    #[must_use]
    pub fn store_dir(mut self, dir: PathBuf) -> Self {
        self.config.store_dir = dir;
        self
    }

    /// Set the replication section wholesale.
    #[must_use]
    pub fn replication(mut self, replication: ReplicationConfig) -> Self {
        self.config.replication = replication;
        self
    }

    /// Set the pool section wholesale.
    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Set the policy section wholesale.
    #[must_use]
    pub fn policy(mut self, policy: PolicyConfig) -> Self {
        self.config.policy = policy;
        self
    }

    /// Set the controller section wholesale.
    #[must_use]
    pub fn controller(mut self, controller: ControllerConfig) -> Self {
        self.config.controller = controller;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> ClusterResult<EchoConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_workers() -> Vec<WorkerAddr> {
        vec![
            WorkerAddr::new("n1", "http://127.0.0.1:7401"),
            WorkerAddr::new("n2", "http://127.0.0.1:7402"),
            WorkerAddr::new("n3", "http://127.0.0.1:7403"),
        ]
    }

    #[test]
    fn test_default_values() {
        let config = EchoConfig::default();
        assert_eq!(config.controller.poll_interval, Duration::from_secs(10));
        assert_eq!(config.controller.confirmation_count, 3);
        assert_eq!(config.replication.replication_factor, 3);
        assert_eq!(config.replication.quorum_size, 2);
        assert_eq!(config.replication.async_queue_size, 100);
        assert_eq!(config.pool.unhealthy_after, 5);
        assert_eq!(config.policy.w_partition, 0.4);
    }

    #[test]
    fn test_builder_valid() {
        let config = EchoConfig::builder()
            .workers(three_workers())
            .replication_factor(3)
            .quorum_size(2)
            .build()
            .unwrap();
        assert_eq!(config.pool.workers.len(), 3);
    }

    #[test]
    fn test_quorum_must_exceed_half() {
        let result = EchoConfig::builder()
            .workers(three_workers())
            .replication_factor(3)
            .quorum_size(1)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_quorum_cannot_exceed_factor() {
        let result = EchoConfig::builder()
            .workers(three_workers())
            .replication_factor(3)
            .quorum_size(4)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_membership_rejected() {
        let result = EchoConfig::builder().build();
        assert!(result.is_err());
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        let mut policy = PolicyConfig::default();
        policy.strong_threshold = 0.7;
        let result = EchoConfig::builder()
            .workers(three_workers())
            .policy(policy)
            .build();
        assert!(result.is_err());
    }
}
