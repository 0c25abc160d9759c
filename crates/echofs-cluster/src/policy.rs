//! Policy engine: weighted scoring of per-object metrics into a mode
//! recommendation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use echofs_core::{ConsistencyMode, ModeHint, TransitionReason};

use crate::config::PolicyConfig;
use crate::error::ClusterResult;

/// Observed conditions for one object.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ObjectMetrics {
    /// Estimated probability that a quorum is unreachable, in [0, 1]
    pub partition_risk: f64,
    /// Async queue drain time or observed replica divergence
    pub replication_lag: Duration,
    /// Recent writes per second
    pub write_rate: f64,
}

/// Where the controller samples metrics from.
///
/// Injected at construction so tests drive the controller with scripted
/// samples instead of live cluster state.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Cluster-wide partition risk, the emergency trigger.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying signal is unavailable; the
    /// controller skips the cycle rather than acting on missing data.
    async fn cluster_partition_risk(&self) -> ClusterResult<f64>;

    /// Per-object observations.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying signal is unavailable.
    async fn sample(&self, object_id: &str) -> ClusterResult<ObjectMetrics>;
}

/// Everything the policy weighs for one object.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput {
    /// Observed conditions
    pub metrics: ObjectMetrics,
    /// Caller preference
    pub hint: ModeHint,
    /// Time since the object's mode last changed
    pub time_since_last_change: Duration,
}

/// The policy's verdict for one object.
#[derive(Debug, Clone, Copy)]
pub struct Recommendation {
    /// Recommended mode
    pub mode: ConsistencyMode,
    /// Raw score behind the recommendation
    pub score: f64,
    /// Reason the controller would record on transition
    pub reason: TransitionReason,
}

/// Weighted scoring of metrics into a mode recommendation.
///
/// Higher scores favor availability, lower scores favor consistency;
/// the band between the thresholds recommends `Hybrid`.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    /// Build an engine from configured weights and thresholds.
    #[must_use]
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Score one object and map the score to a recommendation.
    #[must_use]
    pub fn recommend(&self, input: &PolicyInput) -> Recommendation {
        let c = &self.config;
        let m = &input.metrics;

        let risk = m.partition_risk.clamp(0.0, 1.0);
        let lag_norm = normalize_ratio(
            m.replication_lag.as_secs_f64(),
            c.lag_ceiling.as_secs_f64(),
        );
        let write_norm = normalize_ratio(m.write_rate, c.write_rate_ceiling);
        let penalty = recency_penalty(input.time_since_last_change, c.penalty_half_life);

        let score = c.w_partition * risk
            + c.w_lag * lag_norm
            + c.w_write * write_norm
            + c.w_hint * input.hint.bias()
            - c.w_penalty * penalty;

        let mode = if score > c.available_threshold {
            ConsistencyMode::Available
        } else if score < c.strong_threshold {
            ConsistencyMode::Strong
        } else {
            ConsistencyMode::Hybrid
        };

        let reason = match mode {
            ConsistencyMode::Available => dominant_reason(c, risk, lag_norm, write_norm),
            ConsistencyMode::Strong => TransitionReason::ConsistencyOptimization,
            ConsistencyMode::Hybrid => TransitionReason::PolicyEvaluation,
        };

        Recommendation { mode, score, reason }
    }
}

/// Clamp `value / ceiling` into [0, 1].
fn normalize_ratio(value: f64, ceiling: f64) -> f64 {
    if ceiling <= 0.0 {
        return 0.0;
    }
    (value / ceiling).clamp(0.0, 1.0)
}

/// Exponentially decaying penalty for recent mode changes.
fn recency_penalty(elapsed: Duration, half_life: Duration) -> f64 {
    if half_life.is_zero() {
        return 0.0;
    }
    0.5_f64.powf(elapsed.as_secs_f64() / half_life.as_secs_f64())
}

/// Pick the reason matching the metric term that pushed the score up.
fn dominant_reason(
    config: &PolicyConfig,
    risk: f64,
    lag_norm: f64,
    write_norm: f64,
) -> TransitionReason {
    let terms = [
        (config.w_partition * risk, risk, TransitionReason::HighPartitionRisk),
        (config.w_lag * lag_norm, lag_norm, TransitionReason::HighReplicationLag),
        (config.w_write * write_norm, write_norm, TransitionReason::HighWriteRate),
    ];
    let dominant = terms
        .iter()
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .filter(|(_, raw, _)| *raw >= 0.5);
    match dominant {
        Some((_, _, reason)) => *reason,
        None => TransitionReason::AvailabilityOptimization,
    }
}
