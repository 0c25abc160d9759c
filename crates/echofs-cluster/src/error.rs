//! Cluster error types and result definitions.

use std::time::Duration;

use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors produced by the replication engine and controller.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Fewer healthy workers than the operation needs
    #[error("Insufficient replicas: {healthy} healthy, {requested} requested")]
    InsufficientReplicas {
        /// Healthy workers available
        healthy: usize,
        /// Workers the operation asked for
        requested: usize,
    },

    /// A quorum write did not gather enough acks
    #[error("Quorum failed: {acked} acks, {required} required")]
    QuorumFailed {
        /// Acks gathered before the write was abandoned
        acked: usize,
        /// Quorum size
        required: usize,
    },

    /// No worker is configured or reachable at all
    #[error("No replicas available")]
    NoReplicas,

    /// Every replica holding the chunk failed to serve a read
    #[error("All replicas down for object {0}")]
    AllReplicasDown(String),

    /// Worker RPC or probe timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Worker RPC failed
    #[error("Transport error talking to {node}: {detail}")]
    Transport {
        /// Worker that failed
        node: String,
        /// What went wrong
        detail: String,
    },

    /// Worker id not present in the configured membership
    #[error("Unknown worker {0}")]
    UnknownWorker(String),

    /// Object or chunk not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The controller loop is not running
    #[error("Controller unavailable: {0}")]
    ControllerUnavailable(String),

    /// Metrics source failed to produce a sample
    #[error("Metrics unavailable: {0}")]
    MetricsUnavailable(String),

    /// Error bubbled up from the metadata core
    #[error(transparent)]
    Core(#[from] echofs_core::CoreError),
}

impl From<reqwest::Error> for ClusterError {
    fn from(err: reqwest::Error) -> Self {
        let node = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        Self::Transport {
            node,
            detail: err.to_string(),
        }
    }
}
