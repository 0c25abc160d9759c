//! Consistency modes, caller hints, and transition reasons.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Replication mode in force for an object.
///
/// The controller owns this value; callers influence it only through
/// [`ModeHint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyMode {
    /// Synchronous quorum replication on write (mode C)
    #[default]
    Strong,
    /// Asynchronous replication with primary-only ack (mode A)
    Available,
    /// Per-operation dispatch: sync when the caller hinted Strong
    Hybrid,
}

impl ConsistencyMode {
    /// Relative strength used when merging conflicting copies (C > Hybrid > A).
    #[must_use]
    pub fn strength(self) -> u8 {
        match self {
            Self::Strong => 2,
            Self::Hybrid => 1,
            Self::Available => 0,
        }
    }

    /// The stronger of two modes.
    #[must_use]
    pub fn stronger(self, other: Self) -> Self {
        if self.strength() >= other.strength() {
            self
        } else {
            other
        }
    }
}

impl std::fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strong => write!(f, "C"),
            Self::Available => write!(f, "A"),
            Self::Hybrid => write!(f, "Hybrid"),
        }
    }
}

impl FromStr for ConsistencyMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c" | "strong" => Ok(Self::Strong),
            "a" | "available" => Ok(Self::Available),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(CoreError::InvalidMode(s.to_string())),
        }
    }
}

/// Caller preference for an object's consistency mode.
///
/// The hint biases the policy engine and decides routing in `Hybrid`
/// mode, but the controller is never bound by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModeHint {
    /// Let the controller decide
    #[default]
    Auto,
    /// Prefer quorum replication
    Strong,
    /// Prefer availability over consistency
    Available,
}

impl ModeHint {
    /// Initial mode for a freshly registered object.
    ///
    /// `Strong` is the safest default; an explicit hint maps to the
    /// corresponding mode.
    #[must_use]
    pub fn initial_mode(self) -> ConsistencyMode {
        match self {
            Self::Auto | Self::Strong => ConsistencyMode::Strong,
            Self::Available => ConsistencyMode::Available,
        }
    }

    /// Numeric bias fed into the policy score.
    ///
    /// Negative pulls toward C, positive toward A.
    #[must_use]
    pub fn bias(self) -> f64 {
        match self {
            Self::Strong => -1.0,
            Self::Auto => 0.0,
            Self::Available => 1.0,
        }
    }
}

impl std::fmt::Display for ModeHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Strong => write!(f, "strong"),
            Self::Available => write!(f, "available"),
        }
    }
}

impl FromStr for ModeHint {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "strong" => Ok(Self::Strong),
            "available" => Ok(Self::Available),
            _ => Err(CoreError::InvalidHint(s.to_string())),
        }
    }
}

/// Why a mode transition happened.
///
/// Emitted on every transition and persisted with the object's mode
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// Partition risk dominated the policy score
    HighPartitionRisk,
    /// Replication lag dominated the policy score
    HighReplicationLag,
    /// Write rate dominated the policy score
    HighWriteRate,
    /// Policy moved the object toward availability
    AvailabilityOptimization,
    /// Policy moved the object toward consistency
    ConsistencyOptimization,
    /// Confirmed policy recommendation with no dominant term
    PolicyEvaluation,
    /// Partition risk exceeded the emergency threshold
    EmergencyPartition,
    /// Operator set a global override
    OperatorOverride,
    /// Object was designated a critical key
    CriticalKeyDesignation,
    /// Initial registration
    Registered,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HighPartitionRisk => "high_partition_risk",
            Self::HighReplicationLag => "high_replication_lag",
            Self::HighWriteRate => "high_write_rate",
            Self::AvailabilityOptimization => "availability_optimization",
            Self::ConsistencyOptimization => "consistency_optimization",
            Self::PolicyEvaluation => "policy_evaluation",
            Self::EmergencyPartition => "emergency_partition",
            Self::OperatorOverride => "operator_override",
            Self::CriticalKeyDesignation => "critical_key_designation",
            Self::Registered => "registered",
        };
        write!(f, "{}", s)
    }
}
