//! Conflict detection and pluggable resolution strategies.
//!
//! Two copies of the same object conflict iff neither vector clock
//! dominates the other. Resolution strategies live in a registry keyed
//! by name; the active default comes from configuration, so adding a
//! strategy is a registration rather than a code change in the core.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::ClockOrdering;
use crate::error::{CoreError, CoreResult};
use crate::object::{ChunkRef, ObjectMeta, ObjectStatus};

/// Outcome of comparing two copies of the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// The left copy supersedes the right one
    LeftWins,
    /// The right copy supersedes the left one
    RightWins,
    /// Neither clock dominates; the copies are concurrent
    Conflict,
}

/// Compare two copies and decide whether they conflict.
///
/// A copy whose vector clock dominates wins outright. Equal clocks carry
/// identical write history, so the more recently touched copy wins.
#[must_use]
pub fn detect(left: &ObjectMeta, right: &ObjectMeta) -> ConflictOutcome {
    match left.vector_clock.compare(&right.vector_clock) {
        ClockOrdering::Dominates => ConflictOutcome::LeftWins,
        ClockOrdering::Dominated => ConflictOutcome::RightWins,
        ClockOrdering::Equal => {
            if left.updated_at >= right.updated_at {
                ConflictOutcome::LeftWins
            } else {
                ConflictOutcome::RightWins
            }
        }
        ClockOrdering::Concurrent => ConflictOutcome::Conflict,
    }
}

/// Result of running a resolution strategy on two conflicting copies.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// A single reconciled copy
    Merged(ObjectMeta),
    /// No automatic choice; an operator must decide
    Pending(PendingConflict),
}

/// Urgency of a manually queued conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPriority {
    /// Either copy exceeds 100 MiB
    High,
    /// Either copy runs in strong mode
    Medium,
    /// Everything else
    Low,
}

const HIGH_PRIORITY_SIZE: u64 = 100 * 1024 * 1024;

impl ConflictPriority {
    /// Classify a conflict by the copies involved.
    #[must_use]
    pub fn classify(left: &ObjectMeta, right: &ObjectMeta) -> Self {
        use crate::mode::ConsistencyMode;

        if left.size > HIGH_PRIORITY_SIZE || right.size > HIGH_PRIORITY_SIZE {
            Self::High
        } else if left.current_mode == ConsistencyMode::Strong
            || right.current_mode == ConsistencyMode::Strong
        {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// A conflict parked for operator resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConflict {
    /// Queue entry id
    pub id: Uuid,
    /// First copy
    pub left: ObjectMeta,
    /// Second copy
    pub right: ObjectMeta,
    /// Urgency classification
    pub priority: ConflictPriority,
    /// When the conflict was queued
    pub queued_at: DateTime<Utc>,
}

/// Which copy of a pending conflict the operator picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSide {
    /// Keep the left copy
    Left,
    /// Keep the right copy
    Right,
}

/// A conflict resolution strategy.
pub trait ResolutionStrategy: Send + Sync {
    /// Registry name of this strategy.
    fn name(&self) -> &'static str;

    /// Reconcile two concurrent copies of the same object.
    ///
    /// # Errors
    ///
    /// Returns an error when the copies cannot be reconciled by this
    /// strategy.
    fn resolve(&self, left: &ObjectMeta, right: &ObjectMeta) -> CoreResult<Resolution>;
}

/// Choose the copy with the greater `updated_at`; accepts data loss.
#[derive(Debug, Default)]
pub struct LastWriterWins;

impl ResolutionStrategy for LastWriterWins {
    fn name(&self) -> &'static str {
        "last_writer_wins"
    }

    fn resolve(&self, left: &ObjectMeta, right: &ObjectMeta) -> CoreResult<Resolution> {
        let winner = match left.updated_at.cmp(&right.updated_at) {
            std::cmp::Ordering::Greater => left,
            std::cmp::Ordering::Less => right,
            // Identical timestamps: object_id lexicographic order keeps
            // the choice deterministic across replicas.
            std::cmp::Ordering::Equal => match left.object_id.cmp(&right.object_id) {
                std::cmp::Ordering::Less => right,
                _ => left,
            },
        };
        Ok(Resolution::Merged(winner.clone()))
    }
}

/// Merge both copies field-wise; guarantees progress without data loss
/// at the metadata level.
#[derive(Debug, Default)]
pub struct VectorClockMerge;

impl ResolutionStrategy for VectorClockMerge {
    fn name(&self) -> &'static str {
        "vector_clock_merge"
    }

    fn resolve(&self, left: &ObjectMeta, right: &ObjectMeta) -> CoreResult<Resolution> {
        // Chunks keyed by chunk_id, greater version wins per id.
        let mut by_id: HashMap<Uuid, ChunkRef> = HashMap::new();
        for chunk in left.chunks.iter().chain(right.chunks.iter()) {
            match by_id.get(&chunk.chunk_id) {
                Some(existing) if existing.version >= chunk.version => {}
                _ => {
                    by_id.insert(chunk.chunk_id, chunk.clone());
                }
            }
        }
        let mut chunks: Vec<ChunkRef> = by_id.into_values().collect();
        chunks.sort_by_key(|c| (c.index, c.version));

        Ok(Resolution::Merged(merge_common(left, right, chunks)))
    }
}

/// Merge with per-cell last-writer-wins: chunks keyed by index, greater
/// version wins per cell.
#[derive(Debug, Default)]
pub struct CrdtMerge;

impl ResolutionStrategy for CrdtMerge {
    fn name(&self) -> &'static str {
        "crdt_merge"
    }

    fn resolve(&self, left: &ObjectMeta, right: &ObjectMeta) -> CoreResult<Resolution> {
        let mut by_index: HashMap<u32, ChunkRef> = HashMap::new();
        for chunk in left.chunks.iter().chain(right.chunks.iter()) {
            match by_index.get(&chunk.index) {
                Some(existing) if existing.version >= chunk.version => {}
                _ => {
                    by_index.insert(chunk.index, chunk.clone());
                }
            }
        }
        let mut chunks: Vec<ChunkRef> = by_index.into_values().collect();
        chunks.sort_by_key(|c| c.index);

        Ok(Resolution::Merged(merge_common(left, right, chunks)))
    }
}

/// Defer to an operator: the conflict is queued, never auto-resolved.
#[derive(Debug, Default)]
pub struct ManualResolution;

impl ResolutionStrategy for ManualResolution {
    fn name(&self) -> &'static str {
        "manual_resolution"
    }

    fn resolve(&self, left: &ObjectMeta, right: &ObjectMeta) -> CoreResult<Resolution> {
        Ok(Resolution::Pending(PendingConflict {
            id: Uuid::new_v4(),
            left: left.clone(),
            right: right.clone(),
            priority: ConflictPriority::classify(left, right),
            queued_at: Utc::now(),
        }))
    }
}

/// Shared merge skeleton for the merging strategies.
fn merge_common(left: &ObjectMeta, right: &ObjectMeta, chunks: Vec<ChunkRef>) -> ObjectMeta {
    let recent = if left.updated_at >= right.updated_at {
        left
    } else {
        right
    };

    let status = if left.status == ObjectStatus::Deleted || right.status == ObjectStatus::Deleted {
        ObjectStatus::Deleted
    } else {
        ObjectStatus::Active
    };

    ObjectMeta {
        object_id: left.object_id.clone(),
        size: left.size.max(right.size),
        chunks,
        mode_hint: recent.mode_hint,
        current_mode: left.current_mode.stronger(right.current_mode),
        last_version: left.last_version.max(right.last_version) + 1,
        vector_clock: left.vector_clock.merged(&right.vector_clock),
        last_sync_ts: left.last_sync_ts.max(right.last_sync_ts),
        last_mode_change: left.last_mode_change.max(right.last_mode_change),
        created_at: left.created_at.min(right.created_at),
        updated_at: Utc::now(),
        status,
    }
}

/// Registry of resolution strategies keyed by name.
pub struct ResolverRegistry {
    strategies: HashMap<&'static str, Arc<dyn ResolutionStrategy>>,
    default: &'static str,
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("strategies", &self.strategies.keys().collect::<Vec<_>>())
            .field("default", &self.default)
            .finish()
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ResolverRegistry {
    /// Registry with the four built-in strategies, defaulting to
    /// `vector_clock_merge`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            strategies: HashMap::new(),
            default: "vector_clock_merge",
        };
        registry.register(Arc::new(LastWriterWins));
        registry.register(Arc::new(VectorClockMerge));
        registry.register(Arc::new(CrdtMerge));
        registry.register(Arc::new(ManualResolution));
        registry
    }

    /// Add or replace a strategy under its own name.
    pub fn register(&mut self, strategy: Arc<dyn ResolutionStrategy>) {
        debug!(strategy = strategy.name(), "Registering conflict strategy");
        self.strategies.insert(strategy.name(), strategy);
    }

    /// Change the default strategy.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownStrategy`] when no strategy is
    /// registered under `name`.
    pub fn set_default(&mut self, name: &str) -> CoreResult<()> {
        let (key, _) = self
            .strategies
            .get_key_value(name)
            .ok_or_else(|| CoreError::UnknownStrategy(name.to_string()))?;
        self.default = *key;
        info!(strategy = name, "Default conflict strategy changed");
        Ok(())
    }

    /// Look up a strategy by name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownStrategy`] for unregistered names.
    pub fn get(&self, name: &str) -> CoreResult<Arc<dyn ResolutionStrategy>> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownStrategy(name.to_string()))
    }

    /// The configured default strategy.
    #[must_use]
    pub fn default_strategy(&self) -> Arc<dyn ResolutionStrategy> {
        Arc::clone(&self.strategies[self.default])
    }

    /// Reconcile two copies, running the default strategy only when the
    /// copies actually conflict.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ObjectIdMismatch`] when the copies belong to
    /// different objects, or the strategy's own error.
    pub fn reconcile(&self, left: &ObjectMeta, right: &ObjectMeta) -> CoreResult<Resolution> {
        if left.object_id != right.object_id {
            return Err(CoreError::ObjectIdMismatch {
                left: left.object_id.clone(),
                right: right.object_id.clone(),
            });
        }

        match detect(left, right) {
            ConflictOutcome::LeftWins => Ok(Resolution::Merged(left.clone())),
            ConflictOutcome::RightWins => Ok(Resolution::Merged(right.clone())),
            ConflictOutcome::Conflict => {
                debug!(
                    object_id = %left.object_id,
                    strategy = self.default,
                    "Concurrent copies detected, resolving"
                );
                self.default_strategy().resolve(left, right)
            }
        }
    }
}

/// Queue of conflicts awaiting operator resolution.
#[derive(Debug, Default)]
pub struct PendingConflicts {
    entries: RwLock<HashMap<Uuid, PendingConflict>>,
}

impl PendingConflicts {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a conflict for the operator.
    pub async fn enqueue(&self, conflict: PendingConflict) {
        info!(
            conflict_id = %conflict.id,
            object_id = %conflict.left.object_id,
            priority = ?conflict.priority,
            "Conflict queued for manual resolution"
        );
        self.entries.write().await.insert(conflict.id, conflict);
    }

    /// All queued conflicts, most urgent first.
    pub async fn list(&self) -> Vec<PendingConflict> {
        let mut entries: Vec<PendingConflict> =
            self.entries.read().await.values().cloned().collect();
        entries.sort_by_key(|c| (priority_rank(c.priority), c.queued_at));
        entries
    }

    /// Number of queued conflicts.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when nothing is queued.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Apply the operator's choice, removing the entry from the queue.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownConflict`] when `id` is not queued.
    pub async fn resolve(&self, id: Uuid, side: ConflictSide) -> CoreResult<ObjectMeta> {
        let conflict = self
            .entries
            .write()
            .await
            .remove(&id)
            .ok_or(CoreError::UnknownConflict(id))?;

        let winner = match side {
            ConflictSide::Left => conflict.left,
            ConflictSide::Right => conflict.right,
        };
        info!(
            conflict_id = %id,
            object_id = %winner.object_id,
            side = ?side,
            "Conflict resolved by operator"
        );
        Ok(winner)
    }
}

fn priority_rank(priority: ConflictPriority) -> u8 {
    match priority {
        ConflictPriority::High => 0,
        ConflictPriority::Medium => 1,
        ConflictPriority::Low => 2,
    }
}
