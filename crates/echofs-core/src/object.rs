//! Object metadata: the per-object record owned by the controller and
//! the metadata store.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{NodeId, VectorClock};
use crate::error::{CoreError, CoreResult};
use crate::mode::{ConsistencyMode, ModeHint};

/// Lifecycle status of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    /// Object accepts reads and writes
    #[default]
    Active,
    /// Object is tombstoned; chunks await garbage collection
    Deleted,
}

/// Reference to one stored chunk of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Unique chunk identifier
    pub chunk_id: Uuid,
    /// Position of the chunk within the object (contiguous from 0)
    pub index: u32,
    /// Chunk size in bytes
    pub size: u64,
    /// Content checksum as reported by the writer
    pub checksum: String,
    /// Nodes holding a copy of this chunk
    pub workers: BTreeSet<NodeId>,
    /// Object version this chunk was written at
    pub version: u64,
}

impl ChunkRef {
    /// Create a chunk reference for a fresh write.
    #[must_use]
    pub fn new(index: u32, size: u64, checksum: impl Into<String>, version: u64) -> Self {
        Self {
            chunk_id: Uuid::new_v4(),
            index,
            size,
            checksum: checksum.into(),
            workers: BTreeSet::new(),
            version,
        }
    }

    /// Record a node as holding this chunk.
    pub fn add_worker(&mut self, node: &str) {
        self.workers.insert(node.to_string());
    }
}

/// Per-object metadata record.
///
/// Mutated by writes (chunks, version, vector clock), by the controller
/// (`current_mode`), and by conflict resolution (merged state).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Primary key
    pub object_id: String,
    /// Total object size in bytes (sum of chunk sizes)
    pub size: u64,
    /// Ordered chunk references; indices contiguous from 0
    pub chunks: Vec<ChunkRef>,
    /// Caller preference; never decides the mode alone
    pub mode_hint: ModeHint,
    /// Mode in force for new operations; controller-owned
    pub current_mode: ConsistencyMode,
    /// Monotonically increasing version, bumped on every acked write
    pub last_version: u64,
    /// One counter per node that has ever written this object
    pub vector_clock: VectorClock,
    /// When background replication last caught up
    pub last_sync_ts: Option<DateTime<Utc>>,
    /// When the controller last changed `current_mode`
    pub last_mode_change: Option<DateTime<Utc>>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
    /// Lifecycle status
    pub status: ObjectStatus,
}

impl ObjectMeta {
    /// Create metadata for a newly registered object.
    ///
    /// The object starts at version 0 in the mode implied by the hint.
    #[must_use]
    pub fn new(object_id: impl Into<String>, hint: ModeHint) -> Self {
        let now = Utc::now();
        Self {
            object_id: object_id.into(),
            size: 0,
            chunks: Vec::new(),
            mode_hint: hint,
            current_mode: hint.initial_mode(),
            last_version: 0,
            vector_clock: VectorClock::new(),
            last_sync_ts: None,
            last_mode_change: None,
            created_at: now,
            updated_at: now,
            status: ObjectStatus::default(),
        }
    }

    /// Version the next write must embed.
    ///
    /// Reads `last_version + 1` without mutating, so a retried failed
    /// write allocates the same version and never double-advances.
    #[must_use]
    pub fn next_version(&self) -> u64 {
        self.last_version + 1
    }

    /// Record an acknowledged write of `chunk` performed via `node`.
    ///
    /// Bumps `last_version` to the chunk's version, increments the
    /// vector clock entry for the writing node, and recomputes the
    /// object size. Only called after the strategy acked the write.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StaleVersion`] when the chunk does not
    /// advance the object version, or [`CoreError::ChunkIndexGap`] when
    /// the chunk index would break the contiguous sequence.
    pub fn record_write(&mut self, chunk: ChunkRef, node: &str) -> CoreResult<()> {
        if chunk.version <= self.last_version {
            return Err(CoreError::StaleVersion {
                object_id: self.object_id.clone(),
                current: self.last_version,
                proposed: chunk.version,
            });
        }

        let index = chunk.index as usize;
        if index > self.chunks.len() {
            return Err(CoreError::ChunkIndexGap {
                object_id: self.object_id.clone(),
                index: chunk.index,
                len: self.chunks.len(),
            });
        }

        self.last_version = chunk.version;
        if index == self.chunks.len() {
            self.chunks.push(chunk);
        } else {
            self.chunks[index] = chunk;
        }

        self.vector_clock.increment(node);
        self.size = self.chunks.iter().map(|c| c.size).sum();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Look up a chunk by its id.
    #[must_use]
    pub fn chunk_by_id(&self, chunk_id: Uuid) -> Option<&ChunkRef> {
        self.chunks.iter().find(|c| c.chunk_id == chunk_id)
    }

    /// Look up a chunk by its position.
    #[must_use]
    pub fn chunk_by_index(&self, index: u32) -> Option<&ChunkRef> {
        self.chunks.get(index as usize)
    }

    /// Tombstone the object.
    pub fn mark_deleted(&mut self) {
        self.status = ObjectStatus::Deleted;
        self.updated_at = Utc::now();
    }

    /// True while the object accepts operations.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ObjectStatus::Active
    }
}
