//! Core error types and result definitions.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors produced by the metadata model and store.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Object not found in the store
    #[error("Object {0} not found")]
    ObjectNotFound(String),

    /// Chunk not found on an object
    #[error("Chunk {chunk_id} not found on object {object_id}")]
    ChunkNotFound {
        /// Object that was queried
        object_id: String,
        /// Missing chunk identifier
        chunk_id: String,
    },

    /// A write carried a version that does not advance the object
    #[error("Stale version for object {object_id}: current {current}, proposed {proposed}")]
    StaleVersion {
        /// Object being written
        object_id: String,
        /// Version currently recorded
        current: u64,
        /// Version the write carried
        proposed: u64,
    },

    /// Chunk index would leave a gap in the chunk sequence
    #[error("Chunk index {index} out of sequence for object {object_id} ({len} chunks)")]
    ChunkIndexGap {
        /// Object being written
        object_id: String,
        /// Index the write carried
        index: u32,
        /// Number of chunks currently recorded
        len: usize,
    },

    /// Unknown consistency mode string
    #[error("Invalid consistency mode: {0:?}")]
    InvalidMode(String),

    /// Unknown mode hint string
    #[error("Invalid mode hint: {0:?}")]
    InvalidHint(String),

    /// Conflict resolution strategy not registered
    #[error("Unknown conflict resolution strategy: {0:?}")]
    UnknownStrategy(String),

    /// Pending conflict id not found in the queue
    #[error("Pending conflict {0} not found")]
    UnknownConflict(uuid::Uuid),

    /// Two copies of different objects were handed to the resolver
    #[error("Cannot reconcile different objects: {left:?} vs {right:?}")]
    ObjectIdMismatch {
        /// Left copy's object id
        left: String,
        /// Right copy's object id
        right: String,
    },

    /// Write-ahead log record failed its checksum or framing
    #[error("WAL corrupt at offset {offset}: {detail}")]
    WalCorrupt {
        /// Byte offset of the bad record
        offset: u64,
        /// What went wrong
        detail: String,
    },

    /// Snapshot file could not be read or written
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Underlying filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for CoreError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
