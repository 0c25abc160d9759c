//! # EchoFS Core
//!
//! Object metadata model and durable state for the EchoFS adaptive
//! consistency core.
//!
//! ## Core Components
//!
//! - **Consistency modes**: the per-object replication mode (`C`, `A`,
//!   `Hybrid`) and the caller-owned mode hint
//! - **Vector clocks**: happens-before and concurrency detection between
//!   two versions of the same object
//! - **Conflict resolution**: pluggable strategies (last-writer-wins,
//!   vector-clock merge, CRDT merge, manual) behind a named registry
//! - **Metadata store**: durable `object_id -> ObjectMeta` map with
//!   write-ahead logging and snapshot/restore
//!
//! ## Usage
//!
//! ```rust,no_run
//! use echofs_core::{MetaStore, ModeHint, ObjectMeta, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MetaStore::open("./data/meta", StoreConfig::default()).await?;
//!
//!     let meta = ObjectMeta::new("reports/q3.pdf", ModeHint::Auto);
//!     store.put_durable(meta).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod conflict;
pub mod error;
pub mod mode;
pub mod object;
pub mod store;

// Re-export main types
pub use clock::{ClockOrdering, NodeId, VectorClock};
pub use conflict::{
    detect, ConflictOutcome, ConflictPriority, PendingConflict, PendingConflicts, Resolution,
    ResolutionStrategy, ResolverRegistry,
};
pub use error::{CoreError, CoreResult};
pub use mode::{ConsistencyMode, ModeHint, TransitionReason};
pub use object::{ChunkRef, ObjectMeta, ObjectStatus};
pub use store::{MetaStore, ObjectModeState, StoreConfig};
