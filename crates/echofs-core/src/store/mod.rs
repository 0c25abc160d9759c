//! Durable metadata store: `object_id -> ObjectMeta` plus the
//! controller singletons, layered as an in-memory map over a write-ahead
//! log with periodic snapshots.
//!
//! Mutations labeled durable (mode transitions, override changes,
//! critical-key edits) are flushed to the WAL before they become visible
//! in memory; everything else is appended without an fsync and rides the
//! next flush or snapshot.

mod snapshot;
mod wal;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::mode::{ConsistencyMode, TransitionReason};
use crate::object::ObjectMeta;

pub use wal::WalRecord;

use wal::Wal;

/// Controller-owned, persisted mode state for one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectModeState {
    /// Object this state belongs to
    pub object_id: String,
    /// Mode in force
    pub current_mode: ConsistencyMode,
    /// When the mode last changed
    pub last_change: DateTime<Utc>,
    /// How long a cached mode answer stays valid
    pub ttl_seconds: u64,
    /// Why the mode was last changed
    pub reason: TransitionReason,
    /// Consecutive agreeing policy votes toward a different mode
    pub consecutive_votes: u32,
    /// No transition may be proposed before this instant
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl ObjectModeState {
    /// Initial state for a newly registered object.
    #[must_use]
    pub fn new(object_id: impl Into<String>, mode: ConsistencyMode, ttl_seconds: u64) -> Self {
        Self {
            object_id: object_id.into(),
            current_mode: mode,
            last_change: Utc::now(),
            ttl_seconds,
            reason: TransitionReason::Registered,
            consecutive_votes: 0,
            cooldown_until: None,
        }
    }
}

/// Store tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Take a snapshot and reset the WAL after this many appended records
    pub snapshot_after_records: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_after_records: 4096,
        }
    }
}

const WAL_FILE: &str = "meta.wal";

/// In-memory image of the persisted state.
#[derive(Debug, Default)]
struct StoreState {
    objects: HashMap<String, ObjectMeta>,
    mode_states: HashMap<String, ObjectModeState>,
    global_override: Option<ConsistencyMode>,
    critical_keys: BTreeSet<String>,
    emergency_mode: bool,
}

impl StoreState {
    fn apply(&mut self, record: WalRecord) {
        match record {
            WalRecord::PutObject(meta) => {
                self.objects.insert(meta.object_id.clone(), meta);
            }
            WalRecord::DeleteObject(object_id) => {
                self.objects.remove(&object_id);
                self.mode_states.remove(&object_id);
            }
            WalRecord::PutModeState(state) => {
                self.mode_states.insert(state.object_id.clone(), state);
            }
            WalRecord::SetOverride(mode) => {
                self.global_override = mode;
            }
            WalRecord::SetCriticalKeys(keys) => {
                self.critical_keys = keys;
            }
            WalRecord::SetEmergency(flag) => {
                self.emergency_mode = flag;
            }
        }
    }

    fn to_snapshot(&self) -> snapshot::SnapshotData {
        snapshot::SnapshotData {
            objects: self.objects.clone(),
            mode_states: self.mode_states.clone(),
            global_override: self.global_override,
            critical_keys: self.critical_keys.clone(),
            emergency_mode: self.emergency_mode,
            taken_at: Some(Utc::now()),
        }
    }

    fn from_snapshot(data: snapshot::SnapshotData) -> Self {
        Self {
            objects: data.objects,
            mode_states: data.mode_states,
            global_override: data.global_override,
            critical_keys: data.critical_keys,
            emergency_mode: data.emergency_mode,
        }
    }
}

/// Durable key -> `ObjectMeta` map with WAL semantics.
pub struct MetaStore {
    dir: PathBuf,
    config: StoreConfig,
    state: RwLock<StoreState>,
    wal: Mutex<Wal>,
    records_since_snapshot: AtomicU64,
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MetaStore {
    /// Open the store under `dir`, creating it if needed.
    ///
    /// Startup loads the latest snapshot and replays the WAL on top, so
    /// the in-memory map equals the persisted state.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created or the
    /// snapshot/WAL cannot be read.
    pub async fn open(dir: impl Into<PathBuf>, config: StoreConfig) -> CoreResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let state = Self::load_state(&dir).await?;
        let wal = Wal::open(dir.join(WAL_FILE)).await?;

        info!(
            dir = %dir.display(),
            objects = state.objects.len(),
            mode_states = state.mode_states.len(),
            "Metadata store opened"
        );

        Ok(Self {
            dir,
            config,
            state: RwLock::new(state),
            wal: Mutex::new(wal),
            records_since_snapshot: AtomicU64::new(0),
        })
    }

    async fn load_state(dir: &Path) -> CoreResult<StoreState> {
        let mut state = match snapshot::read(dir).await? {
            Some(data) => StoreState::from_snapshot(data),
            None => StoreState::default(),
        };
        for record in Wal::replay(&dir.join(WAL_FILE)).await? {
            state.apply(record);
        }
        Ok(state)
    }

    /// Append a record, optionally flushing, then apply it in memory.
    ///
    /// The WAL write happens before the in-memory mutation becomes
    /// visible, so readers never observe state that could be lost.
    async fn log_and_apply(&self, record: WalRecord, flush: bool) -> CoreResult<()> {
        {
            let mut wal = self.wal.lock().await;
            wal.append(&record, flush).await?;
        }
        {
            let mut state = self.state.write().await;
            state.apply(record);
        }

        let appended = self.records_since_snapshot.fetch_add(1, Ordering::Relaxed) + 1;
        if appended >= self.config.snapshot_after_records {
            if let Err(err) = self.snapshot().await {
                warn!(error = %err, "Background snapshot failed, WAL keeps growing");
            }
        }
        Ok(())
    }

    /// Fetch an object's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ObjectNotFound`] for unknown ids.
    pub async fn get(&self, object_id: &str) -> CoreResult<ObjectMeta> {
        self.state
            .read()
            .await
            .objects
            .get(object_id)
            .cloned()
            .ok_or_else(|| CoreError::ObjectNotFound(object_id.to_string()))
    }

    /// Fetch an object's metadata if present.
    pub async fn try_get(&self, object_id: &str) -> Option<ObjectMeta> {
        self.state.read().await.objects.get(object_id).cloned()
    }

    /// True when the object exists.
    pub async fn contains(&self, object_id: &str) -> bool {
        self.state.read().await.objects.contains_key(object_id)
    }

    /// Upsert an object's metadata without forcing a flush.
    ///
    /// # Errors
    ///
    /// Returns an error when the WAL append fails.
    pub async fn put(&self, meta: ObjectMeta) -> CoreResult<()> {
        self.log_and_apply(WalRecord::PutObject(meta), false).await
    }

    /// Upsert an object's metadata, durable before return.
    ///
    /// Used for mutations the controller reports as complete only once
    /// they survive a crash (mode transitions embedded in the meta).
    ///
    /// # Errors
    ///
    /// Returns an error when the WAL append or flush fails.
    pub async fn put_durable(&self, meta: ObjectMeta) -> CoreResult<()> {
        self.log_and_apply(WalRecord::PutObject(meta), true).await
    }

    /// Remove an object and its mode state.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ObjectNotFound`] for unknown ids, or the WAL
    /// error.
    pub async fn delete(&self, object_id: &str) -> CoreResult<()> {
        if !self.contains(object_id).await {
            return Err(CoreError::ObjectNotFound(object_id.to_string()));
        }
        self.log_and_apply(WalRecord::DeleteObject(object_id.to_string()), true)
            .await
    }

    /// All object metadata records.
    pub async fn list(&self) -> Vec<ObjectMeta> {
        self.state.read().await.objects.values().cloned().collect()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.state.read().await.objects.len()
    }

    /// True when no objects are stored.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.objects.is_empty()
    }

    /// Controller mode state for one object.
    pub async fn mode_state(&self, object_id: &str) -> Option<ObjectModeState> {
        self.state.read().await.mode_states.get(object_id).cloned()
    }

    /// All controller mode states, for startup reconciliation.
    pub async fn load_mode_states(&self) -> HashMap<String, ObjectModeState> {
        self.state.read().await.mode_states.clone()
    }

    /// Persist a controller mode state, durable before return.
    ///
    /// # Errors
    ///
    /// Returns an error when the WAL append or flush fails.
    pub async fn put_mode_state_durable(&self, state: ObjectModeState) -> CoreResult<()> {
        debug!(
            object_id = %state.object_id,
            mode = %state.current_mode,
            reason = %state.reason,
            "Persisting mode state"
        );
        self.log_and_apply(WalRecord::PutModeState(state), true).await
    }

    /// The global override singleton.
    pub async fn global_override(&self) -> Option<ConsistencyMode> {
        self.state.read().await.global_override
    }

    /// Set or clear the global override, durable before return.
    ///
    /// # Errors
    ///
    /// Returns an error when the WAL append or flush fails.
    pub async fn set_global_override(&self, mode: Option<ConsistencyMode>) -> CoreResult<()> {
        self.log_and_apply(WalRecord::SetOverride(mode), true).await
    }

    /// The critical-keys singleton.
    pub async fn critical_keys(&self) -> BTreeSet<String> {
        self.state.read().await.critical_keys.clone()
    }

    /// Replace the critical-keys singleton, durable before return.
    ///
    /// # Errors
    ///
    /// Returns an error when the WAL append or flush fails.
    pub async fn set_critical_keys(&self, keys: BTreeSet<String>) -> CoreResult<()> {
        self.log_and_apply(WalRecord::SetCriticalKeys(keys), true).await
    }

    /// The emergency-mode singleton.
    pub async fn emergency_mode(&self) -> bool {
        self.state.read().await.emergency_mode
    }

    /// Set the emergency-mode singleton, durable before return.
    ///
    /// # Errors
    ///
    /// Returns an error when the WAL append or flush fails.
    pub async fn set_emergency_mode(&self, flag: bool) -> CoreResult<()> {
        self.log_and_apply(WalRecord::SetEmergency(flag), true).await
    }

    /// Write a snapshot of the current state and reset the WAL.
    ///
    /// # Errors
    ///
    /// Returns an error when the snapshot write or WAL reset fails.
    pub async fn snapshot(&self) -> CoreResult<()> {
        // Hold the WAL lock across the snapshot so no append lands
        // between the state copy and the reset.
        let mut wal = self.wal.lock().await;
        let data = self.state.read().await.to_snapshot();
        snapshot::write(&self.dir, &data).await?;
        wal.reset().await?;
        self.records_since_snapshot.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Rebuild the in-memory map from disk.
    ///
    /// # Errors
    ///
    /// Returns an error when the snapshot or WAL cannot be read.
    pub async fn restore(&self) -> CoreResult<()> {
        // Serialize against writers so a concurrent append cannot land
        // between the disk read and the map swap.
        let _wal = self.wal.lock().await;
        let fresh = Self::load_state(&self.dir).await?;
        let mut state = self.state.write().await;
        *state = fresh;
        info!(
            dir = %self.dir.display(),
            objects = state.objects.len(),
            "Store state restored from disk"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ModeHint;
    use crate::object::ChunkRef;

    async fn open_store(dir: &Path) -> MetaStore {
        MetaStore::open(dir, StoreConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let meta = ObjectMeta::new("obj1", ModeHint::Auto);
        store.put(meta.clone()).await.unwrap();

        let got = store.get("obj1").await.unwrap();
        assert_eq!(got.object_id, "obj1");

        store.delete("obj1").await.unwrap();
        assert!(matches!(
            store.get("obj1").await,
            Err(CoreError::ObjectNotFound(_))
        ));
        assert!(matches!(
            store.delete("obj1").await,
            Err(CoreError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reopen_replays_wal() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = open_store(dir.path()).await;
            let mut meta = ObjectMeta::new("obj1", ModeHint::Auto);
            meta.record_write(ChunkRef::new(0, 64, "crc", 1), "n1").unwrap();
            store.put_durable(meta).await.unwrap();
            store.set_emergency_mode(true).await.unwrap();
        }

        let store = open_store(dir.path()).await;
        let meta = store.get("obj1").await.unwrap();
        assert_eq!(meta.last_version, 1);
        assert!(store.emergency_mode().await);
    }

    #[tokio::test]
    async fn test_snapshot_compacts_and_reopens() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = open_store(dir.path()).await;
            store
                .put_durable(ObjectMeta::new("obj1", ModeHint::Auto))
                .await
                .unwrap();
            store
                .put_mode_state_durable(ObjectModeState::new(
                    "obj1",
                    ConsistencyMode::Strong,
                    300,
                ))
                .await
                .unwrap();
            store.snapshot().await.unwrap();
            // Post-snapshot mutation lands in the fresh WAL.
            store
                .put_durable(ObjectMeta::new("obj2", ModeHint::Available))
                .await
                .unwrap();
        }

        let store = open_store(dir.path()).await;
        assert_eq!(store.len().await, 2);
        assert!(store.mode_state("obj1").await.is_some());
        assert_eq!(
            store.get("obj2").await.unwrap().current_mode,
            ConsistencyMode::Available
        );
    }

    #[tokio::test]
    async fn test_restore_matches_pre_shutdown_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store
            .put_durable(ObjectMeta::new("obj1", ModeHint::Auto))
            .await
            .unwrap();
        store
            .put_mode_state_durable(ObjectModeState::new("obj1", ConsistencyMode::Hybrid, 300))
            .await
            .unwrap();
        let before = store.load_mode_states().await;

        store.restore().await.unwrap();
        let after = store.load_mode_states().await;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_singletons_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = open_store(dir.path()).await;
            store
                .set_global_override(Some(ConsistencyMode::Available))
                .await
                .unwrap();
            let mut keys = BTreeSet::new();
            keys.insert("obj1".to_string());
            store.set_critical_keys(keys).await.unwrap();
        }

        let store = open_store(dir.path()).await;
        assert_eq!(
            store.global_override().await,
            Some(ConsistencyMode::Available)
        );
        assert!(store.critical_keys().await.contains("obj1"));
    }
}
