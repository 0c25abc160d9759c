//! Point-in-time snapshots of the metadata map.
//!
//! Snapshots are written to a temporary file and atomically renamed into
//! place, so a crash mid-write leaves the previous snapshot intact. On
//! startup the store loads the snapshot and replays the WAL on top.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::mode::ConsistencyMode;
use crate::object::ObjectMeta;
use crate::store::ObjectModeState;

const SNAPSHOT_FILE: &str = "meta.snapshot";
const SNAPSHOT_TMP: &str = "meta.snapshot.tmp";

/// Everything the store persists, in one frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SnapshotData {
    /// Object metadata records keyed by object id
    pub objects: HashMap<String, ObjectMeta>,
    /// Controller mode states keyed by object id
    pub mode_states: HashMap<String, ObjectModeState>,
    /// Global override singleton
    pub global_override: Option<ConsistencyMode>,
    /// Critical-keys singleton
    pub critical_keys: BTreeSet<String>,
    /// Emergency-mode singleton
    pub emergency_mode: bool,
    /// When the snapshot was taken
    pub taken_at: Option<DateTime<Utc>>,
}

/// Path of the live snapshot under `dir`.
pub(crate) fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join(SNAPSHOT_FILE)
}

/// Write `data` durably under `dir`.
pub(crate) async fn write(dir: &Path, data: &SnapshotData) -> CoreResult<()> {
    let tmp = dir.join(SNAPSHOT_TMP);
    let bytes = bincode::serialize(data)?;

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, snapshot_path(dir)).await?;
    info!(
        dir = %dir.display(),
        objects = data.objects.len(),
        bytes = bytes.len(),
        "Snapshot written"
    );
    Ok(())
}

/// Load the snapshot under `dir`, if one exists.
pub(crate) async fn read(dir: &Path) -> CoreResult<Option<SnapshotData>> {
    let path = snapshot_path(dir);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let data: SnapshotData = bincode::deserialize(&bytes)
        .map_err(|err| CoreError::Snapshot(format!("{}: {}", path.display(), err)))?;
    debug!(
        dir = %dir.display(),
        objects = data.objects.len(),
        "Snapshot loaded"
    );
    Ok(Some(data))
}
