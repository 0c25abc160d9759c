//! Append-only write-ahead log for metadata mutations.
//!
//! Records are framed as `[u32 len][u32 crc32][bincode payload]`. Replay
//! stops at the first truncated or corrupt record, which after a crash
//! can only be the tail write.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::mode::ConsistencyMode;
use crate::object::ObjectMeta;
use crate::store::ObjectModeState;

/// One durable metadata mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord {
    /// Object metadata upsert
    PutObject(ObjectMeta),
    /// Object removal
    DeleteObject(String),
    /// Controller mode-state upsert
    PutModeState(ObjectModeState),
    /// Global override singleton
    SetOverride(Option<ConsistencyMode>),
    /// Critical-keys singleton
    SetCriticalKeys(BTreeSet<String>),
    /// Emergency-mode singleton
    SetEmergency(bool),
}

/// Append handle over the log file.
pub(crate) struct Wal {
    path: PathBuf,
    file: File,
}

impl Wal {
    /// Open the log for appending, creating it if absent.
    pub(crate) async fn open(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!(path = %path.display(), "WAL opened");
        Ok(Self { path, file })
    }

    /// Append one record; `flush` forces the bytes to disk before
    /// returning, which is what makes a mutation durable.
    pub(crate) async fn append(&mut self, record: &WalRecord, flush: bool) -> CoreResult<()> {
        let payload = bincode::serialize(record)?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            CoreError::Serialization(format!("WAL record too large: {} bytes", payload.len()))
        })?;
        let crc = crc32fast::hash(&payload);

        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&payload);

        self.file.write_all(&frame).await?;
        if flush {
            self.file.sync_data().await?;
        }
        Ok(())
    }

    /// Truncate the log after its contents were folded into a snapshot.
    pub(crate) async fn reset(&mut self) -> CoreResult<()> {
        self.file = File::create(&self.path).await?;
        self.file.sync_data().await?;
        debug!(path = %self.path.display(), "WAL reset after snapshot");
        Ok(())
    }

    /// Read back every intact record in the log.
    ///
    /// A truncated or checksum-failing tail ends the replay with a
    /// warning instead of an error; everything before it is returned.
    pub(crate) async fn replay(path: &Path) -> CoreResult<Vec<WalRecord>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        let mut offset = 0usize;

        while offset < bytes.len() {
            if bytes.len() - offset < 8 {
                warn!(
                    path = %path.display(),
                    offset,
                    "Truncated WAL frame header, dropping tail"
                );
                break;
            }

            let len =
                u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
                    as usize;
            let crc = u32::from_le_bytes([
                bytes[offset + 4],
                bytes[offset + 5],
                bytes[offset + 6],
                bytes[offset + 7],
            ]);

            let start = offset + 8;
            if bytes.len() - start < len {
                warn!(
                    path = %path.display(),
                    offset,
                    "Truncated WAL payload, dropping tail"
                );
                break;
            }

            let payload = &bytes[start..start + len];
            if crc32fast::hash(payload) != crc {
                warn!(
                    path = %path.display(),
                    offset,
                    "WAL checksum mismatch, dropping tail"
                );
                break;
            }

            match bincode::deserialize::<WalRecord>(payload) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        offset,
                        error = %err,
                        "Undecodable WAL record, dropping tail"
                    );
                    break;
                }
            }

            offset = start + len;
        }

        debug!(
            path = %path.display(),
            count = records.len(),
            "WAL replay complete"
        );
        Ok(records)
    }
}
