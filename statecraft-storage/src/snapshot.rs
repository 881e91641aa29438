//! Snapshot storage.

use crate::error::StorageError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use statecraft_interp::SessionSnapshot;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const INDEX_FILE: &str = "index.json";

/// When a session runner persists its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPolicy {
    Never,
    /// Once, when the runner stops.
    OnExit,
    /// After every N macrosteps, and when the runner stops.
    EveryNSteps(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::OnExit
    }
}

impl SnapshotPolicy {
    /// Returns true if a snapshot is due after `steps` macrosteps.
    pub fn due_after(&self, steps: u64) -> bool {
        match self {
            SnapshotPolicy::EveryNSteps(n) => *n > 0 && steps > 0 && steps % n == 0,
            SnapshotPolicy::Never | SnapshotPolicy::OnExit => false,
        }
    }

    pub fn on_exit(&self) -> bool {
        !matches!(self, SnapshotPolicy::Never)
    }
}

/// Snapshot metadata kept in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub snapshot_id: String,
    pub session_id: String,
    /// Name of the document the session runs.
    pub document: String,
    /// Checksum of that document.
    pub document_checksum: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub size_bytes: u64,
    /// crc32c of the snapshot file.
    pub checksum: String,
}

/// Directory of session snapshots, keeping the latest one per session.
pub struct SnapshotStore {
    dir: PathBuf,
    /// session_id -> latest snapshot.
    index: RwLock<BTreeMap<String, SnapshotMeta>>,
}

impl SnapshotStore {
    /// Opens or creates a snapshot store at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            index: RwLock::new(BTreeMap::new()),
        };
        store.load_index()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_index(&self) -> Result<(), StorageError> {
        let index_path = self.dir.join(INDEX_FILE);
        if !index_path.exists() {
            return Ok(());
        }

        let reader = BufReader::new(File::open(&index_path)?);
        let index: BTreeMap<String, SnapshotMeta> = serde_json::from_reader(reader)?;
        tracing::debug!(dir = %self.dir.display(), snapshots = index.len(), "loaded snapshot index");
        *self.index.write() = index;
        Ok(())
    }

    /// Writes the index through a temporary file so a crash leaves either the
    /// old or the new index.
    fn save_index(&self, index: &BTreeMap<String, SnapshotMeta>) -> Result<(), StorageError> {
        let tmp = self.dir.join(format!("{}.tmp", INDEX_FILE));
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, index)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(INDEX_FILE))?;
        Ok(())
    }

    /// Persists a snapshot as the latest one of its session. The previous
    /// snapshot file of the session is removed.
    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<SnapshotMeta, StorageError> {
        let data = serde_json::to_vec_pretty(snapshot)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&data));
        let snapshot_id = uuid::Uuid::new_v4().to_string();

        let path = self.snapshot_path(&snapshot_id);
        let mut file = File::create(&path)?;
        file.write_all(&data)?;
        file.sync_all()?;

        let meta = SnapshotMeta {
            snapshot_id,
            session_id: snapshot.session_id.clone(),
            document: snapshot.document.clone(),
            document_checksum: snapshot.checksum.clone(),
            created_at: now_millis(),
            size_bytes: data.len() as u64,
            checksum,
        };

        let replaced = {
            let mut index = self.index.write();
            let replaced = index.insert(meta.session_id.clone(), meta.clone());
            self.save_index(&index)?;
            replaced
        };
        if let Some(old) = replaced {
            let old_path = self.snapshot_path(&old.snapshot_id);
            if let Err(e) = fs::remove_file(&old_path) {
                tracing::warn!(path = %old_path.display(), "cannot remove replaced snapshot: {}", e);
            }
        }

        tracing::info!(
            session = %meta.session_id,
            snapshot = %meta.snapshot_id,
            bytes = meta.size_bytes,
            "snapshot saved"
        );
        Ok(meta)
    }

    /// Loads a snapshot by id, verifying its checksum.
    pub fn load(&self, snapshot_id: &str) -> Result<SessionSnapshot, StorageError> {
        let path = self.snapshot_path(snapshot_id);
        if !path.exists() {
            return Err(StorageError::SnapshotNotFound(snapshot_id.to_string()));
        }

        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;

        let expected = self
            .index
            .read()
            .values()
            .find(|m| m.snapshot_id == snapshot_id)
            .map(|m| m.checksum.clone());
        if let Some(expected) = expected {
            let actual = format!("{:08x}", crc32c::crc32c(&data));
            if actual != expected {
                return Err(StorageError::Corruption(format!(
                    "snapshot {} checksum mismatch",
                    snapshot_id
                )));
            }
        }

        Ok(serde_json::from_slice(&data)?)
    }

    /// Latest snapshot of a session.
    pub fn latest(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StorageError> {
        let snapshot_id = self
            .index
            .read()
            .get(session_id)
            .map(|m| m.snapshot_id.clone());
        snapshot_id.map(|id| self.load(&id)).transpose()
    }

    pub fn meta(&self, session_id: &str) -> Option<SnapshotMeta> {
        self.index.read().get(session_id).cloned()
    }

    /// Metadata of all stored snapshots, by session id.
    pub fn list(&self) -> Vec<SnapshotMeta> {
        self.index.read().values().cloned().collect()
    }

    /// Removes the snapshot of a session. Returns false if it had none.
    pub fn delete(&self, session_id: &str) -> Result<bool, StorageError> {
        let removed = {
            let mut index = self.index.write();
            let removed = index.remove(session_id);
            if removed.is_some() {
                self.save_index(&index)?;
            }
            removed
        };
        let Some(meta) = removed else {
            return Ok(false);
        };
        let path = self.snapshot_path(&meta.snapshot_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        tracing::info!(session = %session_id, snapshot = %meta.snapshot_id, "snapshot deleted");
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    fn snapshot_path(&self, snapshot_id: &str) -> PathBuf {
        self.dir.join(format!("{}.snap", snapshot_id))
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
