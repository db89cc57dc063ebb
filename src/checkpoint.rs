use crate::bitmap::GroupBitmap;
use crate::event::SourcePosition;
use crate::id::WorkerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Point every group before which is known to be committed.
///
/// `index` counts the groups retired since the log began, carried across
/// restarts, so it is also the absolute index of the first group after the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointBase {
    pub position: Option<SourcePosition>,
    pub index: u64,
}

/// Coordinator-level checkpoint: the low-water-mark position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoordinatorCheckpoint {
    /// End position of the last group of the committed prefix.
    pub position: Option<SourcePosition>,
    /// Highest sequence number of the committed prefix, when known.
    pub lwm_sequence: Option<u64>,
    /// Groups retired since the log began.
    pub group_index: u64,
    /// Number of checkpoints written.
    pub checkpoint_seqno: u64,
}

impl CoordinatorCheckpoint {
    pub fn base(&self) -> CheckpointBase {
        CheckpointBase {
            position: self.position,
            index: self.group_index,
        }
    }
}

/// Per-worker checkpoint: last applied group plus the groups it committed since its base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCheckpoint {
    pub worker: WorkerId,
    pub base_position: Option<SourcePosition>,
    pub base_index: u64,
    pub last_position: Option<SourcePosition>,
    pub last_group_index: Option<u64>,
    /// Bit `i` set = group `base_index + i` was committed by this worker.
    pub bitmap: GroupBitmap,
}

impl WorkerCheckpoint {
    pub fn new(worker: WorkerId, base: CheckpointBase) -> Self {
        Self {
            worker,
            base_position: base.position,
            base_index: base.index,
            last_position: None,
            last_group_index: None,
            bitmap: GroupBitmap::new(),
        }
    }

    /// Moves the record onto a newer base, dropping bits the base already covers.
    pub fn rebase(&mut self, base: CheckpointBase) -> bool {
        if base.index <= self.base_index {
            return false;
        }
        self.bitmap.shift_down(base.index - self.base_index);
        self.base_index = base.index;
        self.base_position = base.position;
        true
    }

    /// Folds a committed group into the record, rebasing onto `base` first.
    pub fn record_commit(
        &mut self,
        base: CheckpointBase,
        group_index: u64,
        position: SourcePosition,
    ) {
        self.rebase(base);
        if let Some(offset) = group_index.checked_sub(self.base_index) {
            self.bitmap.set(offset);
        }
        self.last_position = Some(position);
        self.last_group_index = Some(group_index);
    }
}

/// Everything the pool persists: one coordinator record plus one record per worker.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub coordinator: CoordinatorCheckpoint,
    #[serde(default)]
    pub workers: BTreeMap<usize, WorkerCheckpoint>,
}

impl CheckpointRecord {
    /// Replaces stored worker records with ones committed alongside the data
    /// when those are further along.
    pub fn adopt_committed(&mut self, committed: impl IntoIterator<Item = WorkerCheckpoint>) {
        for progress in committed {
            let index = progress.worker.index();
            let newer = self
                .workers
                .get(&index)
                .map_or(true, |stored| progress.last_group_index > stored.last_group_index);
            if newer {
                self.workers.insert(index, progress);
            }
        }
    }
}

/// Error surfaced when checkpoint persistence or loading fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("checkpoint persistence failed: {0}")]
    Persist(String),
    #[error("checkpoint at {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Durable home of the checkpoint record. Every write must be atomic with respect to a crash.
pub trait CheckpointStore: Send + Sync {
    fn load(&self) -> Result<CheckpointRecord, CheckpointError>;
    fn persist_coordinator(&self, checkpoint: &CoordinatorCheckpoint)
        -> Result<(), CheckpointError>;
    fn persist_worker(&self, checkpoint: &WorkerCheckpoint) -> Result<(), CheckpointError>;
}

/// Volatile store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    record: Mutex<CheckpointRecord>,
    writes: AtomicU64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: CheckpointRecord) -> Self {
        Self {
            record: Mutex::new(record),
            writes: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> CheckpointRecord {
        self.record.lock().clone()
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<CheckpointRecord, CheckpointError> {
        Ok(self.snapshot())
    }

    fn persist_coordinator(
        &self,
        checkpoint: &CoordinatorCheckpoint,
    ) -> Result<(), CheckpointError> {
        self.record.lock().coordinator = *checkpoint;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn persist_worker(&self, checkpoint: &WorkerCheckpoint) -> Result<(), CheckpointError> {
        self.record
            .lock()
            .workers
            .insert(checkpoint.worker.index(), checkpoint.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredCheckpoint {
    checksum: String,
    record: CheckpointRecord,
}

/// File-backed store: JSON body with a SHA-256 checksum, rewritten via temp file,
/// fsync and rename.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    record: Mutex<CheckpointRecord>,
}

impl FileCheckpointStore {
    /// Opens the store, loading the existing record when the file is present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let record = if path.exists() {
            read_record(&path)?
        } else {
            CheckpointRecord::default()
        };
        Ok(Self {
            path,
            record: Mutex::new(record),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rewrite(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let body = serde_json::to_vec(record).map_err(persist_error)?;
        let stored = StoredCheckpoint {
            checksum: compute_checksum(&body),
            record: record.clone(),
        };
        let payload = serde_json::to_vec_pretty(&stored).map_err(persist_error)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(persist_error)?;
            file.write_all(&payload).map_err(persist_error)?;
            file.sync_all().map_err(persist_error)?;
        }
        fs::rename(&tmp, &self.path).map_err(persist_error)?;
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            // Directory fsync makes the rename itself durable; not every platform allows it.
            if let Ok(handle) = File::open(dir) {
                let _ = handle.sync_all();
            }
        }
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<CheckpointRecord, CheckpointError> {
        Ok(self.record.lock().clone())
    }

    fn persist_coordinator(
        &self,
        checkpoint: &CoordinatorCheckpoint,
    ) -> Result<(), CheckpointError> {
        let mut guard = self.record.lock();
        let mut next = guard.clone();
        next.coordinator = *checkpoint;
        self.rewrite(&next)?;
        *guard = next;
        Ok(())
    }

    fn persist_worker(&self, checkpoint: &WorkerCheckpoint) -> Result<(), CheckpointError> {
        let mut guard = self.record.lock();
        let mut next = guard.clone();
        next.workers
            .insert(checkpoint.worker.index(), checkpoint.clone());
        self.rewrite(&next)?;
        *guard = next;
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<CheckpointRecord, CheckpointError> {
    let corrupt = |reason: String| CheckpointError::Corrupt {
        path: path.display().to_string(),
        reason,
    };
    let payload = fs::read(path).map_err(|err| corrupt(err.to_string()))?;
    let stored: StoredCheckpoint =
        serde_json::from_slice(&payload).map_err(|err| corrupt(err.to_string()))?;
    let body = serde_json::to_vec(&stored.record).map_err(|err| corrupt(err.to_string()))?;
    if compute_checksum(&body) != stored.checksum {
        return Err(corrupt("checksum mismatch".into()));
    }
    Ok(stored.record)
}

fn persist_error(err: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::Persist(err.to_string())
}

fn compute_checksum(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    to_hex(&digest)
}

fn to_hex(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        encoded.push_str(&format!("{:02x}", byte));
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_record_rebases_bitmap_on_newer_base() {
        let base = CheckpointBase {
            position: None,
            index: 0,
        };
        let mut record = WorkerCheckpoint::new(WorkerId::new(0), base);
        record.record_commit(base, 1, SourcePosition::new(1, 200));
        record.record_commit(base, 3, SourcePosition::new(1, 400));
        assert_eq!(record.bitmap, GroupBitmap::from_bits([1, 3]));

        let newer = CheckpointBase {
            position: Some(SourcePosition::new(1, 200)),
            index: 2,
        };
        record.record_commit(newer, 4, SourcePosition::new(1, 500));
        assert_eq!(record.base_index, 2);
        assert_eq!(record.base_position, Some(SourcePosition::new(1, 200)));
        assert_eq!(record.bitmap, GroupBitmap::from_bits([1, 2]));
        assert_eq!(record.last_group_index, Some(4));
    }
}
