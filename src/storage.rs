//! Storage-engine boundary: one session per worker plus an in-memory engine
//! with row locks, used by tests and the replay tool.

use crate::checkpoint::WorkerCheckpoint;
use crate::event::{ChangeRecord, EventGroup};
use crate::id::{ChannelId, WorkerId};
use crate::test_hooks::TestHookRegistry;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Default time a session waits for a row lock before giving up.
pub const DEFAULT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Transaction currently holding a lock another session waits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub channel: ChannelId,
    pub worker: WorkerId,
}

/// Callback invoked by a session when it starts waiting on another session's lock.
pub trait LockWaitHook {
    fn on_lock_wait(&self, holder: &LockHolder);
}

/// Hook that ignores lock waits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLockWaitHook;

impl LockWaitHook for NoLockWaitHook {
    fn on_lock_wait(&self, _holder: &LockHolder) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("lock wait timeout on {key}")]
    LockWaitTimeout { key: String },
    #[error("transaction chosen as deadlock victim")]
    Deadlock,
    #[error("storage failure: {0}")]
    Fatal(String),
}

impl StorageError {
    /// Transient errors are rolled back and retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::LockWaitTimeout { .. } | StorageError::Deadlock
        )
    }
}

/// Opens per-worker sessions.
pub trait StorageEngine: Send + Sync {
    fn session(&self, worker: WorkerId) -> Box<dyn StorageSession>;

    /// Worker checkpoints written by [`StorageSession::begin_commit`] in the
    /// same transaction as the groups they record.
    fn worker_checkpoints(&self) -> Vec<WorkerCheckpoint> {
        Vec::new()
    }
}

/// One unit of work at a time: apply, then commit or roll back.
pub trait StorageSession: Send {
    fn apply(&mut self, group: &EventGroup, hook: &dyn LockWaitHook) -> Result<(), StorageError>;
    /// Commits the applied group. Engines with a metadata table store
    /// `progress` atomically with it.
    fn begin_commit(&mut self, progress: &WorkerCheckpoint) -> Result<(), StorageError>;
    fn rollback(&mut self) -> Result<(), StorageError>;
}

/// Commit recorded by [`MemoryStorage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitRecord {
    pub worker: WorkerId,
    pub group: String,
    pub sequence_number: Option<u64>,
}

#[derive(Debug, Default)]
struct MemoryState {
    locks: HashMap<String, WorkerId>,
    rows: BTreeMap<String, Vec<u8>>,
    commits: Vec<CommitRecord>,
    failures: HashMap<String, u32>,
    commit_failures: HashMap<String, u32>,
    progress: BTreeMap<usize, WorkerCheckpoint>,
}

#[derive(Debug)]
struct MemoryShared {
    channel: ChannelId,
    state: Mutex<MemoryState>,
    released: Condvar,
    hooks: TestHookRegistry,
    lock_timeout: Duration,
}

/// In-memory engine with row-level locks held until commit or rollback.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    shared: Arc<MemoryShared>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(ChannelId::default())
    }
}

impl MemoryStorage {
    pub fn new(channel: ChannelId) -> Self {
        Self::with_hooks(channel, TestHookRegistry::new())
    }

    pub fn with_hooks(channel: ChannelId, hooks: TestHookRegistry) -> Self {
        Self::build(channel, hooks, DEFAULT_LOCK_WAIT_TIMEOUT)
    }

    pub fn build(channel: ChannelId, hooks: TestHookRegistry, lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(MemoryShared {
                channel,
                state: Mutex::new(MemoryState::default()),
                released: Condvar::new(),
                hooks,
                lock_timeout,
            }),
        }
    }

    /// Commits in the order they happened.
    pub fn commits(&self) -> Vec<CommitRecord> {
        self.shared.state.lock().commits.clone()
    }

    pub fn committed_groups(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .commits
            .iter()
            .map(|commit| commit.group.clone())
            .collect()
    }

    pub fn row(&self, partition: &str, key: &str) -> Option<Vec<u8>> {
        let lock_key = format!("{partition}/{key}");
        self.shared.state.lock().rows.get(&lock_key).cloned()
    }

    pub fn held_locks(&self) -> usize {
        self.shared.state.lock().locks.len()
    }
}

impl StorageEngine for MemoryStorage {
    fn session(&self, worker: WorkerId) -> Box<dyn StorageSession> {
        Box::new(MemorySession {
            shared: self.shared.clone(),
            worker,
            held: Vec::new(),
            staged: None,
        })
    }

    fn worker_checkpoints(&self) -> Vec<WorkerCheckpoint> {
        self.shared.state.lock().progress.values().cloned().collect()
    }
}

#[derive(Debug)]
struct StagedGroup {
    id: String,
    sequence_number: Option<u64>,
    records: Vec<ChangeRecord>,
}

struct MemorySession {
    shared: Arc<MemoryShared>,
    worker: WorkerId,
    held: Vec<String>,
    staged: Option<StagedGroup>,
}

impl MemorySession {
    fn lock(&mut self, key: &str, hook: &dyn LockWaitHook) -> Result<(), StorageError> {
        let deadline = Instant::now() + self.shared.lock_timeout;
        let mut reported = false;
        let mut guard = self.shared.state.lock();
        loop {
            let current = guard.locks.get(key).copied();
            match current {
                None => {
                    guard.locks.insert(key.to_string(), self.worker);
                    self.held.push(key.to_string());
                    return Ok(());
                }
                Some(owner) if owner == self.worker => return Ok(()),
                Some(owner) => {
                    if !reported {
                        reported = true;
                        let holder = LockHolder {
                            channel: self.shared.channel.clone(),
                            worker: owner,
                        };
                        drop(guard);
                        debug!(worker = %self.worker, holder = %owner, key, "lock wait");
                        hook.on_lock_wait(&holder);
                        guard = self.shared.state.lock();
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StorageError::LockWaitTimeout {
                            key: key.to_string(),
                        });
                    }
                    self.shared.released.wait_until(&mut guard, deadline);
                }
            }
        }
    }

    fn release_locks(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let mut guard = self.shared.state.lock();
        for key in self.held.drain(..) {
            guard.locks.remove(&key);
        }
        drop(guard);
        self.shared.released.notify_all();
    }
}

impl StorageSession for MemorySession {
    fn apply(&mut self, group: &EventGroup, hook: &dyn LockWaitHook) -> Result<(), StorageError> {
        if let Some(delay_ms) = self.shared.hooks.apply_delay_ms(&group.id) {
            thread::sleep(Duration::from_millis(delay_ms));
        }
        if let Some((transient, times)) = self.shared.hooks.apply_failure(&group.id) {
            let mut guard = self.shared.state.lock();
            let seen = guard.failures.entry(group.id.clone()).or_insert(0);
            if *seen < times {
                *seen += 1;
                return Err(if transient {
                    StorageError::LockWaitTimeout {
                        key: group.id.clone(),
                    }
                } else {
                    StorageError::Fatal(format!("injected failure applying {}", group.id))
                });
            }
        }
        for record in &group.records {
            self.lock(&record.lock_key(), hook)?;
        }
        self.staged = Some(StagedGroup {
            id: group.id.clone(),
            sequence_number: group.sequence_number(),
            records: group.records.clone(),
        });
        Ok(())
    }

    fn begin_commit(&mut self, progress: &WorkerCheckpoint) -> Result<(), StorageError> {
        let Some(staged) = self.staged.take() else {
            return Err(StorageError::Fatal("commit without applied group".into()));
        };
        if let Some((transient, times)) = self.shared.hooks.commit_failure(&staged.id) {
            let failed = {
                let mut guard = self.shared.state.lock();
                let seen = guard.commit_failures.entry(staged.id.clone()).or_insert(0);
                let failed = *seen < times;
                if failed {
                    *seen += 1;
                }
                failed
            };
            if failed {
                self.release_locks();
                return Err(if transient {
                    StorageError::Deadlock
                } else {
                    StorageError::Fatal(format!("injected failure committing {}", staged.id))
                });
            }
        }
        {
            let mut guard = self.shared.state.lock();
            for record in staged.records {
                let key = record.lock_key();
                guard.rows.insert(key, record.payload);
            }
            guard.commits.push(CommitRecord {
                worker: self.worker,
                group: staged.id,
                sequence_number: staged.sequence_number,
            });
            guard.progress.insert(self.worker.index(), progress.clone());
        }
        self.release_locks();
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        self.staged = None;
        self.release_locks();
        Ok(())
    }
}
