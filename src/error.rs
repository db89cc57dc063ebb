use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::event::SourcePosition;
use crate::id::WorkerId;
use crate::log_reader::LogReaderError;
use crate::recovery::RecoveryError;
use crate::sequencer::SequencerError;
use crate::storage::StorageError;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Malformed input from the upstream stream. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("group {group_id}: sequence_number {sequence_number} is not after commit_parent {commit_parent}")]
    SequenceNotAfterParent {
        group_id: String,
        sequence_number: u64,
        commit_parent: u64,
    },
    #[error("group {group_id}: sequence_number {sequence_number} does not advance past {previous}")]
    SequenceRegressed {
        group_id: String,
        sequence_number: u64,
        previous: u64,
    },
    #[error("group {group_id} references an empty partition name")]
    UndefinedPartition { group_id: String },
    #[error("group {group_id} ends at {position} which is not after {previous}")]
    PositionRegressed {
        group_id: String,
        position: SourcePosition,
        previous: SourcePosition,
    },
}

/// Error class used to decide retry and stop behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Protocol,
    Execution,
    Deadlock,
    Resource,
    Configuration,
    Checkpoint,
    Cancelled,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Protocol => "protocol",
            ErrorClass::Execution => "execution",
            ErrorClass::Deadlock => "deadlock",
            ErrorClass::Resource => "resource",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Checkpoint => "checkpoint",
            ErrorClass::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Crate-level error surfaced by the dispatcher, workers and service handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplierError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("worker {worker} failed group {group_index} after {attempts} attempt(s): {error}")]
    Execution {
        worker: WorkerId,
        group_index: u64,
        attempts: u32,
        error: StorageError,
    },
    #[error("worker {worker} rolled back group {group_index} {attempts} times on commit-order deadlocks")]
    Deadlock {
        worker: WorkerId,
        group_index: u64,
        attempts: u32,
    },
    #[error("resource exhausted: {0}")]
    Resource(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("worker {worker} is unavailable (state {state})")]
    WorkerUnavailable { worker: WorkerId, state: String },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error(transparent)]
    Log(#[from] LogReaderError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error("replication stopped")]
    Cancelled,
}

impl ApplierError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ApplierError::Protocol(_) | ApplierError::Log(_) | ApplierError::Recovery(_) => {
                ErrorClass::Protocol
            }
            ApplierError::Execution { .. } => ErrorClass::Execution,
            ApplierError::Deadlock { .. } => ErrorClass::Deadlock,
            ApplierError::Resource(_) | ApplierError::Sequencer(_) => ErrorClass::Resource,
            ApplierError::Config(_) | ApplierError::WorkerUnavailable { .. } => {
                ErrorClass::Configuration
            }
            ApplierError::Checkpoint(_) => ErrorClass::Checkpoint,
            ApplierError::Cancelled => ErrorClass::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApplierError::Cancelled)
    }
}

#[derive(Debug, Default)]
struct ErrorStateInner {
    first: Option<ApplierError>,
    per_worker: BTreeMap<WorkerId, ApplierError>,
}

/// First-error-wins record shared by the dispatcher and every worker.
#[derive(Debug, Default)]
pub struct ErrorState {
    inner: Mutex<ErrorStateInner>,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error; returns true when it became the pool-wide first error.
    pub fn record(&self, worker: Option<WorkerId>, error: ApplierError) -> bool {
        let mut guard = self.inner.lock();
        if let Some(worker) = worker {
            guard.per_worker.entry(worker).or_insert_with(|| error.clone());
        }
        if guard.first.is_some() {
            return false;
        }
        guard.first = Some(error);
        true
    }

    pub fn first(&self) -> Option<ApplierError> {
        self.inner.lock().first.clone()
    }

    pub fn worker_error(&self, worker: WorkerId) -> Option<ApplierError> {
        self.inner.lock().per_worker.get(&worker).cloned()
    }

    pub fn worker_errors(&self) -> BTreeMap<WorkerId, ApplierError> {
        self.inner.lock().per_worker.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins_but_each_worker_keeps_its_own() {
        let state = ErrorState::new();
        assert!(state.record(
            Some(WorkerId::new(1)),
            ApplierError::Resource("gaq".into())
        ));
        assert!(!state.record(Some(WorkerId::new(0)), ApplierError::Cancelled));
        assert_eq!(state.first(), Some(ApplierError::Resource("gaq".into())));
        assert_eq!(
            state.worker_error(WorkerId::new(0)),
            Some(ApplierError::Cancelled)
        );
        assert_eq!(state.worker_errors().len(), 2);
    }
}
