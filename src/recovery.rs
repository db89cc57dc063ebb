//! Restart reconciliation: turns per-worker checkpoints that ran ahead of the
//! coordinator checkpoint into a single skip bitmap over the log.

use crate::bitmap::GroupBitmap;
use crate::checkpoint::{CheckpointRecord, WorkerCheckpoint};
use crate::event::SourcePosition;
use crate::id::WorkerId;
use crate::log_reader::{LogReader, LogReaderError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// What the dispatcher must replay before admitting new work.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecoveryPlan {
    /// Position the reader resumes after; the coordinator checkpoint.
    pub resume_position: Option<SourcePosition>,
    /// Bit `i` set = the `i`-th group after `resume_position` is already applied.
    pub skip: GroupBitmap,
    /// Groups after `resume_position` covered by the plan.
    pub recovery_groups: u64,
    pub lagging_workers: Vec<WorkerId>,
}

impl RecoveryPlan {
    pub fn is_noop(&self) -> bool {
        self.recovery_groups == 0
    }

    pub fn skipped(&self) -> u64 {
        self.skip.count_ones()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("worker {worker} checkpoint base {base:?} is ahead of the coordinator checkpoint {coordinator:?}")]
    BaseAhead {
        worker: WorkerId,
        base: Option<SourcePosition>,
        coordinator: Option<SourcePosition>,
    },
    #[error("log ends after {found} group(s) but worker {worker} committed group {expected} past the checkpoint")]
    LogTruncated {
        worker: WorkerId,
        expected: u64,
        found: u64,
    },
    #[error("worker {worker} last applied {expected} but the log has {found:?} at that offset")]
    PositionMismatch {
        worker: WorkerId,
        expected: SourcePosition,
        found: Option<SourcePosition>,
    },
    #[error("recovery scan: {0}")]
    Log(#[from] LogReaderError),
}

/// Stateless scanner; the same record and log always yield the same plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryScanner;

impl RecoveryScanner {
    /// Builds the recovery plan for `record`, leaving `reader` positioned
    /// right after the coordinator checkpoint.
    pub fn scan(
        reader: &mut dyn LogReader,
        record: &CheckpointRecord,
    ) -> Result<RecoveryPlan, RecoveryError> {
        let coordinator = record.coordinator.position;
        let mut plan = RecoveryPlan {
            resume_position: coordinator,
            ..RecoveryPlan::default()
        };
        let lagging: Vec<&WorkerCheckpoint> = record
            .workers
            .values()
            .filter(|worker| worker.last_position > coordinator && !worker.bitmap.is_empty())
            .collect();
        if lagging.is_empty() {
            reader.seek(coordinator)?;
            return Ok(plan);
        }
        for worker in &lagging {
            if worker.base_position > coordinator {
                return Err(RecoveryError::BaseAhead {
                    worker: worker.worker,
                    base: worker.base_position,
                    coordinator,
                });
            }
        }

        let scan_from = lagging
            .iter()
            .map(|worker| worker.base_position)
            .min()
            .flatten();
        let horizon = lagging.iter().filter_map(|worker| worker.last_position).max();
        reader.seek(scan_from)?;
        let mut positions = Vec::new();
        while let Some(logged) = reader.next_group()? {
            positions.push(logged.position);
            if Some(logged.position) >= horizon {
                break;
            }
        }
        let pending: Vec<SourcePosition> = positions
            .iter()
            .copied()
            .filter(|position| Some(*position) > coordinator)
            .collect();

        for worker in lagging {
            // Groups between the worker base and the coordinator checkpoint are
            // already covered; the remaining bits are renumbered past it.
            let covered = positions
                .iter()
                .filter(|position| {
                    Some(**position) > worker.base_position && Some(**position) <= coordinator
                })
                .count() as u64;
            let mut applied = worker.bitmap.clone();
            applied.shift_down(covered);
            let highest = applied.highest_set();
            if let Some(offset) = highest.filter(|offset| *offset >= pending.len() as u64) {
                return Err(RecoveryError::LogTruncated {
                    worker: worker.worker,
                    expected: offset,
                    found: pending.len() as u64,
                });
            }
            check_last_position(worker, covered, &pending)?;
            plan.skip.union_with(&applied);
            if let Some(highest) = highest {
                plan.recovery_groups = plan.recovery_groups.max(highest + 1);
            }
            debug!(
                worker = %worker.worker,
                covered,
                highest = ?highest,
                "worker checkpoint reconciled"
            );
            plan.lagging_workers.push(worker.worker);
        }
        plan.lagging_workers.sort();
        reader.seek(coordinator)?;
        info!(
            groups = plan.recovery_groups,
            skipped = plan.skipped(),
            workers = plan.lagging_workers.len(),
            "recovery plan built"
        );
        Ok(plan)
    }
}

fn check_last_position(
    worker: &WorkerCheckpoint,
    covered: u64,
    pending: &[SourcePosition],
) -> Result<(), RecoveryError> {
    let (Some(expected), Some(last_index)) = (worker.last_position, worker.last_group_index) else {
        return Ok(());
    };
    let Some(offset) = last_index
        .checked_sub(worker.base_index)
        .and_then(|relative| relative.checked_sub(covered))
    else {
        return Ok(());
    };
    let found = usize::try_from(offset)
        .ok()
        .and_then(|offset| pending.get(offset))
        .copied();
    if found != Some(expected) {
        return Err(RecoveryError::PositionMismatch {
            worker: worker.worker,
            expected,
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointBase, CoordinatorCheckpoint};
    use crate::event::EventGroup;
    use crate::log_reader::{LoggedGroup, MemoryLog};

    fn log(count: u64) -> MemoryLog {
        MemoryLog::from_groups((1..=count).map(|n| {
            LoggedGroup::new(SourcePosition::new(1, n * 100), EventGroup::new(format!("g{n}")))
        }))
        .unwrap()
    }

    #[test]
    fn empty_record_is_a_noop() {
        let mut reader = log(3);
        let plan = RecoveryScanner::scan(&mut reader, &CheckpointRecord::default()).unwrap();
        assert!(plan.is_noop());
        assert_eq!(plan.resume_position, None);
    }

    #[test]
    fn worker_bits_are_shifted_past_the_coordinator() {
        let base = CheckpointBase::default();
        let mut worker = WorkerCheckpoint::new(WorkerId::new(0), base);
        // Groups 0..=4 are g1..g5; the coordinator covers g1 and g2.
        worker.record_commit(base, 1, SourcePosition::new(1, 200));
        worker.record_commit(base, 3, SourcePosition::new(1, 400));
        worker.record_commit(base, 4, SourcePosition::new(1, 500));
        let mut record = CheckpointRecord {
            coordinator: CoordinatorCheckpoint {
                position: Some(SourcePosition::new(1, 200)),
                lwm_sequence: None,
                group_index: 2,
                checkpoint_seqno: 1,
            },
            ..CheckpointRecord::default()
        };
        record.workers.insert(0, worker);

        let mut reader = log(6);
        let plan = RecoveryScanner::scan(&mut reader, &record).unwrap();
        assert_eq!(plan.skip, GroupBitmap::from_bits([1, 2]));
        assert_eq!(plan.recovery_groups, 3);
        assert_eq!(plan.lagging_workers, vec![WorkerId::new(0)]);
        assert_eq!(reader.next_group().unwrap().unwrap().group.id, "g3");
    }
}
