use super::{least_occupied, Assignment, SchedulingContext, SchedulingPolicy};
use crate::config::SchedulingPolicyKind;
use crate::error::{ApplierError, ProtocolError};
use crate::event::EventGroup;
use crate::id::WorkerId;
use tracing::debug;

/// How the last group was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockDecision {
    /// The group opened a new scheduling group and needed a full barrier.
    pub new_scheduling_group: bool,
    /// Its sequence number did not follow the previous one by exactly one.
    pub gap_successor: bool,
    /// It depends on the immediately preceding group and stays on its worker.
    pub session_affinity: bool,
}

/// Dependency-driven scheduling from `(sequence_number, commit_parent)`.
#[derive(Debug, Default)]
pub struct LogicalClockPolicy {
    started: bool,
    last_sequence: Option<u64>,
    last_worker: Option<WorkerId>,
    cursor: usize,
    decision: ClockDecision,
}

impl LogicalClockPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_decision(&self) -> ClockDecision {
        self.decision
    }

    fn validate(&self, group: &EventGroup) -> Result<(), ProtocolError> {
        let sequence = group.sequence_number();
        if let (Some(sequence), Some(parent)) = (sequence, group.commit_parent()) {
            if sequence <= parent {
                return Err(ProtocolError::SequenceNotAfterParent {
                    group_id: group.id.clone(),
                    sequence_number: sequence,
                    commit_parent: parent,
                });
            }
        }
        if let (Some(sequence), Some(previous)) = (sequence, self.last_sequence) {
            if sequence <= previous {
                return Err(ProtocolError::SequenceRegressed {
                    group_id: group.id.clone(),
                    sequence_number: sequence,
                    previous,
                });
            }
        }
        Ok(())
    }
}

impl SchedulingPolicy for LogicalClockPolicy {
    fn kind(&self) -> SchedulingPolicyKind {
        SchedulingPolicyKind::LogicalClock
    }

    fn needs_barrier(&mut self, group: &EventGroup) -> Result<bool, ApplierError> {
        self.validate(group)?;
        let sequence = group.sequence_number();
        let parent = group.commit_parent();
        let gap_successor = match (sequence, self.last_sequence) {
            (Some(sequence), Some(previous)) => sequence != previous + 1,
            // The predecessor carried no clock, so nothing bounds this one.
            (Some(_), None) => self.started,
            _ => false,
        };
        let new_scheduling_group =
            !self.started || parent.is_none() || sequence.is_none() || gap_successor;
        let session_affinity = !new_scheduling_group
            && matches!((parent, self.last_sequence), (Some(parent), Some(previous)) if parent >= previous);
        self.decision = ClockDecision {
            new_scheduling_group,
            gap_successor,
            session_affinity,
        };
        if gap_successor {
            debug!(
                group = %group.id,
                seqno = ?sequence,
                previous = ?self.last_sequence,
                "gap successor; draining the pool"
            );
        }
        self.started = true;
        self.last_sequence = sequence;
        Ok(new_scheduling_group)
    }

    fn select_worker(
        &mut self,
        _group: &EventGroup,
        ctx: &SchedulingContext<'_>,
    ) -> Result<Assignment, ApplierError> {
        let affine = self.last_worker.filter(|_| self.decision.session_affinity);
        let worker = match affine {
            Some(worker) => worker,
            None => {
                let worker = least_occupied(ctx.queues, self.cursor).ok_or_else(|| {
                    ApplierError::Resource("worker pool is empty".into())
                })?;
                self.cursor = worker.index() + 1;
                worker
            }
        };
        self.last_worker = Some(worker);
        Ok(Assignment::to(worker))
    }

    fn before_enqueue(
        &mut self,
        group: &EventGroup,
        assignment: &mut Assignment,
        ctx: &SchedulingContext<'_>,
    ) -> Result<(), ApplierError> {
        if self.decision.new_scheduling_group {
            return Ok(());
        }
        let Some(parent) = group.commit_parent() else {
            return Ok(());
        };
        let waited = ctx
            .gaq
            .wait_for_dependency(parent, assignment.worker, ctx.wake)?;
        if waited {
            debug!(group = %group.id, parent, worker = %assignment.worker, "waited for commit parent");
        }
        assignment.waited |= waited;
        Ok(())
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}
