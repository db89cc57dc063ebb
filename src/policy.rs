//! Scheduling policies: which worker runs a group and whether the dispatcher
//! must drain the pool first.

mod logical_clock;
mod partition_affinity;

pub use logical_clock::{ClockDecision, LogicalClockPolicy};
pub use partition_affinity::PartitionAffinityPolicy;

use crate::config::{ApplierConfig, SchedulingPolicyKind};
use crate::error::ApplierError;
use crate::event::EventGroup;
use crate::gaq::GroupAssignmentQueue;
use crate::id::WorkerId;
use crate::job_queue::JobQueue;
use crate::partition::PartitionTable;
use crate::signal::WakeHook;
use std::sync::Arc;

/// Shared pool state a policy may consult while choosing a worker.
pub struct SchedulingContext<'a> {
    pub queues: &'a [Arc<JobQueue>],
    pub gaq: &'a GroupAssignmentQueue,
    pub partitions: &'a PartitionTable,
    /// Runs on every wake-up while a policy blocks.
    pub wake: &'a dyn WakeHook,
}

/// Placement decided for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub worker: WorkerId,
    /// Partition keys acquired on behalf of the group.
    pub partitions: Vec<String>,
    /// Side state handed to the worker with the job.
    pub handoff: Vec<(String, Vec<String>)>,
    /// Whether the dispatcher blocked on a dependency or key conflict.
    pub waited: bool,
}

impl Assignment {
    pub fn to(worker: WorkerId) -> Self {
        Self {
            worker,
            partitions: Vec::new(),
            handoff: Vec::new(),
            waited: false,
        }
    }
}

/// Strategy selected once at startup. Calls arrive in dispatch order:
/// `needs_barrier`, then `select_worker`, then `before_enqueue`.
pub trait SchedulingPolicy: Send {
    fn kind(&self) -> SchedulingPolicyKind;

    /// Validates the group and reports whether every in-flight group must
    /// finish before it is assigned.
    fn needs_barrier(&mut self, group: &EventGroup) -> Result<bool, ApplierError>;

    fn select_worker(
        &mut self,
        group: &EventGroup,
        ctx: &SchedulingContext<'_>,
    ) -> Result<Assignment, ApplierError>;

    /// Last chance to block before the job becomes visible to the worker.
    fn before_enqueue(
        &mut self,
        _group: &EventGroup,
        _assignment: &mut Assignment,
        _ctx: &SchedulingContext<'_>,
    ) -> Result<(), ApplierError> {
        Ok(())
    }

    /// Forgets history so the next group is treated as the first one.
    fn reset(&mut self);
}

/// Builds the policy named in the configuration.
pub fn build(config: &ApplierConfig) -> Box<dyn SchedulingPolicy> {
    match config.scheduling_policy {
        SchedulingPolicyKind::PartitionAffinity => Box::new(PartitionAffinityPolicy::new(
            config.max_partitions_per_group,
        )),
        SchedulingPolicyKind::LogicalClock => Box::new(LogicalClockPolicy::new()),
    }
}

/// Worker with the lowest occupancy, scanning from `start`; the first one
/// found wins ties.
pub fn least_occupied(queues: &[Arc<JobQueue>], start: usize) -> Option<WorkerId> {
    let count = queues.len();
    (0..count)
        .map(|step| &queues[(start + step) % count])
        .min_by_key(|queue| queue.occupancy())
        .map(|queue| queue.worker())
}
