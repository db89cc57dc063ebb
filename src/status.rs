use crate::checkpoint::CoordinatorCheckpoint;
use crate::config::SchedulingPolicyKind;
use crate::dispatcher::{DispatcherState, PoolShared};
use crate::error::ErrorClass;
use crate::event::SourcePosition;
use crate::id::{ChannelId, WorkerId};
use crate::worker::WorkerRunState;
use serde::Serialize;
use std::sync::atomic::Ordering;

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub worker: WorkerId,
    pub state: WorkerRunState,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub occupancy: usize,
    pub executed: u64,
    pub retries: u64,
    pub overruns: u64,
    pub underruns: u64,
    pub last_position: Option<SourcePosition>,
    pub current_group: Option<String>,
    pub error: Option<String>,
}

/// Point-in-time view of the pool, serializable for the status command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub channel: ChannelId,
    pub policy: SchedulingPolicyKind,
    pub state: DispatcherState,
    pub checkpoint: CoordinatorCheckpoint,
    pub lwm_sequence: Option<u64>,
    pub gaq_len: usize,
    pub gaq_capacity: usize,
    pub in_flight: usize,
    pub partitions: usize,
    pub dispatched: u64,
    pub skipped: u64,
    pub barriers: u64,
    pub dependency_waits: u64,
    pub overrun_naps: u64,
    pub checkpoints: u64,
    pub sequencer_rollbacks: u64,
    pub workers: Vec<WorkerStatus>,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
}

impl PoolStatus {
    pub(crate) fn collect(shared: &PoolShared) -> Self {
        let errors = shared.signal.errors();
        let worker_errors = errors.worker_errors();
        let workers = shared
            .workers
            .iter()
            .map(|worker| {
                let queue = worker.queue();
                WorkerStatus {
                    worker: worker.id(),
                    state: worker.run_state(),
                    queue_depth: queue.depth(),
                    queue_capacity: queue.capacity(),
                    occupancy: queue.occupancy(),
                    executed: worker.executed(),
                    retries: worker.retries(),
                    overruns: queue.overruns(),
                    underruns: queue.underruns(),
                    last_position: worker.last_position(),
                    current_group: worker.current_group(),
                    error: worker_errors.get(&worker.id()).map(ToString::to_string),
                }
            })
            .collect();
        let first = errors.first();
        let counters = &shared.counters;
        Self {
            channel: ChannelId::new(shared.config.channel.clone()),
            policy: shared.policy,
            state: shared.dispatcher_state(),
            checkpoint: *shared.published.read(),
            lwm_sequence: shared.gaq.lwm_estimate(),
            gaq_len: shared.gaq.len(),
            gaq_capacity: shared.gaq.capacity(),
            in_flight: shared.gaq.in_flight(),
            partitions: shared.partitions.len(),
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            barriers: counters.barriers.load(Ordering::Relaxed),
            dependency_waits: counters.waits.load(Ordering::Relaxed),
            overrun_naps: counters.overrun_naps.load(Ordering::Relaxed),
            checkpoints: counters.checkpoints.load(Ordering::Relaxed),
            sequencer_rollbacks: shared
                .sequencer
                .as_ref()
                .map_or(0, |sequencer| sequencer.rollbacks()),
            workers,
            error: first.as_ref().map(ToString::to_string),
            error_class: first.as_ref().map(|error| error.class()),
        }
    }

    pub fn executed(&self) -> u64 {
        self.workers.iter().map(|worker| worker.executed).sum()
    }

    /// Renders the counters as Prometheus exposition text.
    pub fn render_metrics(&self) -> String {
        let mut out = format!(
            "applier_dispatched_total {}\napplier_skipped_total {}\napplier_barriers_total {}\napplier_dependency_waits_total {}\napplier_overrun_naps_total {}\napplier_checkpoints_total {}\napplier_sequencer_rollbacks_total {}\napplier_gaq_depth {}\napplier_gaq_capacity {}\napplier_checkpoint_group_index {}\n",
            self.dispatched,
            self.skipped,
            self.barriers,
            self.dependency_waits,
            self.overrun_naps,
            self.checkpoints,
            self.sequencer_rollbacks,
            self.gaq_len,
            self.gaq_capacity,
            self.checkpoint.group_index,
        );
        for worker in &self.workers {
            let label = worker.worker.index();
            out.push_str(&format!(
                "applier_worker_queue_depth{{worker=\"{label}\"}} {}\napplier_worker_executed_total{{worker=\"{label}\"}} {}\napplier_worker_retries_total{{worker=\"{label}\"}} {}\napplier_queue_overrun_total{{worker=\"{label}\"}} {}\napplier_queue_underrun_total{{worker=\"{label}\"}} {}\n",
                worker.queue_depth,
                worker.executed,
                worker.retries,
                worker.overruns,
                worker.underruns,
            ));
        }
        out
    }
}
