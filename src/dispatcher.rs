//! The single control thread: pulls groups from the log reader, asks the
//! scheduling policy where they go, feeds the worker queues and checkpoints
//! the GAQ low-water-mark.

use crate::checkpoint::{CheckpointStore, CoordinatorCheckpoint, WorkerCheckpoint};
use crate::config::{ApplierConfig, SchedulingPolicyKind};
use crate::error::{ApplierError, ProtocolError};
use crate::event::{EventGroup, LogicalClock, SourcePosition};
use crate::gaq::{AssignedSlot, GroupAssignmentQueue};
use crate::id::{ChannelId, WorkerId};
use crate::job_queue::{Job, JobQueue, Occupancy};
use crate::log_reader::{LogReader, LoggedGroup, ReadPoll};
use crate::partition::{PartitionSnapshot, PartitionTable};
use crate::policy::{self, SchedulingContext, SchedulingPolicy};
use crate::recovery::RecoveryPlan;
use crate::sequencer::CommitSequencer;
use crate::signal::{PoolSignal, WakeHook};
use crate::status::PoolStatus;
use crate::storage::StorageEngine;
use crate::worker::{self, WorkerShared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on a single overrun nap.
const MAX_OVERRUN_NAP: Duration = Duration::from_millis(10);
/// Rounds a forced checkpoint waits for the head of the GAQ to complete.
const FORCED_CHECKPOINT_ROUNDS: u32 = 200;
/// Time to wait for a worker to come up before it counts as unavailable.
const WORKER_START_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval between "still waiting" warnings while a worker finishes its job.
const WORKER_STOP_WARN_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherState {
    Starting,
    Running,
    Draining,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DispatcherState::Starting => "starting",
            DispatcherState::Running => "running",
            DispatcherState::Draining => "draining",
            DispatcherState::Stopping => "stopping",
            DispatcherState::Stopped => "stopped",
            DispatcherState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// What happened to one group handed to [`Dispatcher::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Assigned {
        worker: WorkerId,
        group_index: u64,
        /// The pool was drained before assignment.
        barrier: bool,
        /// The dispatcher blocked on a dependency or partition conflict.
        waited: bool,
    },
    /// Already applied before the restart; recorded as done without executing.
    Skipped { group_index: u64 },
}

/// Totals for one [`Dispatcher::run`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RunSummary {
    pub dispatched: u64,
    pub skipped: u64,
    /// The reader ran dry, as opposed to a stop request.
    pub end_of_stream: bool,
}

#[derive(Debug, Default)]
pub(crate) struct DispatchCounters {
    pub(crate) dispatched: AtomicU64,
    pub(crate) skipped: AtomicU64,
    pub(crate) barriers: AtomicU64,
    pub(crate) waits: AtomicU64,
    pub(crate) overrun_naps: AtomicU64,
    pub(crate) checkpoints: AtomicU64,
}

/// When the coordinator checkpoint last ran and what it last wrote.
#[derive(Debug)]
struct CheckpointClock {
    last: Instant,
    since: u64,
    seqno: u64,
}

/// State shared by the dispatcher, the workers and status readers.
pub(crate) struct PoolShared {
    pub(crate) config: ApplierConfig,
    pub(crate) policy: SchedulingPolicyKind,
    pub(crate) gaq: GroupAssignmentQueue,
    pub(crate) partitions: PartitionTable,
    pub(crate) sequencer: Option<CommitSequencer>,
    pub(crate) signal: PoolSignal,
    pub(crate) workers: Vec<Arc<WorkerShared>>,
    pub(crate) queues: Vec<Arc<JobQueue>>,
    pub(crate) storage: Arc<dyn StorageEngine>,
    pub(crate) store: Arc<dyn CheckpointStore>,
    pub(crate) published: RwLock<CoordinatorCheckpoint>,
    pub(crate) counters: DispatchCounters,
    pub(crate) state: Mutex<DispatcherState>,
    clock: Mutex<CheckpointClock>,
}

impl PoolShared {
    /// Wakes every blocked wait so it re-checks the stop signal.
    pub(crate) fn wake_all(&self) {
        for queue in &self.queues {
            queue.notify_all();
        }
        self.gaq.notify_all();
        self.partitions.notify_all();
        if let Some(sequencer) = &self.sequencer {
            sequencer.notify_all();
        }
    }

    pub(crate) fn dispatcher_state(&self) -> DispatcherState {
        *self.state.lock()
    }

    fn set_state(&self, state: DispatcherState) {
        *self.state.lock() = state;
    }

    fn count_dispatched(&self) {
        self.clock.lock().since += 1;
    }

    /// Checkpoints once enough groups were dispatched or the period elapsed.
    fn checkpoint_if_due(&self) -> Result<(), ApplierError> {
        let due = {
            let clock = self.clock.lock();
            clock.since >= self.config.checkpoint_group
                || clock.last.elapsed() >= self.config.checkpoint_period()
        };
        if due {
            self.checkpoint(false)?;
        }
        Ok(())
    }

    fn checkpoint(&self, force: bool) -> Result<Option<CoordinatorCheckpoint>, ApplierError> {
        let mut retired = self.gaq.retire_done();
        let mut rounds = 0;
        while force
            && retired.count == 0
            && self.gaq.in_flight() > 0
            && rounds < FORCED_CHECKPOINT_ROUNDS
        {
            self.signal.check_fatal()?;
            if self.signal.stop_requested()
                && self.workers.iter().all(|worker| worker.run_state().has_exited())
            {
                break;
            }
            self.gaq.wait_for_progress(self.config.poll_interval());
            retired = self.gaq.retire_done();
            rounds += 1;
        }
        let checkpoint_seqno = {
            let mut clock = self.clock.lock();
            clock.last = Instant::now();
            clock.since = 0;
            if retired.count == 0 && !force {
                return Ok(None);
            }
            clock.seqno += 1;
            clock.seqno
        };
        let checkpoint = CoordinatorCheckpoint {
            position: retired.lwm.position,
            lwm_sequence: retired.lwm.sequence_number,
            group_index: retired.lwm.group_index,
            checkpoint_seqno,
        };
        self.store.persist_coordinator(&checkpoint)?;
        *self.published.write() = checkpoint;
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        debug!(
            position = ?checkpoint.position,
            lwm = ?checkpoint.lwm_sequence,
            index = checkpoint.group_index,
            retired = retired.count,
            "checkpoint persisted"
        );
        Ok(Some(checkpoint))
    }
}

/// Dispatcher waits keep the periodic checkpoint running while they block.
impl WakeHook for PoolShared {
    fn on_wake(&self) -> Result<(), ApplierError> {
        self.signal.check()?;
        self.checkpoint_if_due()
    }
}

/// Cloneable, non-blocking view of a running pool.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl PoolHandle {
    pub fn status(&self) -> PoolStatus {
        PoolStatus::collect(&self.shared)
    }

    /// Last persisted coordinator checkpoint.
    pub fn checkpoint_position(&self) -> CoordinatorCheckpoint {
        *self.shared.published.read()
    }

    pub fn state(&self) -> DispatcherState {
        self.shared.dispatcher_state()
    }

    /// Asks the dispatcher and the workers to stop at the next wake-up.
    pub fn request_stop(&self) {
        self.shared.signal.request_stop();
        self.shared.wake_all();
    }

    pub fn first_error(&self) -> Option<ApplierError> {
        self.shared.signal.errors().first()
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("state", &self.state())
            .finish()
    }
}

struct RecoveryProgress {
    plan: RecoveryPlan,
    passed: u64,
}

pub struct Dispatcher {
    shared: Arc<PoolShared>,
    policy: Box<dyn SchedulingPolicy>,
    threads: Vec<JoinHandle<()>>,
    recovery: Option<RecoveryProgress>,
    last_position: Option<SourcePosition>,
    finished: bool,
}

impl Dispatcher {
    /// Validates the configuration, loads the last checkpoint and starts the workers.
    pub fn start(
        config: ApplierConfig,
        storage: Arc<dyn StorageEngine>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, ApplierError> {
        config.validate()?;
        let mut record = store.load()?;
        record.adopt_committed(storage.worker_checkpoints());
        let coordinator = record.coordinator;
        let base = coordinator.base();
        let poll = config.poll_interval();

        let queues: Vec<Arc<JobQueue>> = (0..config.worker_count)
            .map(|index| Arc::new(JobQueue::from_config(WorkerId::new(index), &config)))
            .collect();
        let workers = queues
            .iter()
            .map(|queue| {
                let id = queue.worker();
                // Keep pre-restart bits until the recovery pass has covered them.
                let initial = record
                    .workers
                    .get(&id.index())
                    .filter(|stored| stored.worker == id && stored.base_index <= base.index)
                    .cloned()
                    .unwrap_or_else(|| WorkerCheckpoint::new(id, base));
                Arc::new(WorkerShared::new(queue.clone(), initial))
            })
            .collect();
        let sequencer = config.preserve_commit_order.then(|| {
            CommitSequencer::new(
                ChannelId::new(config.channel.clone()),
                config.worker_count,
                poll,
            )
        });
        let shared = Arc::new(PoolShared {
            policy: config.scheduling_policy,
            gaq: GroupAssignmentQueue::new(config.gaq_capacity, base, coordinator.lwm_sequence, poll),
            partitions: PartitionTable::new(config.partition_capacity, poll),
            sequencer,
            signal: PoolSignal::new(),
            workers,
            queues,
            storage,
            store,
            published: RwLock::new(coordinator),
            counters: DispatchCounters::default(),
            state: Mutex::new(DispatcherState::Starting),
            clock: Mutex::new(CheckpointClock {
                last: Instant::now(),
                since: 0,
                seqno: coordinator.checkpoint_seqno,
            }),
            config,
        });
        let mut dispatcher = Self {
            policy: policy::build(&shared.config),
            shared,
            threads: Vec::new(),
            recovery: None,
            last_position: coordinator.position,
            finished: false,
        };
        dispatcher.spawn_workers()?;
        dispatcher.shared.set_state(DispatcherState::Running);
        info!(
            workers = dispatcher.shared.workers.len(),
            policy = %dispatcher.shared.policy,
            position = ?coordinator.position,
            "dispatcher started"
        );
        Ok(dispatcher)
    }

    fn spawn_workers(&mut self) -> Result<(), ApplierError> {
        for worker in self.shared.workers.clone() {
            let pool = self.shared.clone();
            let id = worker.id();
            let spawned = thread::Builder::new()
                .name(format!("applier-{id}"))
                .spawn({
                    let worker = worker.clone();
                    move || worker::run(pool, worker)
                });
            match spawned {
                Ok(handle) => self.threads.push(handle),
                Err(err) => {
                    let error = ApplierError::Resource(format!("failed to spawn worker {id}: {err}"));
                    let _ = self.shutdown_after(error.clone());
                    return Err(error);
                }
            }
        }
        for worker in &self.shared.workers {
            if !worker.wait_started(WORKER_START_TIMEOUT) {
                let error = ApplierError::WorkerUnavailable {
                    worker: worker.id(),
                    state: worker.run_state().to_string(),
                };
                let _ = self.shutdown_after(error.clone());
                return Err(error);
            }
        }
        Ok(())
    }

    /// Replays `plan` before admitting new work: groups whose bit is set are
    /// recorded as done without being executed.
    pub fn with_recovery(mut self, plan: RecoveryPlan) -> Self {
        if plan.is_noop() {
            return self;
        }
        info!(
            groups = plan.recovery_groups,
            skipped = plan.skip.count_ones(),
            position = ?plan.resume_position,
            "recovery replay scheduled"
        );
        self.last_position = plan.resume_position;
        self.recovery = Some(RecoveryProgress { plan, passed: 0 });
        self
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus::collect(&self.shared)
    }

    /// Partition keys currently tracked, with owner and parked side state.
    pub fn partitions(&self) -> Vec<PartitionSnapshot> {
        self.shared.partitions.snapshot()
    }

    pub fn policy(&self) -> &dyn SchedulingPolicy {
        self.policy.as_ref()
    }

    /// Position the reader must resume after.
    pub fn resume_position(&self) -> Option<SourcePosition> {
        match &self.recovery {
            Some(progress) => progress.plan.resume_position,
            None => self.shared.gaq.base().position,
        }
    }

    /// Pulls groups until the reader runs dry, a stop is requested or a
    /// fatal error is observed. Returns the first fatal error.
    pub fn run(&mut self, reader: &mut dyn LogReader) -> Result<RunSummary, ApplierError> {
        let mut summary = RunSummary::default();
        if let Err(err) = reader.seek(self.resume_position()) {
            return Err(self.fail(err.into()));
        }
        loop {
            if self.shared.signal.stop_requested() {
                break;
            }
            let logged = match reader.poll_group(self.shared.config.poll_interval()) {
                Ok(ReadPoll::Ready(logged)) => logged,
                Ok(ReadPoll::Idle) => {
                    if let Err(err) = self.shared.checkpoint_if_due() {
                        return Err(self.fail(err));
                    }
                    continue;
                }
                Ok(ReadPoll::EndOfStream) => {
                    summary.end_of_stream = true;
                    break;
                }
                Err(err) => return Err(self.fail(err.into())),
            };
            match self.dispatch(logged) {
                Ok(DispatchOutcome::Assigned { .. }) => summary.dispatched += 1,
                Ok(DispatchOutcome::Skipped { .. }) => summary.skipped += 1,
                Err(err) if err.is_cancelled() => break,
                Err(err) => return Err(self.fail(err)),
            }
        }
        self.shared.signal.check_fatal()?;
        Ok(summary)
    }

    /// Assigns one group to a worker, blocking on barriers, GAQ space,
    /// dependencies and queue space as needed.
    pub fn dispatch(&mut self, logged: LoggedGroup) -> Result<DispatchOutcome, ApplierError> {
        let shared = self.shared.clone();
        shared.signal.check()?;
        let LoggedGroup { position, group } = logged;
        if let Some(previous) = self.last_position.filter(|previous| position <= *previous) {
            return Err(ProtocolError::PositionRegressed {
                group_id: group.id,
                position,
                previous,
            }
            .into());
        }
        self.last_position = Some(position);
        if let Some(outcome) = self.skip_recovered(position, &group)? {
            return Ok(outcome);
        }

        let barrier = self.policy.needs_barrier(&group)?;
        if barrier {
            self.barrier(&group)?;
        }
        let assigned = self.allocate_slot(position, group.clock, false)?;
        let ctx = SchedulingContext {
            queues: &shared.queues,
            gaq: &shared.gaq,
            partitions: &shared.partitions,
            wake: &*shared,
        };
        let mut assignment = self.policy.select_worker(&group, &ctx)?;
        let worker = assignment.worker;
        self.ensure_available(worker)?;
        shared.gaq.set_worker(assigned.slot, worker);
        self.policy.before_enqueue(&group, &mut assignment, &ctx)?;
        if assignment.waited {
            shared.counters.waits.fetch_add(1, Ordering::Relaxed);
        }

        let ticket = shared
            .sequencer
            .as_ref()
            .map(|sequencer| sequencer.register(worker));
        debug!(
            worker = %worker,
            group = %group.id,
            seqno = ?group.sequence_number(),
            parent = ?group.commit_parent(),
            index = assigned.group_index,
            "group assigned"
        );
        let job = Job {
            group: Arc::new(group),
            slot: assigned.slot,
            group_index: assigned.group_index,
            position,
            checkpoint_base: assigned.base,
            partitions: assignment.partitions,
            handoff: assignment.handoff,
            ticket,
        };
        let queue = &shared.queues[worker.index()];
        let occupancy = match queue.push(job, &shared.signal) {
            Ok(occupancy) => occupancy,
            Err(err) => {
                if let (Some(sequencer), Some(ticket)) = (shared.sequencer.as_ref(), ticket) {
                    let _ = sequencer.abandon(ticket);
                }
                return Err(err);
            }
        };
        if occupancy == Occupancy::Overrun {
            self.nap(queue);
        }
        shared.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        shared.count_dispatched();
        self.finish_recovery_if_due()?;
        shared.checkpoint_if_due()?;
        Ok(DispatchOutcome::Assigned {
            worker,
            group_index: assigned.group_index,
            barrier,
            waited: assignment.waited,
        })
    }

    fn skip_recovered(
        &mut self,
        position: SourcePosition,
        group: &EventGroup,
    ) -> Result<Option<DispatchOutcome>, ApplierError> {
        let Some(progress) = self.recovery.as_mut() else {
            return Ok(None);
        };
        if progress.passed >= progress.plan.recovery_groups {
            return Ok(None);
        }
        let offset = progress.passed;
        progress.passed += 1;
        if !progress.plan.skip.is_set(offset) {
            return Ok(None);
        }
        let assigned = self.allocate_slot(position, group.clock, true)?;
        self.shared.counters.skipped.fetch_add(1, Ordering::Relaxed);
        debug!(group = %group.id, index = assigned.group_index, "skipping group applied before restart");
        self.finish_recovery_if_due()?;
        Ok(Some(DispatchOutcome::Skipped {
            group_index: assigned.group_index,
        }))
    }

    /// Once every recovery group has been passed: wait for them to commit,
    /// checkpoint past them and drop the pre-restart worker bitmaps.
    fn finish_recovery_if_due(&mut self) -> Result<(), ApplierError> {
        let due = self
            .recovery
            .as_ref()
            .is_some_and(|progress| progress.passed >= progress.plan.recovery_groups);
        if !due {
            return Ok(());
        }
        self.recovery = None;
        self.shared.gaq.wait_until_idle(&*self.shared)?;
        self.checkpoint(true)?;
        let base = self.shared.gaq.base();
        for worker in &self.shared.workers {
            worker.persist_rebased(base, &self.shared)?;
        }
        info!(position = ?base.position, "recovery replay complete");
        Ok(())
    }

    fn barrier(&mut self, group: &EventGroup) -> Result<(), ApplierError> {
        self.shared.counters.barriers.fetch_add(1, Ordering::Relaxed);
        debug!(group = %group.id, "barrier: draining workers");
        self.shared.gaq.wait_until_idle(&*self.shared)?;
        self.shared.partitions.wait_all_idle(&*self.shared)?;
        let parked = self.shared.partitions.reconcile();
        if parked > 0 {
            debug!(parked, "side state parked across barrier");
        }
        Ok(())
    }

    /// Next GAQ slot; when the window is full, checkpoint to retire finished
    /// groups and wait for workers.
    fn allocate_slot(
        &mut self,
        position: SourcePosition,
        clock: LogicalClock,
        done: bool,
    ) -> Result<AssignedSlot, ApplierError> {
        loop {
            let assigned = if done {
                self.shared.gaq.assign_done(position, clock)
            } else {
                self.shared.gaq.try_assign(position, clock)
            };
            if let Some(assigned) = assigned {
                return Ok(assigned);
            }
            self.checkpoint(false)?;
            self.shared.signal.check()?;
            if self.shared.gaq.is_full() {
                self.shared
                    .gaq
                    .wait_for_progress(self.shared.config.poll_interval());
            }
        }
    }

    fn ensure_available(&self, worker: WorkerId) -> Result<(), ApplierError> {
        self.shared.signal.check()?;
        let Some(shared) = self.shared.workers.get(worker.index()) else {
            return Err(ApplierError::WorkerUnavailable {
                worker,
                state: "missing".into(),
            });
        };
        let state = shared.run_state();
        if state.has_exited() {
            return Err(ApplierError::WorkerUnavailable {
                worker,
                state: state.to_string(),
            });
        }
        Ok(())
    }

    fn nap(&self, queue: &JobQueue) {
        let excess = queue.overrun_excess() as u64;
        if excess == 0 {
            return;
        }
        let nap = Duration::from_micros(self.shared.config.coordinator_nap.saturating_mul(excess))
            .min(MAX_OVERRUN_NAP);
        self.shared.counters.overrun_naps.fetch_add(1, Ordering::Relaxed);
        thread::sleep(nap);
    }

    /// Retires the done prefix of the GAQ and persists the resulting LWM.
    ///
    /// Without `force` nothing is written when no group retired. With `force`
    /// the call waits (boundedly) for the GAQ head to complete first.
    pub fn checkpoint(&mut self, force: bool) -> Result<Option<CoordinatorCheckpoint>, ApplierError> {
        self.shared.checkpoint(force)
    }

    /// Waits for every dispatched group to commit, then stops the pool.
    pub fn drain(&mut self) -> Result<PoolStatus, ApplierError> {
        if !self.finished {
            self.shared.set_state(DispatcherState::Draining);
            match self.shared.gaq.wait_until_idle(&*self.shared) {
                Ok(_) => {
                    if let Err(err) = self.checkpoint(true) {
                        self.fail(err);
                    }
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    self.fail(err);
                }
            }
        }
        self.shutdown()
    }

    /// Stops the pool: workers finish their current job and exit, queued jobs
    /// are dropped and a final checkpoint is written. Idempotent.
    pub fn stop(&mut self) -> Result<PoolStatus, ApplierError> {
        self.shutdown()
    }

    fn shutdown_after(&mut self, error: ApplierError) -> Result<PoolStatus, ApplierError> {
        self.fail(error);
        self.shutdown()
    }

    fn fail(&self, error: ApplierError) -> ApplierError {
        if self.shared.signal.fail(None, error.clone()) {
            error!(error = %error, class = %error.class(), "dispatcher stopping on fatal error");
        }
        self.shared.wake_all();
        self.shared.signal.errors().first().unwrap_or(error)
    }

    fn shutdown(&mut self) -> Result<PoolStatus, ApplierError> {
        if self.finished {
            return self.outcome();
        }
        self.finished = true;
        self.shared.set_state(DispatcherState::Stopping);
        self.shared.signal.request_stop();
        self.shared.wake_all();
        // Workers are spawned in order; only the spawned prefix can exit.
        for worker in self.shared.workers.iter().take(self.threads.len()) {
            while !worker.wait_exited(WORKER_STOP_WARN_INTERVAL) {
                warn!(worker = %worker.id(), "waiting for worker to finish its current group");
            }
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                self.shared
                    .signal
                    .fail(None, ApplierError::Resource("worker thread panicked".into()));
            }
        }
        for queue in &self.shared.queues {
            for job in queue.close() {
                if let (Some(sequencer), Some(ticket)) = (self.shared.sequencer.as_ref(), job.ticket) {
                    let _ = sequencer.abandon(ticket);
                }
            }
        }
        // A failed pool keeps its last good checkpoint; no forced advance.
        let force = !self.shared.signal.killed();
        if let Err(err) = self.checkpoint(force) {
            self.shared.signal.fail(None, err);
        }
        let failed = self.shared.signal.errors().first().is_some();
        self.shared.set_state(if failed {
            DispatcherState::Failed
        } else {
            DispatcherState::Stopped
        });
        info!(
            dispatched = self.shared.counters.dispatched.load(Ordering::Relaxed),
            failed,
            "dispatcher stopped"
        );
        self.outcome()
    }

    fn outcome(&self) -> Result<PoolStatus, ApplierError> {
        match self.shared.signal.errors().first() {
            Some(error) => Err(error),
            None => Ok(self.status()),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.shutdown();
        }
    }
}
