use crate::checkpoint::{CheckpointBase, WorkerCheckpoint};
use crate::dispatcher::PoolShared;
use crate::error::ApplierError;
use crate::event::SourcePosition;
use crate::id::WorkerId;
use crate::job_queue::{Job, JobQueue};
use crate::sequencer::{CommitSequencer, TicketId, TurnOutcome};
use crate::storage::{LockHolder, LockWaitHook, NoLockWaitHook, StorageSession};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle of one worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRunState {
    Starting,
    Running,
    StopAccepted,
    Error,
}

impl WorkerRunState {
    pub fn has_exited(self) -> bool {
        matches!(self, WorkerRunState::StopAccepted | WorkerRunState::Error)
    }
}

impl fmt::Display for WorkerRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkerRunState::Starting => "starting",
            WorkerRunState::Running => "running",
            WorkerRunState::StopAccepted => "stop_accepted",
            WorkerRunState::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
struct WorkerProgress {
    run_state: WorkerRunState,
    checkpoint: WorkerCheckpoint,
    current_group: Option<String>,
}

/// Worker state visible to the dispatcher and the status query.
#[derive(Debug)]
pub struct WorkerShared {
    id: WorkerId,
    queue: Arc<JobQueue>,
    progress: Mutex<WorkerProgress>,
    state_changed: Condvar,
    executed: AtomicU64,
    retries: AtomicU64,
}

impl WorkerShared {
    /// `checkpoint` is the record the worker resumes from; its bits are kept
    /// until a later base covers them.
    pub fn new(queue: Arc<JobQueue>, checkpoint: WorkerCheckpoint) -> Self {
        let id = queue.worker();
        Self {
            id,
            queue,
            progress: Mutex::new(WorkerProgress {
                run_state: WorkerRunState::Starting,
                checkpoint,
                current_group: None,
            }),
            state_changed: Condvar::new(),
            executed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn run_state(&self) -> WorkerRunState {
        self.progress.lock().run_state
    }

    fn set_run_state(&self, state: WorkerRunState) {
        self.progress.lock().run_state = state;
        self.state_changed.notify_all();
    }

    /// Blocks until the worker leaves `Starting`; false on timeout.
    pub fn wait_started(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.progress.lock();
        while guard.run_state == WorkerRunState::Starting {
            if self.state_changed.wait_until(&mut guard, deadline).timed_out() {
                return guard.run_state != WorkerRunState::Starting;
            }
        }
        true
    }

    /// Blocks until the worker accepted the stop or failed; false on timeout.
    pub fn wait_exited(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.progress.lock();
        while !guard.run_state.has_exited() {
            if self.state_changed.wait_until(&mut guard, deadline).timed_out() {
                return guard.run_state.has_exited();
            }
        }
        true
    }

    pub fn checkpoint(&self) -> WorkerCheckpoint {
        self.progress.lock().checkpoint.clone()
    }

    pub fn last_position(&self) -> Option<SourcePosition> {
        self.progress.lock().checkpoint.last_position
    }

    pub fn current_group(&self) -> Option<String> {
        self.progress.lock().current_group.clone()
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Rebases the worker checkpoint and persists it while holding the
    /// progress lock, so it cannot overwrite a newer commit record.
    pub(crate) fn persist_rebased(
        &self,
        base: CheckpointBase,
        pool: &PoolShared,
    ) -> Result<(), ApplierError> {
        let mut guard = self.progress.lock();
        guard.checkpoint.rebase(base);
        pool.store.persist_worker(&guard.checkpoint)?;
        Ok(())
    }
}

struct SequencerHook<'a> {
    sequencer: &'a CommitSequencer,
    ticket: TicketId,
}

impl LockWaitHook for SequencerHook<'_> {
    fn on_lock_wait(&self, holder: &LockHolder) {
        if let Err(err) = self.sequencer.report_deadlock(self.ticket, holder) {
            warn!(ticket = %self.ticket, error = %err, "deadlock check failed");
        }
    }
}

struct Worker {
    pool: Arc<PoolShared>,
    shared: Arc<WorkerShared>,
    session: Box<dyn StorageSession>,
    /// Side state owned while this worker holds the partition, keyed by partition.
    session_objects: BTreeMap<String, Vec<String>>,
}

/// Thread body: drain the queue until stop, close or failure.
pub(crate) fn run(pool: Arc<PoolShared>, shared: Arc<WorkerShared>) {
    let session = pool.storage.session(shared.id);
    let mut worker = Worker {
        pool,
        shared,
        session,
        session_objects: BTreeMap::new(),
    };
    worker.shared.set_run_state(WorkerRunState::Running);
    let id = worker.shared.id;
    info!(worker = %id, "worker started");
    while let Some(job) = worker.shared.queue.pop(&worker.pool.signal) {
        worker.shared.progress.lock().current_group = Some(job.group.id.clone());
        let outcome = worker.execute(&job).and_then(|()| worker.complete(&job));
        worker.shared.progress.lock().current_group = None;
        match outcome {
            Ok(()) => {}
            // After another worker's failure every wait reports that error; it is not ours.
            Err(err) if err.is_cancelled() || worker.pool.signal.killed() => {
                worker.release_ticket(&job, false);
                worker.shared.queue.finish_job();
                debug!(worker = %id, group = %job.group.id, "group abandoned on stop");
                break;
            }
            Err(err) => {
                worker.release_ticket(&job, true);
                error!(worker = %id, group = %job.group.id, error = %err, "worker failed");
                worker.pool.signal.fail(Some(id), err);
                worker.shared.set_run_state(WorkerRunState::Error);
                worker.pool.wake_all();
                return;
            }
        }
    }
    worker.shared.set_run_state(WorkerRunState::StopAccepted);
    info!(worker = %id, executed = worker.shared.executed(), "worker stopped");
}

impl Worker {
    fn sequencer_ticket(&self, job: &Job) -> Option<(&CommitSequencer, TicketId)> {
        let sequencer = self.pool.sequencer.as_ref()?;
        Some((sequencer, job.ticket?))
    }

    fn execute(&mut self, job: &Job) -> Result<(), ApplierError> {
        let pool = self.pool.clone();
        let worker = self.shared.id;
        let ticketed = pool
            .sequencer
            .as_ref()
            .and_then(|sequencer| job.ticket.map(|ticket| (sequencer, ticket)));
        if let Some((sequencer, ticket)) = ticketed {
            sequencer.begin(ticket)?;
        }
        for (key, objects) in &job.handoff {
            self.session_objects
                .entry(key.clone())
                .or_default()
                .extend(objects.iter().cloned());
        }
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let applied = match ticketed {
                Some((sequencer, ticket)) => self
                    .session
                    .apply(&job.group, &SequencerHook { sequencer, ticket }),
                None => self.session.apply(&job.group, &NoLockWaitHook),
            };
            if let Err(error) = applied {
                self.rollback();
                if error.is_transient() && attempt <= pool.config.max_retries {
                    self.shared.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(worker = %worker, group = %job.group.id, attempt, error = %error, "transient apply failure; retrying");
                    self.backoff(attempt)?;
                    continue;
                }
                return Err(ApplierError::Execution {
                    worker,
                    group_index: job.group_index,
                    attempts: attempt,
                    error,
                });
            }
            if let Some((sequencer, ticket)) = ticketed {
                sequencer.finish_applying(ticket)?;
                match sequencer.wait_for_turn(ticket, &pool.signal)? {
                    TurnOutcome::Proceed => {}
                    TurnOutcome::Rollback => {
                        self.rollback();
                        if attempt > pool.config.max_retries {
                            return Err(ApplierError::Deadlock {
                                worker,
                                group_index: job.group_index,
                                attempts: attempt,
                            });
                        }
                        self.shared.retries.fetch_add(1, Ordering::Relaxed);
                        debug!(worker = %worker, group = %job.group.id, attempt, "rolled back for commit order; retrying");
                        self.backoff(attempt)?;
                        continue;
                    }
                    TurnOutcome::Abort => {
                        self.rollback();
                        return Err(ApplierError::Cancelled);
                    }
                }
            }
            let mut progress = self.shared.checkpoint();
            progress.record_commit(job.checkpoint_base, job.group_index, job.position);
            if let Err(error) = self.session.begin_commit(&progress) {
                self.rollback();
                if error.is_transient() && attempt <= pool.config.max_retries {
                    if let Some((sequencer, ticket)) = ticketed {
                        sequencer.retry(ticket)?;
                    }
                    self.shared.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(worker = %worker, group = %job.group.id, attempt, error = %error, "transient commit failure; retrying");
                    self.backoff(attempt)?;
                    continue;
                }
                return Err(ApplierError::Execution {
                    worker,
                    group_index: job.group_index,
                    attempts: attempt,
                    error,
                });
            }
            if let Some((sequencer, ticket)) = ticketed {
                sequencer.finish(ticket)?;
            }
            debug!(
                worker = %worker,
                group = %job.group.id,
                seqno = ?job.group.sequence_number(),
                parent = ?job.group.commit_parent(),
                "group committed"
            );
            return Ok(());
        }
    }

    /// Post-commit bookkeeping: partitions, worker checkpoint, GAQ slot.
    fn complete(&mut self, job: &Job) -> Result<(), ApplierError> {
        let id = self.shared.id;
        for (key, objects) in &job.group.temporaries {
            self.session_objects
                .entry(key.clone())
                .or_default()
                .extend(objects.iter().cloned());
        }
        for key in &job.partitions {
            self.pool
                .partitions
                .release(key, id, &mut self.session_objects);
        }
        {
            let mut guard = self.shared.progress.lock();
            guard
                .checkpoint
                .record_commit(job.checkpoint_base, job.group_index, job.position);
            self.pool.store.persist_worker(&guard.checkpoint)?;
        }
        self.pool.gaq.mark_done(job.slot);
        self.shared.queue.finish_job();
        self.shared.executed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(&mut self) {
        if let Err(err) = self.session.rollback() {
            warn!(worker = %self.shared.id, error = %err, "rollback failed");
        }
    }

    /// Sleeps before retry `attempt`, waking early on stop.
    fn backoff(&self, attempt: u32) -> Result<(), ApplierError> {
        let deadline = Instant::now() + self.pool.config.retry_backoff(attempt);
        let step = self.pool.config.poll_interval();
        loop {
            self.pool.signal.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(step.min(deadline - now));
        }
    }

    fn release_ticket(&self, job: &Job, fatal: bool) {
        let Some((sequencer, ticket)) = self.sequencer_ticket(job) else {
            return;
        };
        let released = if fatal {
            sequencer.report_rollback(ticket)
        } else {
            match sequencer.state_of(ticket) {
                Some(_) => sequencer.abandon(ticket),
                None => Ok(()),
            }
        };
        if let Err(err) = released {
            debug!(worker = %self.shared.id, ticket = %ticket, error = %err, "ticket release skipped");
        }
    }
}
