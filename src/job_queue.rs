use crate::checkpoint::CheckpointBase;
use crate::config::ApplierConfig;
use crate::error::ApplierError;
use crate::event::{EventGroup, SourcePosition};
use crate::id::WorkerId;
use crate::ring::RingBuffer;
use crate::sequencer::TicketId;
use crate::signal::PoolSignal;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Unit of work handed from the dispatcher to exactly one worker.
#[derive(Debug, Clone)]
pub struct Job {
    pub group: Arc<EventGroup>,
    /// GAQ slot the worker marks done after commit.
    pub slot: usize,
    /// Absolute index of the group since the log began.
    pub group_index: u64,
    pub position: SourcePosition,
    /// Checkpoint base in force when the group was dispatched.
    pub checkpoint_base: CheckpointBase,
    /// Partition keys the group holds until it commits.
    pub partitions: Vec<String>,
    /// Side state parked in the partition table and handed to this worker.
    pub handoff: Vec<(String, Vec<String>)>,
    pub ticket: Option<TicketId>,
}

/// Occupancy band of a queue after a push or pop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Underrun,
    Normal,
    Overrun,
}

/// Error returned by [`JobQueue::try_push`].
#[derive(Debug)]
pub enum PushError {
    Full(Job),
    Closed(Job),
}

struct QueueState {
    ring: RingBuffer<Job>,
    closed: bool,
}

/// Bounded single-producer single-consumer queue feeding one worker.
///
/// `occupancy` counts queued jobs plus the one being executed; the consumer
/// decrements it through [`JobQueue::finish_job`] once the job is committed.
pub struct JobQueue {
    worker: WorkerId,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    occupancy: AtomicUsize,
    overrun_threshold: usize,
    underrun_threshold: usize,
    overruns: AtomicU64,
    underruns: AtomicU64,
    poll: Duration,
}

impl JobQueue {
    pub fn new(
        worker: WorkerId,
        capacity: usize,
        overrun_threshold: usize,
        underrun_threshold: usize,
        poll: Duration,
    ) -> Self {
        Self {
            worker,
            state: Mutex::new(QueueState {
                ring: RingBuffer::with_capacity(capacity.max(1)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            occupancy: AtomicUsize::new(0),
            overrun_threshold,
            underrun_threshold,
            overruns: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            poll,
        }
    }

    pub fn from_config(worker: WorkerId, config: &ApplierConfig) -> Self {
        Self::new(
            worker,
            config.queue_capacity,
            config.overrun_threshold(),
            config.underrun_threshold(),
            config.poll_interval(),
        )
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().ring.capacity()
    }

    /// Jobs waiting in the ring, excluding the one being executed.
    pub fn depth(&self) -> usize {
        self.state.lock().ring.len()
    }

    /// Queued plus executing jobs; readable without the queue lock.
    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::Acquire)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn classify(&self, occupancy: usize) -> Occupancy {
        if occupancy >= self.overrun_threshold {
            Occupancy::Overrun
        } else if occupancy <= self.underrun_threshold {
            Occupancy::Underrun
        } else {
            Occupancy::Normal
        }
    }

    /// How far occupancy sits above the overrun threshold (0 when not in overrun).
    pub fn overrun_excess(&self) -> usize {
        let occupancy = self.occupancy();
        if occupancy < self.overrun_threshold {
            return 0;
        }
        occupancy - self.overrun_threshold + 1
    }

    pub fn try_push(&self, job: Job) -> Result<Occupancy, PushError> {
        let mut guard = self.state.lock();
        if guard.closed {
            return Err(PushError::Closed(job));
        }
        match guard.ring.push_back(job) {
            Ok(_) => {
                drop(guard);
                Ok(self.after_push())
            }
            Err(job) => Err(PushError::Full(job)),
        }
    }

    /// Blocks while the queue is full. Fails on stop, fatal error or close.
    pub fn push(&self, mut job: Job, signal: &PoolSignal) -> Result<Occupancy, ApplierError> {
        let mut guard = self.state.lock();
        loop {
            signal.check()?;
            if guard.closed {
                return Err(ApplierError::Cancelled);
            }
            match guard.ring.push_back(job) {
                Ok(_) => {
                    drop(guard);
                    return Ok(self.after_push());
                }
                Err(returned) => job = returned,
            }
            self.not_full.wait_for(&mut guard, self.poll);
        }
    }

    fn after_push(&self) -> Occupancy {
        let occupancy = self.occupancy.fetch_add(1, Ordering::AcqRel) + 1;
        self.not_empty.notify_one();
        let band = self.classify(occupancy);
        if band == Occupancy::Overrun {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
        band
    }

    /// Next job in FIFO order; `None` once stop was requested or the queue closed.
    pub fn pop(&self, signal: &PoolSignal) -> Option<Job> {
        let mut guard = self.state.lock();
        loop {
            if signal.stop_requested() {
                return None;
            }
            if let Some(job) = guard.ring.pop_front() {
                drop(guard);
                self.not_full.notify_one();
                if self.classify(self.occupancy()) == Occupancy::Underrun {
                    self.underruns.fetch_add(1, Ordering::Relaxed);
                }
                return Some(job);
            }
            if guard.closed {
                return None;
            }
            self.not_empty.wait_for(&mut guard, self.poll);
        }
    }

    /// Called by the consumer once the popped job is finished.
    pub fn finish_job(&self) {
        let _ = self
            .occupancy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                value.checked_sub(1)
            });
    }

    /// Closes the queue and returns the jobs that were never started.
    pub fn close(&self) -> Vec<Job> {
        let mut guard = self.state.lock();
        guard.closed = true;
        let dropped = guard.ring.drain();
        drop(guard);
        let _ = self
            .occupancy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                Some(value.saturating_sub(dropped.len()))
            });
        self.notify_all();
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wakes both sides so they re-check the stop signal.
    pub fn notify_all(&self) {
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("worker", &self.worker)
            .field("occupancy", &self.occupancy())
            .finish()
    }
}
