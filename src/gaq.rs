use crate::checkpoint::CheckpointBase;
use crate::error::ApplierError;
use crate::event::{LogicalClock, SourcePosition};
use crate::id::WorkerId;
use crate::ring::RingBuffer;
use crate::signal::WakeHook;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Progress record of one dispatched, not yet checkpointed group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub worker: Option<WorkerId>,
    pub position: SourcePosition,
    pub done: bool,
    pub clock: LogicalClock,
    pub group_index: u64,
    pub checkpoint_seqno: u64,
}

/// Slot handed back by [`GroupAssignmentQueue::try_assign`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignedSlot {
    pub slot: usize,
    pub group_index: u64,
    pub base: CheckpointBase,
}

/// Low-water-mark folded out of the retired prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Lwm {
    pub position: Option<SourcePosition>,
    pub sequence_number: Option<u64>,
    /// Groups retired since the log began; index of the next group.
    pub group_index: u64,
}

/// Outcome of one checkpoint scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retired {
    pub count: usize,
    pub lwm: Lwm,
}

struct GaqState {
    ring: RingBuffer<GroupRecord>,
    next_index: u64,
    retired: Lwm,
    /// Highest sequence number of the contiguous done prefix, retired or not.
    lwm_sequence: Option<u64>,
    /// First group index not yet proven done by the memoized scan.
    memo_index: u64,
    pending: usize,
    checkpoint_seqno: u64,
}

impl GaqState {
    fn slot_of(&self, group_index: u64) -> Option<usize> {
        let offset = group_index.checked_sub(self.retired.group_index)? as usize;
        if offset >= self.ring.len() {
            return None;
        }
        Some((self.ring.head() + offset) % self.ring.capacity())
    }

    /// Advances the memoized done-prefix scan and returns the LWM sequence.
    fn refresh_lwm(&mut self) -> Option<u64> {
        if self.memo_index < self.retired.group_index {
            // Retirement moved the head past the memo; restart from the head.
            self.memo_index = self.retired.group_index;
        }
        let mut lwm = self.lwm_sequence;
        let mut scanned = 0;
        if let Some(slot) = self.slot_of(self.memo_index) {
            for (_, record) in self.ring.iter_from(slot).take_while(|(_, record)| record.done) {
                if let Some(sequence) = record.clock.sequence_number {
                    lwm = Some(lwm.map_or(sequence, |current| current.max(sequence)));
                }
                scanned += 1;
            }
        }
        self.memo_index += scanned;
        self.lwm_sequence = lwm;
        lwm
    }
}

/// Bounded window of in-flight groups, owned by the dispatcher.
///
/// All mutation happens under one mutex. The LWM sequence is mirrored into an
/// atomic so dependency checks can take a relaxed fast path without it; the
/// mirror only ever lags the locked value.
pub struct GroupAssignmentQueue {
    state: Mutex<GaqState>,
    progress: Condvar,
    lwm_estimate: AtomicU64,
    poll: Duration,
}

// 0 encodes "no LWM yet"; a sequence `s` is stored as `s + 1`.
fn encode(sequence: Option<u64>) -> u64 {
    sequence.map_or(0, |value| value.saturating_add(1))
}

fn decode(raw: u64) -> Option<u64> {
    raw.checked_sub(1)
}

impl GroupAssignmentQueue {
    pub fn new(capacity: usize, base: CheckpointBase, lwm_sequence: Option<u64>, poll: Duration) -> Self {
        Self {
            state: Mutex::new(GaqState {
                ring: RingBuffer::with_capacity(capacity.max(1)),
                next_index: base.index,
                retired: Lwm {
                    position: base.position,
                    sequence_number: lwm_sequence,
                    group_index: base.index,
                },
                lwm_sequence,
                memo_index: base.index,
                pending: 0,
                checkpoint_seqno: 0,
            }),
            progress: Condvar::new(),
            lwm_estimate: AtomicU64::new(encode(lwm_sequence)),
            poll,
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.state.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().ring.is_full()
    }

    /// Groups assigned but not yet marked done.
    pub fn in_flight(&self) -> usize {
        self.state.lock().pending
    }

    pub fn base(&self) -> CheckpointBase {
        let guard = self.state.lock();
        CheckpointBase {
            position: guard.retired.position,
            index: guard.retired.group_index,
        }
    }

    /// Relaxed read of the LWM sequence; may lag the locked value.
    pub fn lwm_estimate(&self) -> Option<u64> {
        decode(self.lwm_estimate.load(Ordering::Relaxed))
    }

    pub fn record(&self, slot: usize) -> Option<GroupRecord> {
        self.state.lock().ring.get(slot).cloned()
    }

    /// Allocates the next slot, or returns `None` when the window is full.
    pub fn try_assign(&self, position: SourcePosition, clock: LogicalClock) -> Option<AssignedSlot> {
        self.assign(position, clock, false)
    }

    /// Allocates a slot that is already done; used for groups recovery skips.
    pub fn assign_done(&self, position: SourcePosition, clock: LogicalClock) -> Option<AssignedSlot> {
        let assigned = self.assign(position, clock, true)?;
        let mut guard = self.state.lock();
        let lwm = guard.refresh_lwm();
        self.lwm_estimate.store(encode(lwm), Ordering::Release);
        drop(guard);
        self.progress.notify_all();
        Some(assigned)
    }

    fn assign(&self, position: SourcePosition, clock: LogicalClock, done: bool) -> Option<AssignedSlot> {
        let mut guard = self.state.lock();
        let group_index = guard.next_index;
        let record = GroupRecord {
            worker: None,
            position,
            done,
            clock,
            group_index,
            checkpoint_seqno: guard.checkpoint_seqno,
        };
        let slot = guard.ring.push_back(record).ok()?;
        guard.next_index += 1;
        if !done {
            guard.pending += 1;
        }
        Some(AssignedSlot {
            slot,
            group_index,
            base: CheckpointBase {
                position: guard.retired.position,
                index: guard.retired.group_index,
            },
        })
    }

    pub fn set_worker(&self, slot: usize, worker: WorkerId) {
        if let Some(record) = self.state.lock().ring.get_mut(slot) {
            record.worker = Some(worker);
        }
    }

    /// Marks the group in `slot` committed and wakes every waiter.
    pub fn mark_done(&self, slot: usize) {
        let mut guard = self.state.lock();
        let newly_done = match guard.ring.get_mut(slot) {
            Some(record) if !record.done => {
                record.done = true;
                true
            }
            _ => false,
        };
        if newly_done {
            guard.pending = guard.pending.saturating_sub(1);
            let lwm = guard.refresh_lwm();
            self.lwm_estimate.store(encode(lwm), Ordering::Release);
        }
        drop(guard);
        self.progress.notify_all();
    }

    /// Checkpoint scan: retires the contiguous done prefix at the head and
    /// folds it into the LWM.
    pub fn retire_done(&self) -> Retired {
        let mut guard = self.state.lock();
        let mut count = 0;
        while guard.ring.front().is_some_and(|record| record.done) {
            let Some(record) = guard.ring.pop_front() else {
                break;
            };
            guard.retired.position = Some(record.position);
            if let Some(sequence) = record.clock.sequence_number {
                guard.retired.sequence_number = Some(
                    guard
                        .retired
                        .sequence_number
                        .map_or(sequence, |current| current.max(sequence)),
                );
            }
            guard.retired.group_index += 1;
            count += 1;
        }
        if count > 0 {
            guard.checkpoint_seqno += 1;
            let lwm = guard.refresh_lwm();
            self.lwm_estimate.store(encode(lwm), Ordering::Release);
        }
        let lwm = guard.retired;
        drop(guard);
        if count > 0 {
            self.progress.notify_all();
        }
        Retired { count, lwm }
    }

    /// Blocks until `commit_parent` is covered by the LWM, or every unfinished
    /// group at or below it is queued on `worker` (FIFO already orders those).
    pub fn wait_for_dependency(
        &self,
        commit_parent: u64,
        worker: WorkerId,
        hook: &dyn WakeHook,
    ) -> Result<bool, ApplierError> {
        if self.lwm_estimate().is_some_and(|lwm| lwm >= commit_parent) {
            return Ok(false);
        }
        let mut waited = false;
        let mut guard = self.state.lock();
        loop {
            let lwm = guard.refresh_lwm();
            self.lwm_estimate.store(encode(lwm), Ordering::Release);
            if lwm.is_some_and(|value| value >= commit_parent) {
                return Ok(waited);
            }
            let blocked = guard.ring.iter().any(|(_, record)| {
                !record.done
                    && record.worker != Some(worker)
                    && record
                        .clock
                        .sequence_number
                        .is_some_and(|sequence| sequence <= commit_parent)
            });
            if !blocked {
                return Ok(waited);
            }
            waited = true;
            self.progress.wait_for(&mut guard, self.poll);
            MutexGuard::unlocked(&mut guard, || hook.on_wake())?;
        }
    }

    /// Blocks until every assigned group is done.
    pub fn wait_until_idle(&self, hook: &dyn WakeHook) -> Result<bool, ApplierError> {
        let mut guard = self.state.lock();
        let mut waited = false;
        while guard.pending > 0 {
            waited = true;
            self.progress.wait_for(&mut guard, self.poll);
            MutexGuard::unlocked(&mut guard, || hook.on_wake())?;
        }
        Ok(waited)
    }

    /// Waits once for any progress notification; returns false on timeout.
    pub fn wait_for_progress(&self, timeout: Duration) -> bool {
        let mut guard = self.state.lock();
        !self.progress.wait_for(&mut guard, timeout).timed_out()
    }

    pub fn notify_all(&self) {
        self.progress.notify_all();
    }
}

impl std::fmt::Debug for GroupAssignmentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.state.lock();
        f.debug_struct("GroupAssignmentQueue")
            .field("len", &guard.ring.len())
            .field("pending", &guard.pending)
            .field("next_index", &guard.next_index)
            .finish()
    }
}
