//! Cross-worker commit ordering.
//!
//! Tickets are registered in dispatch order. A worker may only commit once its
//! ticket reaches the front of the FIFO; every legal state change goes through
//! [`transition`].

use crate::id::{ChannelId, WorkerId};
use crate::signal::PoolSignal;
use crate::storage::LockHolder;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Identifier of one commit ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TicketId(u64);

impl TicketId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Registered,
    FinishedApplying,
    RequestedGrant,
    Waited,
    ReleaseNext,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketEvent {
    /// The storage engine applied the group.
    FinishApplying,
    /// The ticket is not at the front and starts waiting.
    RequestGrant,
    /// The ticket reached the front.
    Grant,
    /// The commit went through; the successor may be woken.
    ReleaseNext,
    Finish,
    /// The applied work was rolled back and will be retried.
    Rollback,
    /// The ticket leaves the FIFO without committing.
    Abandon,
}

/// Single place where ticket state changes are decided.
pub fn transition(from: TicketState, event: TicketEvent) -> Option<TicketState> {
    use TicketEvent as E;
    use TicketState as S;
    match (from, event) {
        (S::Registered, E::FinishApplying) => Some(S::FinishedApplying),
        (S::FinishedApplying, E::RequestGrant) => Some(S::RequestedGrant),
        (S::FinishedApplying | S::RequestedGrant, E::Grant) => Some(S::Waited),
        (S::Waited, E::ReleaseNext) => Some(S::ReleaseNext),
        (S::ReleaseNext, E::Finish) => Some(S::Finished),
        (S::Registered | S::FinishedApplying | S::RequestedGrant | S::Waited, E::Rollback) => {
            Some(S::Registered)
        }
        (S::Finished, E::Abandon) => None,
        (_, E::Abandon) => Some(S::Finished),
        _ => None,
    }
}

/// Result of [`CommitSequencer::wait_for_turn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The ticket is at the front: commit now.
    Proceed,
    /// Roll back and retry the group; the ticket keeps its place.
    Rollback,
    /// The pool is stopping or failed: roll back and give up.
    Abort,
}

/// Result of [`CommitSequencer::report_deadlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlockVerdict {
    /// The holder commits first anyway, or is not a sequencer participant.
    NotDeadlock,
    /// The holder's ticket was told to roll back.
    RollbackRequested { victim: WorkerId, ticket: TicketId },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequencerError {
    #[error("unknown commit ticket {0}")]
    UnknownTicket(TicketId),
    #[error("illegal ticket transition for {ticket}: {from:?} on {event:?}")]
    IllegalTransition {
        ticket: TicketId,
        from: TicketState,
        event: TicketEvent,
    },
    #[error("ticket {0} finished while not at the front of the queue")]
    NotAtFront(TicketId),
}

#[derive(Debug)]
struct Ticket {
    worker: WorkerId,
    state: TicketState,
    /// Set once the owning worker started executing the group.
    live: bool,
    rollback_requested: bool,
}

#[derive(Debug, Default)]
struct SequencerState {
    queue: VecDeque<TicketId>,
    tickets: HashMap<TicketId, Ticket>,
    next_ticket: u64,
    abort: bool,
    rollbacks: u64,
}

impl SequencerState {
    fn ticket_mut(&mut self, id: TicketId) -> Result<&mut Ticket, SequencerError> {
        self.tickets
            .get_mut(&id)
            .ok_or(SequencerError::UnknownTicket(id))
    }

    fn apply(&mut self, id: TicketId, event: TicketEvent) -> Result<TicketState, SequencerError> {
        let ticket = self.ticket_mut(id)?;
        let next = transition(ticket.state, event).ok_or(SequencerError::IllegalTransition {
            ticket: id,
            from: ticket.state,
            event,
        })?;
        ticket.state = next;
        Ok(next)
    }

    fn position(&self, id: TicketId) -> Option<usize> {
        self.queue.iter().position(|queued| *queued == id)
    }

    fn front_worker(&self) -> Option<WorkerId> {
        let front = self.queue.front()?;
        self.tickets.get(front).map(|ticket| ticket.worker)
    }

    fn remove(&mut self, id: TicketId) -> Option<Ticket> {
        if let Some(position) = self.position(id) {
            self.queue.remove(position);
        }
        self.tickets.remove(&id)
    }
}

/// FIFO of commit tickets with one condvar per worker.
pub struct CommitSequencer {
    channel: ChannelId,
    state: Mutex<SequencerState>,
    turns: Vec<Condvar>,
    poll: Duration,
}

impl CommitSequencer {
    pub fn new(channel: ChannelId, worker_count: usize, poll: Duration) -> Self {
        Self {
            channel,
            state: Mutex::new(SequencerState::default()),
            turns: (0..worker_count.max(1)).map(|_| Condvar::new()).collect(),
            poll,
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    fn wake(&self, worker: Option<WorkerId>) {
        if let Some(condvar) = worker.and_then(|worker| self.turns.get(worker.index())) {
            condvar.notify_one();
        }
    }

    /// Appends a ticket for `worker`; called by the dispatcher at enqueue time.
    pub fn register(&self, worker: WorkerId) -> TicketId {
        let mut guard = self.state.lock();
        let id = TicketId(guard.next_ticket);
        guard.next_ticket += 1;
        guard.queue.push_back(id);
        guard.tickets.insert(
            id,
            Ticket {
                worker,
                state: TicketState::Registered,
                live: false,
                rollback_requested: false,
            },
        );
        id
    }

    /// Marks the ticket's group as being executed by its worker.
    pub fn begin(&self, id: TicketId) -> Result<(), SequencerError> {
        self.state.lock().ticket_mut(id)?.live = true;
        Ok(())
    }

    pub fn finish_applying(&self, id: TicketId) -> Result<(), SequencerError> {
        self.state.lock().apply(id, TicketEvent::FinishApplying)?;
        Ok(())
    }

    /// Blocks until the ticket is at the front, a rollback was requested for
    /// it, or the pool is aborting.
    pub fn wait_for_turn(
        &self,
        id: TicketId,
        signal: &PoolSignal,
    ) -> Result<TurnOutcome, SequencerError> {
        let mut guard = self.state.lock();
        let worker = guard.ticket_mut(id)?.worker;
        let Some(turn) = self.turns.get(worker.index()) else {
            return Err(SequencerError::UnknownTicket(id));
        };
        loop {
            let ticket = guard.ticket_mut(id)?;
            if ticket.rollback_requested {
                ticket.rollback_requested = false;
                guard.apply(id, TicketEvent::Rollback)?;
                guard.rollbacks += 1;
                return Ok(TurnOutcome::Rollback);
            }
            if guard.abort || signal.killed() {
                return Ok(TurnOutcome::Abort);
            }
            if guard.queue.front() == Some(&id) {
                guard.apply(id, TicketEvent::Grant)?;
                return Ok(TurnOutcome::Proceed);
            }
            if signal.stop_requested() {
                // A front ticket whose group never started will not commit.
                let front_live = guard
                    .queue
                    .front()
                    .and_then(|front| guard.tickets.get(front))
                    .is_some_and(|ticket| ticket.live);
                if !front_live {
                    return Ok(TurnOutcome::Abort);
                }
            }
            if guard.ticket_mut(id)?.state == TicketState::FinishedApplying {
                guard.apply(id, TicketEvent::RequestGrant)?;
            }
            turn.wait_for(&mut guard, self.poll);
        }
    }

    /// The granted commit failed and the group will be applied again; the
    /// ticket keeps its place in the queue.
    pub fn retry(&self, id: TicketId) -> Result<(), SequencerError> {
        self.state.lock().apply(id, TicketEvent::Rollback)?;
        Ok(())
    }

    /// Pops the front ticket after its commit and wakes the successor.
    pub fn finish(&self, id: TicketId) -> Result<(), SequencerError> {
        let mut guard = self.state.lock();
        if guard.queue.front() != Some(&id) {
            return Err(SequencerError::NotAtFront(id));
        }
        guard.apply(id, TicketEvent::ReleaseNext)?;
        guard.apply(id, TicketEvent::Finish)?;
        guard.remove(id);
        let next = guard.front_worker();
        drop(guard);
        self.wake(next);
        Ok(())
    }

    /// Removes a ticket without committing, e.g. a job dropped at shutdown.
    pub fn abandon(&self, id: TicketId) -> Result<(), SequencerError> {
        let mut guard = self.state.lock();
        let was_front = guard.queue.front() == Some(&id);
        guard.apply(id, TicketEvent::Abandon)?;
        guard.remove(id);
        let next = if was_front { guard.front_worker() } else { None };
        drop(guard);
        self.wake(next);
        Ok(())
    }

    /// Fatal failure of the ticket's group: unregister it and make every
    /// waiting ticket return [`TurnOutcome::Abort`].
    pub fn report_rollback(&self, id: TicketId) -> Result<(), SequencerError> {
        {
            let mut guard = self.state.lock();
            guard.abort = true;
            if guard.tickets.contains_key(&id) {
                guard.apply(id, TicketEvent::Abandon)?;
                guard.remove(id);
            }
        }
        self.notify_all();
        Ok(())
    }

    /// Lock-wait callback: `reporter` is blocked in the storage engine on a
    /// lock held by `holder`. If the holder is scheduled to commit after the
    /// reporter, the holder is waiting on us while we wait on it; it is rolled back.
    pub fn report_deadlock(
        &self,
        reporter: TicketId,
        holder: &LockHolder,
    ) -> Result<DeadlockVerdict, SequencerError> {
        if holder.channel != self.channel {
            return Ok(DeadlockVerdict::NotDeadlock);
        }
        let mut guard = self.state.lock();
        let reporter_position = guard
            .position(reporter)
            .ok_or(SequencerError::UnknownTicket(reporter))?;
        let holder_ticket = guard.queue.iter().copied().find(|id| {
            guard
                .tickets
                .get(id)
                .is_some_and(|ticket| ticket.worker == holder.worker && ticket.live)
        });
        let Some(holder_ticket) = holder_ticket else {
            return Ok(DeadlockVerdict::NotDeadlock);
        };
        let holder_position = guard.position(holder_ticket).unwrap_or(0);
        if reporter_position >= holder_position {
            return Ok(DeadlockVerdict::NotDeadlock);
        }
        let ticket = guard.ticket_mut(holder_ticket)?;
        if ticket.state == TicketState::Waited || ticket.state == TicketState::ReleaseNext {
            return Ok(DeadlockVerdict::NotDeadlock);
        }
        ticket.rollback_requested = true;
        drop(guard);
        warn!(
            victim = %holder.worker,
            ticket = %holder_ticket,
            reporter = %reporter,
            "commit order deadlock; rolling back the later transaction"
        );
        self.wake(Some(holder.worker));
        Ok(DeadlockVerdict::RollbackRequested {
            victim: holder.worker,
            ticket: holder_ticket,
        })
    }

    pub fn state_of(&self, id: TicketId) -> Option<TicketState> {
        self.state.lock().tickets.get(&id).map(|ticket| ticket.state)
    }

    pub fn position_of(&self, id: TicketId) -> Option<usize> {
        self.state.lock().position(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deadlock rollbacks handed out so far.
    pub fn rollbacks(&self) -> u64 {
        self.state.lock().rollbacks
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().abort
    }

    pub fn notify_all(&self) {
        debug!(channel = %self.channel, "waking every commit ticket");
        for condvar in &self.turns {
            condvar.notify_all();
        }
    }
}

impl fmt::Debug for CommitSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitSequencer")
            .field("channel", &self.channel)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_ticket_lifecycle() {
        use TicketEvent as E;
        use TicketState as S;
        let mut state = S::Registered;
        for event in [E::FinishApplying, E::RequestGrant, E::Grant, E::ReleaseNext, E::Finish] {
            state = transition(state, event).unwrap();
        }
        assert_eq!(state, S::Finished);
        assert_eq!(transition(S::Registered, E::Grant), None);
        assert_eq!(transition(S::Waited, E::Rollback), Some(S::Registered));
        assert_eq!(transition(S::ReleaseNext, E::Rollback), None);
        assert_eq!(transition(S::RequestedGrant, E::Rollback), Some(S::Registered));
        assert_eq!(transition(S::Finished, E::Abandon), None);
    }
}
