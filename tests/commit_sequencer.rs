use applier::{
    ChannelId, CommitSequencer, DeadlockVerdict, LockHolder, PoolSignal, TicketState, TurnOutcome,
    WorkerId,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(5);

fn sequencer(workers: usize) -> Arc<CommitSequencer> {
    Arc::new(CommitSequencer::new(ChannelId::new("main"), workers, POLL))
}

#[test]
fn tickets_commit_in_registration_order() {
    let sequencer = sequencer(3);
    let signal = Arc::new(PoolSignal::new());
    let committed = Arc::new(Mutex::new(Vec::new()));
    let tickets: Vec<_> = (0..3).map(|n| sequencer.register(WorkerId::new(n))).collect();

    // Later tickets finish applying first.
    let handles: Vec<_> = tickets
        .iter()
        .copied()
        .enumerate()
        .rev()
        .map(|(index, ticket)| {
            let sequencer = sequencer.clone();
            let signal = signal.clone();
            let committed = committed.clone();
            thread::spawn(move || {
                sequencer.begin(ticket).unwrap();
                sequencer.finish_applying(ticket).unwrap();
                assert_eq!(
                    sequencer.wait_for_turn(ticket, &signal).unwrap(),
                    TurnOutcome::Proceed
                );
                committed.lock().push(index);
                sequencer.finish(ticket).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*committed.lock(), vec![0, 1, 2]);
    assert!(sequencer.is_empty());
}

#[test]
fn finishing_out_of_turn_is_rejected() {
    let sequencer = sequencer(2);
    let _first = sequencer.register(WorkerId::new(0));
    let second = sequencer.register(WorkerId::new(1));
    assert!(sequencer.finish(second).is_err());
    assert_eq!(sequencer.state_of(second), Some(TicketState::Registered));
}

#[test]
fn deadlock_rolls_back_the_later_holder() {
    let sequencer = sequencer(2);
    let signal = PoolSignal::new();
    let earlier = sequencer.register(WorkerId::new(0));
    let later = sequencer.register(WorkerId::new(1));
    sequencer.begin(earlier).unwrap();
    sequencer.begin(later).unwrap();
    sequencer.finish_applying(later).unwrap();

    // The later ticket blocking the earlier one is a deadlock.
    let verdict = sequencer
        .report_deadlock(
            earlier,
            &LockHolder {
                channel: ChannelId::new("main"),
                worker: WorkerId::new(1),
            },
        )
        .unwrap();
    assert_eq!(
        verdict,
        DeadlockVerdict::RollbackRequested {
            victim: WorkerId::new(1),
            ticket: later,
        }
    );
    assert_eq!(
        sequencer.wait_for_turn(later, &signal).unwrap(),
        TurnOutcome::Rollback
    );
    assert_eq!(sequencer.state_of(later), Some(TicketState::Registered));
    assert_eq!(sequencer.position_of(later), Some(1));
    assert_eq!(sequencer.rollbacks(), 1);

    // The earlier ticket blocking the later one is plain waiting.
    let verdict = sequencer
        .report_deadlock(
            later,
            &LockHolder {
                channel: ChannelId::new("main"),
                worker: WorkerId::new(0),
            },
        )
        .unwrap();
    assert_eq!(verdict, DeadlockVerdict::NotDeadlock);
}

#[test]
fn holders_on_other_channels_are_ignored() {
    let sequencer = sequencer(2);
    let earlier = sequencer.register(WorkerId::new(0));
    let later = sequencer.register(WorkerId::new(1));
    sequencer.begin(later).unwrap();
    let verdict = sequencer
        .report_deadlock(
            earlier,
            &LockHolder {
                channel: ChannelId::new("other"),
                worker: WorkerId::new(1),
            },
        )
        .unwrap();
    assert_eq!(verdict, DeadlockVerdict::NotDeadlock);
}

#[test]
fn fatal_rollback_aborts_every_waiter() {
    let sequencer = sequencer(2);
    let signal = Arc::new(PoolSignal::new());
    let failing = sequencer.register(WorkerId::new(0));
    let waiting = sequencer.register(WorkerId::new(1));
    sequencer.begin(failing).unwrap();
    sequencer.begin(waiting).unwrap();
    sequencer.finish_applying(waiting).unwrap();
    let waiter = {
        let sequencer = sequencer.clone();
        let signal = signal.clone();
        thread::spawn(move || sequencer.wait_for_turn(waiting, &signal))
    };
    thread::sleep(Duration::from_millis(20));
    sequencer.report_rollback(failing).unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), TurnOutcome::Abort);
    assert!(sequencer.is_aborted());
}

#[test]
fn stop_aborts_waiters_behind_a_ticket_that_never_started() {
    let sequencer = sequencer(2);
    let signal = PoolSignal::new();
    let _queued = sequencer.register(WorkerId::new(0));
    let applied = sequencer.register(WorkerId::new(1));
    sequencer.begin(applied).unwrap();
    sequencer.finish_applying(applied).unwrap();
    signal.request_stop();
    assert_eq!(
        sequencer.wait_for_turn(applied, &signal).unwrap(),
        TurnOutcome::Abort
    );
}
