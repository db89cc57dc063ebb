use applier::{
    ApplierConfig, ApplierError, ChannelId, DispatchOutcome, Dispatcher, EventGroup, LoggedGroup,
    MemoryCheckpointStore, MemoryLog, MemoryStorage, ProtocolError, SchedulingPolicyKind,
    SourcePosition, TestHook, TestHookRegistry,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn config(workers: usize) -> ApplierConfig {
    ApplierConfig {
        worker_count: workers,
        queue_capacity: 16,
        gaq_capacity: 64,
        checkpoint_period: 10,
        checkpoint_group: 4,
        retry_backoff: 5,
        scheduling_policy: SchedulingPolicyKind::LogicalClock,
        poll_interval: 5,
        channel: "test".into(),
        ..ApplierConfig::default()
    }
}

fn logged(n: u64, sequence: Option<u64>, parent: Option<u64>) -> LoggedGroup {
    LoggedGroup::new(
        SourcePosition::new(1, n * 100),
        EventGroup::new(format!("g{n}"))
            .with_clock(sequence, parent)
            .with_record("t", format!("k{n}"), vec![n as u8]),
    )
}

fn start(workers: usize, storage: &MemoryStorage) -> Dispatcher {
    Dispatcher::start(
        config(workers),
        Arc::new(storage.clone()),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .unwrap()
}

fn wait_for<F>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not met within {:?}", timeout);
}

fn commit_index(storage: &MemoryStorage, group: &str) -> usize {
    storage
        .committed_groups()
        .iter()
        .position(|committed| committed == group)
        .unwrap_or_else(|| panic!("{group} was not committed"))
}

#[test]
fn dependent_chain_stays_on_one_worker_and_commits_in_order() {
    let storage = MemoryStorage::new(ChannelId::new("test"));
    let mut dispatcher = start(2, &storage);
    let mut log = MemoryLog::from_groups(vec![
        logged(1, Some(1), None),
        logged(2, Some(2), Some(1)),
        logged(3, Some(3), Some(2)),
    ])
    .unwrap();
    let summary = dispatcher.run(&mut log).unwrap();
    assert_eq!(summary.dispatched, 3);
    assert!(summary.end_of_stream);
    let status = dispatcher.drain().unwrap();
    assert_eq!(status.executed(), 3);

    let commits = storage.commits();
    assert_eq!(storage.committed_groups(), vec!["g1", "g2", "g3"]);
    let workers: BTreeSet<_> = commits.iter().map(|commit| commit.worker).collect();
    assert_eq!(workers.len(), 1);
}

#[test]
fn siblings_of_one_parent_spread_across_workers() {
    let storage = MemoryStorage::new(ChannelId::new("test"));
    let mut dispatcher = start(2, &storage);
    let mut groups = vec![logged(1, Some(1), None)];
    groups.extend((2..=9).map(|n| logged(n, Some(n), Some(1))));
    let mut log = MemoryLog::from_groups(groups).unwrap();
    dispatcher.run(&mut log).unwrap();
    dispatcher.drain().unwrap();

    let commits = storage.commits();
    assert_eq!(commits.len(), 9);
    let workers: BTreeSet<_> = commits.iter().map(|commit| commit.worker).collect();
    assert_eq!(workers.len(), 2);
}

#[test]
fn gap_successor_drains_the_pool_first() {
    let storage = MemoryStorage::new(ChannelId::new("test"));
    let mut dispatcher = start(2, &storage);
    let first = dispatcher.dispatch(logged(1, Some(1), None)).unwrap();
    assert!(matches!(first, DispatchOutcome::Assigned { barrier: true, .. }));
    let second = dispatcher.dispatch(logged(2, Some(2), Some(1))).unwrap();
    assert!(matches!(second, DispatchOutcome::Assigned { barrier: false, .. }));
    let gap = dispatcher.dispatch(logged(3, Some(5), Some(2))).unwrap();
    assert!(matches!(gap, DispatchOutcome::Assigned { barrier: true, .. }));
    let status = dispatcher.drain().unwrap();
    assert_eq!(status.barriers, 2);
    assert!(commit_index(&storage, "g1") < commit_index(&storage, "g3"));
    assert!(commit_index(&storage, "g2") < commit_index(&storage, "g3"));
}

#[test]
fn child_on_another_worker_commits_after_its_parent() {
    let hooks = TestHookRegistry::new().with(TestHook::DelayApply {
        group: "g1".into(),
        delay_ms: 80,
    });
    let storage = MemoryStorage::with_hooks(ChannelId::new("test"), hooks);
    let mut dispatcher = start(3, &storage);
    let mut log = MemoryLog::from_groups(vec![
        logged(1, Some(1), None),
        logged(2, Some(2), Some(0)),
        logged(3, Some(3), Some(1)),
        logged(4, Some(4), Some(0)),
    ])
    .unwrap();
    dispatcher.run(&mut log).unwrap();
    dispatcher.drain().unwrap();
    assert_eq!(storage.commits().len(), 4);
    assert!(commit_index(&storage, "g1") < commit_index(&storage, "g3"));
}

#[test]
fn malformed_clock_fails_the_pool() {
    let storage = MemoryStorage::new(ChannelId::new("test"));
    let mut dispatcher = start(2, &storage);
    let mut log = MemoryLog::from_groups(vec![
        logged(1, Some(1), None),
        logged(2, Some(4), Some(4)),
    ])
    .unwrap();
    let err = dispatcher.run(&mut log).unwrap_err();
    assert!(matches!(
        err,
        ApplierError::Protocol(ProtocolError::SequenceNotAfterParent { .. })
    ));
    assert_eq!(dispatcher.stop().unwrap_err(), err);
    assert_eq!(
        dispatcher.status().state,
        applier::DispatcherState::Failed
    );
}

#[test]
fn regressing_positions_are_rejected() {
    let storage = MemoryStorage::new(ChannelId::new("test"));
    let mut dispatcher = start(1, &storage);
    dispatcher.dispatch(logged(2, Some(1), None)).unwrap();
    let err = dispatcher.dispatch(logged(1, Some(2), Some(1))).unwrap_err();
    assert!(matches!(
        err,
        ApplierError::Protocol(ProtocolError::PositionRegressed { .. })
    ));
}

#[test]
fn smallest_gaq_still_orders_children_after_parents() {
    for preserve_commit_order in [false, true] {
        let storage = MemoryStorage::new(ChannelId::new("test"));
        let narrow = ApplierConfig {
            gaq_capacity: 2,
            preserve_commit_order,
            ..config(2)
        };
        let mut dispatcher = Dispatcher::start(
            narrow,
            Arc::new(storage.clone()),
            Arc::new(MemoryCheckpointStore::new()),
        )
        .unwrap();
        // Every third group depends on its predecessor, the rest skip one back.
        let parents: Vec<(u64, u64)> = (2..=40)
            .map(|n| (n, if n % 3 == 0 { n - 1 } else { n - 2 }))
            .collect();
        let mut groups = vec![logged(1, Some(1), None)];
        groups.extend(
            parents
                .iter()
                .map(|(n, parent)| logged(*n, Some(*n), Some(*parent))),
        );
        let mut log = MemoryLog::from_groups(groups).unwrap();
        dispatcher.run(&mut log).unwrap();
        let status = dispatcher.drain().unwrap();

        assert_eq!(status.executed(), 40);
        for (n, parent) in parents.into_iter().filter(|(_, parent)| *parent > 0) {
            assert!(
                commit_index(&storage, &format!("g{parent}"))
                    < commit_index(&storage, &format!("g{n}")),
                "g{n} committed before its parent g{parent} (ordered: {preserve_commit_order})"
            );
        }
    }
}

#[test]
fn checkpoint_advances_while_the_dispatcher_waits_at_a_barrier() {
    let hooks = TestHookRegistry::new()
        .with(TestHook::DelayApply {
            group: "g1".into(),
            delay_ms: 30,
        })
        .with(TestHook::DelayApply {
            group: "g2".into(),
            delay_ms: 400,
        });
    let storage = MemoryStorage::with_hooks(ChannelId::new("test"), hooks);
    let periodic = ApplierConfig {
        checkpoint_group: 1000,
        ..config(2)
    };
    let mut dispatcher = Dispatcher::start(
        periodic,
        Arc::new(storage.clone()),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .unwrap();
    let handle = dispatcher.handle();
    let runner = thread::spawn(move || {
        // g3 leaves a gap in the sequence and waits for g1 and g2 to drain.
        let mut log = MemoryLog::from_groups(vec![
            logged(1, Some(1), None),
            logged(2, Some(2), Some(0)),
            logged(3, Some(10), Some(9)),
        ])
        .unwrap();
        dispatcher.run(&mut log).unwrap();
        dispatcher.drain().unwrap();
    });

    wait_for(Duration::from_millis(300), || {
        handle.checkpoint_position().group_index == 1
    });
    assert!(!storage.committed_groups().contains(&"g2".to_string()));
    runner.join().unwrap();
    assert_eq!(handle.checkpoint_position().group_index, 3);
}
