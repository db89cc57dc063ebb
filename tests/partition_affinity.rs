use applier::{
    ApplierConfig, ApplierError, ChannelId, DispatchOutcome, Dispatcher, EventGroup, LoggedGroup,
    MemoryCheckpointStore, MemoryLog, MemoryStorage, ProtocolError, SchedulingPolicyKind,
    SourcePosition, TestHook, TestHookRegistry,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn config(workers: usize) -> ApplierConfig {
    ApplierConfig {
        worker_count: workers,
        queue_capacity: 8,
        gaq_capacity: 32,
        checkpoint_period: 10,
        checkpoint_group: 8,
        retry_backoff: 5,
        scheduling_policy: SchedulingPolicyKind::PartitionAffinity,
        max_partitions_per_group: 2,
        poll_interval: 5,
        channel: "test".into(),
        ..ApplierConfig::default()
    }
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

fn start(workers: usize, storage: &MemoryStorage) -> Dispatcher {
    Dispatcher::start(
        config(workers),
        Arc::new(storage.clone()),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .unwrap()
}

fn on_partitions(n: u64, partitions: &[&str]) -> LoggedGroup {
    let mut group = EventGroup::new(format!("g{n}"));
    for partition in partitions {
        group = group.with_record(*partition, format!("row{n}"), n.to_be_bytes().to_vec());
    }
    LoggedGroup::new(SourcePosition::new(1, n * 10), group)
}

#[test]
fn groups_on_one_partition_commit_in_log_order() {
    let mut hooks = TestHookRegistry::new();
    for n in (1..=24).step_by(5) {
        hooks.register(TestHook::DelayApply {
            group: format!("g{n}"),
            delay_ms: 15,
        });
    }
    let storage = MemoryStorage::with_hooks(ChannelId::new("test"), hooks);
    let mut dispatcher = start(3, &storage);
    let keys = ["orders", "users", "stock", "audit"];
    let groups: Vec<_> = (1..=24)
        .map(|n| on_partitions(n, &[keys[(n as usize * 7) % keys.len()]]))
        .collect();
    let expected: BTreeMap<&str, Vec<String>> = keys
        .iter()
        .map(|key| {
            let ids = groups
                .iter()
                .filter(|logged| logged.group.records[0].partition == *key)
                .map(|logged| logged.group.id.clone())
                .collect();
            (*key, ids)
        })
        .collect();

    let mut log = MemoryLog::from_groups(groups).unwrap();
    dispatcher.run(&mut log).unwrap();
    let status = dispatcher.drain().unwrap();
    assert_eq!(status.executed(), 24);

    let committed = storage.committed_groups();
    for (key, ids) in expected {
        let order: Vec<_> = committed.iter().filter(|id| ids.contains(id)).cloned().collect();
        assert_eq!(order, ids, "partition {key} committed out of order");
    }
}

#[test]
fn multi_partition_group_waits_for_both_owners() {
    let hooks = TestHookRegistry::new().with(TestHook::DelayApply {
        group: "g1".into(),
        delay_ms: 60,
    });
    let storage = MemoryStorage::with_hooks(ChannelId::new("test"), hooks);
    let mut dispatcher = start(2, &storage);
    let mut log = MemoryLog::from_groups(vec![
        on_partitions(1, &["a"]),
        on_partitions(2, &["b"]),
        on_partitions(3, &["b", "a"]),
    ])
    .unwrap();
    dispatcher.run(&mut log).unwrap();
    dispatcher.drain().unwrap();
    let committed = storage.committed_groups();
    assert_eq!(committed.last().map(String::as_str), Some("g3"));
}

#[test]
fn wide_group_runs_alone() {
    let storage = MemoryStorage::new(ChannelId::new("test"));
    let mut dispatcher = start(2, &storage);
    assert!(matches!(
        dispatcher.dispatch(on_partitions(1, &["a"])).unwrap(),
        DispatchOutcome::Assigned { barrier: false, .. }
    ));
    // Three partitions exceed the limit of two: isolated on the overflow key.
    assert!(matches!(
        dispatcher.dispatch(on_partitions(2, &["a", "b", "c"])).unwrap(),
        DispatchOutcome::Assigned { barrier: true, .. }
    ));
    assert!(matches!(
        dispatcher.dispatch(on_partitions(3, &["b"])).unwrap(),
        DispatchOutcome::Assigned { barrier: true, .. }
    ));
    dispatcher.drain().unwrap();
    assert_eq!(storage.committed_groups(), vec!["g1", "g2", "g3"]);
}

#[test]
fn unnamed_partition_is_a_protocol_error() {
    let storage = MemoryStorage::new(ChannelId::new("test"));
    let mut dispatcher = start(2, &storage);
    let err = dispatcher.dispatch(on_partitions(1, &[""])).unwrap_err();
    assert!(matches!(
        err,
        ApplierError::Protocol(ProtocolError::UndefinedPartition { .. })
    ));
}

#[test]
fn temporaries_are_parked_and_handed_to_the_next_owner() {
    let storage = MemoryStorage::new(ChannelId::new("test"));
    let mut dispatcher = start(2, &storage);
    let creates = LoggedGroup::new(
        SourcePosition::new(1, 10),
        EventGroup::new("g1")
            .with_record("a", "row", b"1".to_vec())
            .with_temporary("a", "tmp_orders"),
    );
    dispatcher.dispatch(creates).unwrap();
    wait_for(Duration::from_secs(2), || dispatcher.status().in_flight == 0);
    let parked = dispatcher.partitions();
    let entry = parked.iter().find(|entry| entry.key == "a").unwrap();
    assert_eq!(entry.usage, 0);
    assert_eq!(entry.side_state, vec!["tmp_orders".to_string()]);

    let uses = LoggedGroup::new(
        SourcePosition::new(1, 20),
        EventGroup::new("g2").with_record("a", "row", b"2".to_vec()),
    );
    dispatcher.dispatch(uses).unwrap();
    wait_for(Duration::from_secs(2), || dispatcher.status().in_flight == 0);
    let parked = dispatcher.partitions();
    let entry = parked.iter().find(|entry| entry.key == "a").unwrap();
    assert_eq!(entry.side_state, vec!["tmp_orders".to_string()]);
    dispatcher.drain().unwrap();
    assert_eq!(storage.committed_groups(), vec!["g1", "g2"]);
}
