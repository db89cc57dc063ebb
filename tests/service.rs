use applier::{
    ApplierConfig, ApplierService, ChannelId, ErrorClass, EventGroup, LiveLog, LoggedGroup,
    MemoryCheckpointStore, MemoryLog, MemoryStorage, SchedulingPolicyKind, ServiceState,
    SourcePosition, TestHook, TestHookRegistry,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn config() -> ApplierConfig {
    ApplierConfig {
        worker_count: 2,
        queue_capacity: 4,
        gaq_capacity: 16,
        checkpoint_period: 10,
        checkpoint_group: 4,
        retry_backoff: 5,
        max_retries: 3,
        scheduling_policy: SchedulingPolicyKind::LogicalClock,
        poll_interval: 5,
        channel: "test".into(),
        ..ApplierConfig::default()
    }
}

fn at(n: u64) -> SourcePosition {
    SourcePosition::new(1, n * 100)
}

fn logged(n: u64) -> LoggedGroup {
    LoggedGroup::new(
        at(n),
        EventGroup::new(format!("g{n}"))
            .with_clock(Some(n), Some(0))
            .with_record("t", format!("k{n}"), vec![n as u8]),
    )
}

fn log(count: u64) -> Box<MemoryLog> {
    Box::new(MemoryLog::from_groups((1..=count).map(logged)).unwrap())
}

fn service(storage: &MemoryStorage) -> ApplierService {
    ApplierService::new(
        config(),
        Arc::new(storage.clone()),
        Arc::new(MemoryCheckpointStore::new()),
    )
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

#[test]
fn start_and_stop_are_idempotent() {
    let hooks = TestHookRegistry::new().with(TestHook::DelayApply {
        group: "g1".into(),
        delay_ms: 200,
    });
    let storage = MemoryStorage::with_hooks(ChannelId::new("test"), hooks);
    let service = service(&storage);
    service.stop().unwrap();
    assert_eq!(service.state(), ServiceState::Idle);

    service.start(log(4)).unwrap();
    assert_eq!(service.state(), ServiceState::Running);
    service.start(log(4)).unwrap();
    assert_eq!(service.state(), ServiceState::Running);

    service.stop().unwrap();
    assert_eq!(service.state(), ServiceState::Stopped);
    service.stop().unwrap();
    assert_eq!(service.state(), ServiceState::Stopped);
    let committed = storage.committed_groups();
    let unique: BTreeSet<_> = committed.iter().collect();
    assert_eq!(unique.len(), committed.len());
}

#[test]
fn drain_applies_the_whole_stream() {
    let storage = MemoryStorage::new(ChannelId::new("test"));
    let service = service(&storage);
    service.start(log(12)).unwrap();
    service.drain().unwrap();
    assert_eq!(service.state(), ServiceState::Stopped);

    let status = service.status().unwrap();
    assert_eq!(status.executed(), 12);
    assert_eq!(status.error, None);
    let checkpoint = service.checkpoint_position().unwrap();
    assert_eq!(checkpoint.position, Some(at(12)));
    assert_eq!(checkpoint.group_index, 12);
    assert_eq!(storage.commits().len(), 12);
}

#[test]
fn non_transient_failure_moves_the_service_to_failed() {
    let hooks = TestHookRegistry::new().with(TestHook::FailApply {
        group: "g3".into(),
        transient: false,
        times: 1,
    });
    let storage = MemoryStorage::with_hooks(ChannelId::new("test"), hooks);
    let service = service(&storage);
    service.start(log(8)).unwrap();
    let err = service.drain().unwrap_err();
    assert_eq!(err.class(), ErrorClass::Execution);
    assert_eq!(service.state(), ServiceState::Failed);

    let status = service.status().unwrap();
    assert_eq!(status.error_class, Some(ErrorClass::Execution));
    assert!(!storage.committed_groups().contains(&"g3".to_string()));
    // The persisted checkpoint never passes the failed group.
    let checkpoint = service.checkpoint_position().unwrap();
    assert!(checkpoint.position < Some(at(3)));
}

#[test]
fn transient_failures_are_retried() {
    let hooks = TestHookRegistry::new().with(TestHook::FailApply {
        group: "g2".into(),
        transient: true,
        times: 2,
    });
    let storage = MemoryStorage::with_hooks(ChannelId::new("test"), hooks);
    let service = service(&storage);
    service.start(log(5)).unwrap();
    service.drain().unwrap();

    let status = service.status().unwrap();
    assert_eq!(status.executed(), 5);
    let retries: u64 = status.workers.iter().map(|worker| worker.retries).sum();
    assert_eq!(retries, 2);
}

#[test]
fn restart_after_stop_applies_each_group_once() {
    let mut hooks = TestHookRegistry::new();
    for n in 1..=30 {
        hooks.register(TestHook::DelayApply {
            group: format!("g{n}"),
            delay_ms: 5,
        });
    }
    let storage = MemoryStorage::with_hooks(ChannelId::new("test"), hooks);
    let service = service(&storage);
    service.start(log(30)).unwrap();
    wait_for(Duration::from_secs(2), || storage.commits().len() >= 4);
    service.stop().unwrap();
    assert_eq!(service.state(), ServiceState::Stopped);

    service.start(log(30)).unwrap();
    service.drain().unwrap();
    let mut committed = storage.committed_groups();
    committed.sort_by_key(|id| id[1..].parse::<u64>().unwrap());
    let expected: Vec<String> = (1..=30).map(|n| format!("g{n}")).collect();
    assert_eq!(committed, expected);
    assert_eq!(
        service.checkpoint_position().unwrap().position,
        Some(at(30))
    );
}

#[test]
fn status_renders_per_worker_metrics() {
    let storage = MemoryStorage::new(ChannelId::new("test"));
    let service = service(&storage);
    assert!(service.status().is_none());
    service.start(log(3)).unwrap();
    service.drain().unwrap();
    let metrics = service.status().unwrap().render_metrics();
    assert!(metrics.contains("applier_dispatched_total 3"));
    assert!(metrics.contains("applier_worker_executed_total{worker=\"0\"}"));
    assert!(metrics.contains("applier_worker_executed_total{worker=\"1\"}"));
    assert!(metrics.contains("applier_checkpoint_group_index 3"));
}

#[test]
fn idle_stream_keeps_checkpointing_committed_groups() {
    let storage = MemoryStorage::new(ChannelId::new("test"));
    let periodic = ApplierConfig {
        checkpoint_group: 1000,
        ..config()
    };
    let service = ApplierService::new(
        periodic,
        Arc::new(storage.clone()),
        Arc::new(MemoryCheckpointStore::new()),
    );
    let log = LiveLog::new();
    let feed = log.feed();
    for n in 1..=3 {
        feed.push(logged(n)).unwrap();
    }
    service.start(Box::new(log)).unwrap();

    wait_for(Duration::from_secs(2), || storage.commits().len() == 3);
    wait_for(Duration::from_millis(500), || {
        service
            .checkpoint_position()
            .is_ok_and(|checkpoint| checkpoint.group_index == 3)
    });
    assert_eq!(service.state(), ServiceState::Running);
    assert_eq!(
        service.checkpoint_position().unwrap().position,
        Some(at(3))
    );

    feed.push(logged(4)).unwrap();
    feed.close();
    service.drain().unwrap();
    assert_eq!(
        service.checkpoint_position().unwrap().position,
        Some(at(4))
    );
}

#[test]
fn stop_interrupts_a_reader_waiting_for_data() {
    let storage = MemoryStorage::new(ChannelId::new("test"));
    let service = service(&storage);
    let log = LiveLog::new();
    log.feed().push(logged(1)).unwrap();
    service.start(Box::new(log)).unwrap();
    wait_for(Duration::from_secs(2), || storage.commits().len() == 1);
    service.stop().unwrap();
    assert_eq!(service.state(), ServiceState::Stopped);
    assert_eq!(
        service.checkpoint_position().unwrap().position,
        Some(at(1))
    );
}
