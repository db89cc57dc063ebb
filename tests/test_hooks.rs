use applier::{TestHook, TestHookRegistry};

#[test]
fn registry_reports_active_hooks() {
    let mut registry = TestHookRegistry::new();
    registry.register(TestHook::DelayApply {
        group: "g1".into(),
        delay_ms: 50,
    });
    registry.register(TestHook::FailApply {
        group: "g2".into(),
        transient: true,
        times: 3,
    });
    assert_eq!(registry.apply_delay_ms("g1"), Some(50));
    assert_eq!(registry.apply_delay_ms("g2"), None);
    assert_eq!(registry.apply_failure("g2"), Some((true, 3)));
    assert_eq!(registry.commit_failure("g2"), None);

    registry.register(TestHook::FailCommit {
        group: "g2".into(),
        transient: false,
        times: 1,
    });
    assert_eq!(registry.commit_failure("g2"), Some((false, 1)));
    assert_eq!(registry.hooks().len(), 3);
}
