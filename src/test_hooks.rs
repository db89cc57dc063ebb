/// Deterministic hook used to alter storage behavior during tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestHook {
    /// Sleep before applying the group with this id.
    DelayApply { group: String, delay_ms: u64 },
    /// Fail the first `times` apply attempts of the group.
    FailApply {
        group: String,
        transient: bool,
        times: u32,
    },
    /// Fail the first `times` commit attempts of the group.
    FailCommit {
        group: String,
        transient: bool,
        times: u32,
    },
}

/// Registry of active hooks used by integration tests and the replay tool.
#[derive(Debug, Default, Clone)]
pub struct TestHookRegistry {
    hooks: Vec<TestHook>,
}

impl TestHookRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Registers a new hook.
    pub fn register(&mut self, hook: TestHook) {
        self.hooks.push(hook);
    }

    pub fn with(mut self, hook: TestHook) -> Self {
        self.register(hook);
        self
    }

    /// Returns all hooks in registration order.
    pub fn hooks(&self) -> &[TestHook] {
        &self.hooks
    }

    /// Delay to inject before applying `group`, if any.
    pub fn apply_delay_ms(&self, group: &str) -> Option<u64> {
        self.hooks.iter().find_map(|hook| match hook {
            TestHook::DelayApply {
                group: target,
                delay_ms,
            } if target == group => Some(*delay_ms),
            _ => None,
        })
    }

    /// `(transient, times)` when applying `group` should fail.
    pub fn apply_failure(&self, group: &str) -> Option<(bool, u32)> {
        self.hooks.iter().find_map(|hook| match hook {
            TestHook::FailApply {
                group: target,
                transient,
                times,
            } if target == group => Some((*transient, *times)),
            _ => None,
        })
    }

    /// `(transient, times)` when committing `group` should fail.
    pub fn commit_failure(&self, group: &str) -> Option<(bool, u32)> {
        self.hooks.iter().find_map(|hook| match hook {
            TestHook::FailCommit {
                group: target,
                transient,
                times,
            } if target == group => Some((*transient, *times)),
            _ => None,
        })
    }
}
