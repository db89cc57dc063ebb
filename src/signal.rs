use crate::error::{ApplierError, ErrorState};
use crate::id::WorkerId;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stop/kill flags plus the shared error record, checked on every wake-up.
///
/// `stop` asks threads to finish their current unit of work and exit.
/// `kill` is raised together with a fatal error; it additionally tells the
/// dispatcher to skip the forced checkpoint on the way out.
#[derive(Debug, Default)]
pub struct PoolSignal {
    stop: AtomicBool,
    kill: AtomicBool,
    errors: ErrorState,
}

impl PoolSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.killed()
    }

    /// Records a fatal error and raises both flags. Returns true if it was the first error.
    pub fn fail(&self, worker: Option<WorkerId>, error: ApplierError) -> bool {
        let first = self.errors.record(worker, error);
        self.kill.store(true, Ordering::Release);
        self.stop.store(true, Ordering::Release);
        first
    }

    pub fn killed(&self) -> bool {
        self.kill.load(Ordering::Acquire)
    }

    pub fn errors(&self) -> &ErrorState {
        &self.errors
    }

    /// Fails with the first fatal error, or `Cancelled` once a stop was requested.
    pub fn check(&self) -> Result<(), ApplierError> {
        if let Some(error) = self.errors.first() {
            return Err(error);
        }
        if self.stop_requested() {
            return Err(ApplierError::Cancelled);
        }
        Ok(())
    }

    /// Like [`PoolSignal::check`] but ignores a plain stop request.
    pub fn check_fatal(&self) -> Result<(), ApplierError> {
        match self.errors.first() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Runs on every wake-up of a blocking wait, with the wait's lock released.
/// An error ends the wait.
pub trait WakeHook {
    fn on_wake(&self) -> Result<(), ApplierError>;
}

impl WakeHook for PoolSignal {
    fn on_wake(&self) -> Result<(), ApplierError> {
        self.check()
    }
}
