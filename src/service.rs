//! Start/stop surface around one dispatcher thread. Commands are idempotent:
//! starting a running service and stopping a stopped one are no-ops.

use crate::checkpoint::{CheckpointStore, CoordinatorCheckpoint};
use crate::config::ApplierConfig;
use crate::dispatcher::{Dispatcher, PoolHandle};
use crate::error::ApplierError;
use crate::log_reader::LogReader;
use crate::recovery::{RecoveryPlan, RecoveryScanner};
use crate::status::PoolStatus;
use crate::storage::StorageEngine;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceState::Idle => "idle",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        };
        f.write_str(label)
    }
}

type Outcome = Result<PoolStatus, ApplierError>;

#[derive(Default)]
struct Session {
    handle: Option<PoolHandle>,
    thread: Option<JoinHandle<()>>,
    plan: Option<RecoveryPlan>,
    outcome: Option<Outcome>,
}

struct ServiceShared {
    inner: Mutex<(ServiceState, Session)>,
    changed: Condvar,
}

impl ServiceShared {
    fn finish(&self, outcome: Outcome) {
        let mut guard = self.inner.lock();
        guard.0 = match &outcome {
            Ok(_) => ServiceState::Stopped,
            Err(_) => ServiceState::Failed,
        };
        guard.1.outcome = Some(outcome);
        self.changed.notify_all();
    }
}

pub struct ApplierService {
    config: ApplierConfig,
    storage: Arc<dyn StorageEngine>,
    store: Arc<dyn CheckpointStore>,
    shared: Arc<ServiceShared>,
}

impl ApplierService {
    pub fn new(
        config: ApplierConfig,
        storage: Arc<dyn StorageEngine>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            config,
            storage,
            store,
            shared: Arc::new(ServiceShared {
                inner: Mutex::new((ServiceState::Idle, Session::default())),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.shared.inner.lock().0
    }

    /// Runs recovery against `reader`, then replicates from it on a
    /// dispatcher thread. No-op while already starting or running.
    pub fn start(&self, mut reader: Box<dyn LogReader>) -> Result<(), ApplierError> {
        {
            let mut guard = self.shared.inner.lock();
            loop {
                match guard.0 {
                    ServiceState::Starting | ServiceState::Running => return Ok(()),
                    ServiceState::Stopping => self.shared.changed.wait(&mut guard),
                    ServiceState::Idle | ServiceState::Stopped | ServiceState::Failed => break,
                }
            }
            guard.0 = ServiceState::Starting;
            guard.1 = Session::default();
        }

        let prepared = self.prepare(reader.as_mut());
        let (mut dispatcher, plan) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(error = %err, "applier failed to start");
                self.shared.finish(Err(err.clone()));
                return Err(err);
            }
        };
        let handle = dispatcher.handle();
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("applier-dispatcher".into())
            .spawn(move || {
                let outcome = match dispatcher.run(reader.as_mut()) {
                    Ok(summary) if summary.end_of_stream => dispatcher.drain(),
                    Ok(_) => dispatcher.stop(),
                    Err(err) => {
                        let _ = dispatcher.stop();
                        Err(err)
                    }
                };
                shared.finish(outcome);
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                let err = ApplierError::Resource(format!("failed to spawn dispatcher: {err}"));
                self.shared.finish(Err(err.clone()));
                return Err(err);
            }
        };

        let mut guard = self.shared.inner.lock();
        // The thread may already have finished a short stream.
        if guard.0 == ServiceState::Starting {
            guard.0 = ServiceState::Running;
        }
        guard.1.handle = Some(handle);
        guard.1.thread = Some(thread);
        guard.1.plan = Some(plan);
        self.shared.changed.notify_all();
        info!(channel = %self.config.channel, "applier service started");
        Ok(())
    }

    fn prepare(
        &self,
        reader: &mut dyn LogReader,
    ) -> Result<(Dispatcher, RecoveryPlan), ApplierError> {
        let mut record = self.store.load()?;
        record.adopt_committed(self.storage.worker_checkpoints());
        let plan = RecoveryScanner::scan(reader, &record)?;
        let dispatcher = Dispatcher::start(
            self.config.clone(),
            self.storage.clone(),
            self.store.clone(),
        )?
        .with_recovery(plan.clone());
        Ok((dispatcher, plan))
    }

    /// Stops replication after the in-flight groups; no-op when not running.
    pub fn stop(&self) -> Result<(), ApplierError> {
        self.finish_session(true)
    }

    /// Waits until the reader runs dry and every group has committed.
    pub fn drain(&self) -> Result<(), ApplierError> {
        self.finish_session(false)
    }

    fn finish_session(&self, stop: bool) -> Result<(), ApplierError> {
        let mut guard = self.shared.inner.lock();
        while guard.0 == ServiceState::Starting {
            self.shared.changed.wait(&mut guard);
        }
        if guard.0 == ServiceState::Idle {
            return Ok(());
        }
        if guard.0 == ServiceState::Running {
            guard.0 = ServiceState::Stopping;
            if stop {
                if let Some(handle) = &guard.1.handle {
                    handle.request_stop();
                }
            }
        }
        let thread = guard.1.thread.take();
        drop(guard);
        if let Some(thread) = thread {
            if thread.join().is_err() {
                self.shared.finish(Err(ApplierError::Resource(
                    "dispatcher thread panicked".into(),
                )));
            }
        }

        let mut guard = self.shared.inner.lock();
        while guard.0 == ServiceState::Stopping {
            self.shared.changed.wait(&mut guard);
        }
        match &guard.1.outcome {
            Some(Err(err)) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    pub fn status(&self) -> Option<PoolStatus> {
        let guard = self.shared.inner.lock();
        if let Some(Ok(status)) = &guard.1.outcome {
            return Some(status.clone());
        }
        guard.1.handle.as_ref().map(PoolHandle::status)
    }

    pub fn recovery_plan(&self) -> Option<RecoveryPlan> {
        self.shared.inner.lock().1.plan.clone()
    }

    /// Last persisted coordinator checkpoint, read from the store when idle.
    pub fn checkpoint_position(&self) -> Result<CoordinatorCheckpoint, ApplierError> {
        if let Some(handle) = &self.shared.inner.lock().1.handle {
            return Ok(handle.checkpoint_position());
        }
        Ok(self.store.load()?.coordinator)
    }
}

impl Drop for ApplierService {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
