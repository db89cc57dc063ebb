//! Parallel apply engine for an ordered stream of replicated event groups.
//!
//! A single dispatcher assigns groups to a pool of worker threads under a
//! partition-affinity or logical-clock policy, tracks completion in the group
//! assignment queue, optionally enforces source commit order and checkpoints
//! a crash-safe low-water-mark.

pub mod app;
pub mod bitmap;
pub mod checkpoint;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod gaq;
pub mod id;
pub mod job_queue;
pub mod log_reader;
pub mod logging;
pub mod partition;
pub mod policy;
pub mod recovery;
pub mod ring;
pub mod sequencer;
pub mod service;
pub mod signal;
pub mod slab;
pub mod status;
pub mod storage;
pub mod test_hooks;
pub mod worker;

pub use bitmap::GroupBitmap;
pub use checkpoint::{
    CheckpointBase, CheckpointError, CheckpointRecord, CheckpointStore, CoordinatorCheckpoint,
    FileCheckpointStore, MemoryCheckpointStore, WorkerCheckpoint,
};
pub use config::{
    ApplierConfig, ConfigError, SchedulingPolicyKind, DEFAULT_CHECKPOINT_GROUP,
    DEFAULT_CHECKPOINT_PERIOD_MS, DEFAULT_GAQ_CAPACITY, DEFAULT_MAX_PARTITIONS_PER_GROUP,
    DEFAULT_PARTITION_CAPACITY, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKER_COUNT, MIN_GAQ_CAPACITY,
};
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherState, PoolHandle, RunSummary};
pub use error::{ApplierError, ErrorClass, ErrorState, ProtocolError};
pub use event::{ChangeRecord, EventGroup, LogicalClock, SourcePosition};
pub use gaq::{AssignedSlot, GroupAssignmentQueue, GroupRecord, Lwm, Retired};
pub use id::{ChannelId, WorkerId};
pub use job_queue::{Job, JobQueue, Occupancy, PushError};
pub use log_reader::{
    LiveLog, LiveLogFeed, LogReader, LogReaderError, LoggedGroup, MemoryLog, ReadPoll,
};
pub use logging::{
    init_tracing, JsonLineLayer, JsonLineLogger, LogEntry, LogLevel, LogRotationPolicy,
    LoggingError,
};
pub use partition::{PartitionSnapshot, PartitionTable, OVERFLOW_PARTITION};
pub use policy::{
    Assignment, ClockDecision, LogicalClockPolicy, PartitionAffinityPolicy, SchedulingContext,
    SchedulingPolicy,
};
pub use recovery::{RecoveryError, RecoveryPlan, RecoveryScanner};
pub use sequencer::{
    CommitSequencer, DeadlockVerdict, SequencerError, TicketEvent, TicketId, TicketState,
    TurnOutcome,
};
pub use service::{ApplierService, ServiceState};
pub use signal::{PoolSignal, WakeHook};
pub use status::{PoolStatus, WorkerStatus};
pub use storage::{
    CommitRecord, LockHolder, LockWaitHook, MemoryStorage, NoLockWaitHook, StorageEngine,
    StorageError, StorageSession, DEFAULT_LOCK_WAIT_TIMEOUT,
};
pub use test_hooks::{TestHook, TestHookRegistry};
pub use worker::{WorkerRunState, WorkerShared};
