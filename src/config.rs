use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Default number of applier workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;
/// Default per-worker job queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16_384;
/// Default group assignment queue capacity.
pub const DEFAULT_GAQ_CAPACITY: usize = 16_384;
/// Default checkpoint period in milliseconds.
pub const DEFAULT_CHECKPOINT_PERIOD_MS: u64 = 300;
/// Default number of dispatched groups between count-based checkpoints.
pub const DEFAULT_CHECKPOINT_GROUP: u64 = 512;
/// Default distinct partitions a group may touch before it is isolated.
pub const DEFAULT_MAX_PARTITIONS_PER_GROUP: usize = 16;
/// Default number of distinct partition keys tracked at once.
pub const DEFAULT_PARTITION_CAPACITY: usize = 4_096;
/// Smallest GAQ that lets the logical-clock policy make progress.
pub const MIN_GAQ_CAPACITY: usize = 2;
/// Ceiling for the retry backoff.
pub const MAX_RETRY_BACKOFF_MS: u64 = 1_000;

/// Scheduling policy selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicyKind {
    PartitionAffinity,
    #[default]
    LogicalClock,
}

impl fmt::Display for SchedulingPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingPolicyKind::PartitionAffinity => f.write_str("partition_affinity"),
            SchedulingPolicyKind::LogicalClock => f.write_str("logical_clock"),
        }
    }
}

/// Configuration handed to the dispatcher at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApplierConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub gaq_capacity: usize,
    /// Milliseconds between time-based checkpoints.
    pub checkpoint_period: u64,
    /// Dispatched groups between count-based checkpoints.
    pub checkpoint_group: u64,
    pub max_retries: u32,
    /// Base retry backoff in milliseconds, doubled per attempt.
    pub retry_backoff: u64,
    pub preserve_commit_order: bool,
    pub scheduling_policy: SchedulingPolicyKind,
    pub max_partitions_per_group: usize,
    /// Distinct partition keys the partition table can track.
    pub partition_capacity: usize,
    /// Queue occupancy percentage above which the dispatcher naps.
    pub overrun_level: u8,
    /// Queue occupancy percentage below which a worker counts as starved.
    pub underrun_level: u8,
    /// Dispatcher nap unit in microseconds, multiplied by the overrun excess.
    pub coordinator_nap: u64,
    /// Milliseconds between re-checks of the stop signal while blocked.
    pub poll_interval: u64,
    /// Name of the replication channel the pool serves.
    pub channel: String,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            gaq_capacity: DEFAULT_GAQ_CAPACITY,
            checkpoint_period: DEFAULT_CHECKPOINT_PERIOD_MS,
            checkpoint_group: DEFAULT_CHECKPOINT_GROUP,
            max_retries: 10,
            retry_backoff: 10,
            preserve_commit_order: false,
            scheduling_policy: SchedulingPolicyKind::LogicalClock,
            max_partitions_per_group: DEFAULT_MAX_PARTITIONS_PER_GROUP,
            partition_capacity: DEFAULT_PARTITION_CAPACITY,
            overrun_level: 90,
            underrun_level: 10,
            coordinator_nap: 5,
            poll_interval: 50,
            channel: String::new(),
        }
    }
}

impl ApplierConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(payload: &str) -> Result<Self, ConfigError> {
        let config: ApplierConfig =
            serde_json::from_str(payload).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let payload = fs::read_to_string(path)
            .map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
        Self::from_json_str(&payload)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::invalid("worker_count", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity", "must be at least 1"));
        }
        if self.gaq_capacity < MIN_GAQ_CAPACITY {
            return Err(ConfigError::GaqTooSmall {
                capacity: self.gaq_capacity,
                minimum: MIN_GAQ_CAPACITY,
            });
        }
        if self.overrun_level > 100 || self.underrun_level > 100 {
            return Err(ConfigError::invalid(
                "overrun_level",
                "occupancy levels are percentages (0..=100)",
            ));
        }
        if self.underrun_level >= self.overrun_level {
            return Err(ConfigError::invalid(
                "underrun_level",
                "must be below overrun_level",
            ));
        }
        if self.max_partitions_per_group == 0 {
            return Err(ConfigError::invalid(
                "max_partitions_per_group",
                "must be at least 1",
            ));
        }
        if self.partition_capacity == 0 {
            return Err(ConfigError::invalid("partition_capacity", "must be at least 1"));
        }
        if self.poll_interval == 0 {
            return Err(ConfigError::invalid("poll_interval", "must be at least 1 ms"));
        }
        if self.gaq_capacity < self.worker_count {
            warn!(
                gaq_capacity = self.gaq_capacity,
                worker_count = self.worker_count,
                "gaq capacity is below the worker count; some workers will stay idle"
            );
        }
        Ok(())
    }

    pub fn checkpoint_period(&self) -> Duration {
        Duration::from_millis(self.checkpoint_period)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let millis = self
            .retry_backoff
            .saturating_mul(1u64 << shift)
            .min(MAX_RETRY_BACKOFF_MS);
        Duration::from_millis(millis)
    }

    /// Queue occupancy at or above which a queue is in overrun.
    pub fn overrun_threshold(&self) -> usize {
        percent_of(self.queue_capacity, self.overrun_level).max(1)
    }

    /// Queue occupancy at or below which a queue is in underrun.
    pub fn underrun_threshold(&self) -> usize {
        percent_of(self.queue_capacity, self.underrun_level)
    }
}

fn percent_of(capacity: usize, percent: u8) -> usize {
    capacity.saturating_mul(percent as usize) / 100
}

/// Configuration failures; all are fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("gaq_capacity {capacity} is below the minimum of {minimum}")]
    GaqTooSmall { capacity: usize, minimum: usize },
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("failed to read configuration: {0}")]
    Io(String),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
