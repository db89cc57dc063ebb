//! Event groups delivered by the log reader and the coordinates attached to them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Coordinates of a group end inside the upstream log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct SourcePosition {
    /// Log file sequence.
    pub log_index: u64,
    /// Byte offset inside the log file.
    pub offset: u64,
}

impl SourcePosition {
    pub const fn new(log_index: u64, offset: u64) -> Self {
        Self { log_index, offset }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_index, self.offset)
    }
}

/// `(sequence_number, commit_parent)` pair stamped on a group by the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogicalClock {
    #[serde(default)]
    pub sequence_number: Option<u64>,
    #[serde(default)]
    pub commit_parent: Option<u64>,
}

impl LogicalClock {
    pub const fn new(sequence_number: Option<u64>, commit_parent: Option<u64>) -> Self {
        Self {
            sequence_number,
            commit_parent,
        }
    }

    pub const fn undefined() -> Self {
        Self {
            sequence_number: None,
            commit_parent: None,
        }
    }
}

/// Single row change inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Resource the change targets (the partition key source).
    pub partition: String,
    /// Row identity inside the partition; used for row locking.
    pub key: String,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl ChangeRecord {
    pub fn new(
        partition: impl Into<String>,
        key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            partition: partition.into(),
            key: key.into(),
            payload: payload.into(),
        }
    }

    /// Lock identity of the row this record touches.
    pub fn lock_key(&self) -> String {
        format!("{}/{}", self.partition, self.key)
    }
}

/// Ordered set of changes that must be applied atomically.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventGroup {
    /// Upstream transaction identifier.
    pub id: String,
    #[serde(default)]
    pub records: Vec<ChangeRecord>,
    #[serde(default)]
    pub clock: LogicalClock,
    /// Temporary session objects created by the group, keyed by partition.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub temporaries: BTreeMap<String, Vec<String>>,
}

impl EventGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_record(
        mut self,
        partition: impl Into<String>,
        key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        self.records.push(ChangeRecord::new(partition, key, payload));
        self
    }

    pub fn with_clock(mut self, sequence_number: Option<u64>, commit_parent: Option<u64>) -> Self {
        self.clock = LogicalClock::new(sequence_number, commit_parent);
        self
    }

    pub fn with_temporary(mut self, partition: impl Into<String>, name: impl Into<String>) -> Self {
        self.temporaries
            .entry(partition.into())
            .or_default()
            .push(name.into());
        self
    }

    pub fn sequence_number(&self) -> Option<u64> {
        self.clock.sequence_number
    }

    pub fn commit_parent(&self) -> Option<u64> {
        self.clock.commit_parent
    }

    /// Distinct partitions touched by the group, in first-reference order.
    pub fn partitions(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        let declared = self
            .records
            .iter()
            .map(|record| record.partition.as_str())
            .chain(self.temporaries.keys().map(String::as_str));
        for partition in declared {
            if !seen.contains(&partition) {
                seen.push(partition);
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
