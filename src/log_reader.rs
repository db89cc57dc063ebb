use crate::event::{EventGroup, SourcePosition};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Group together with the position of its last event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedGroup {
    pub position: SourcePosition,
    pub group: EventGroup,
}

impl LoggedGroup {
    pub fn new(position: SourcePosition, group: EventGroup) -> Self {
        Self { position, group }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogReaderError {
    #[error("group at {position} is not after {previous}")]
    OutOfOrder {
        position: SourcePosition,
        previous: SourcePosition,
    },
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("failed to read log: {0}")]
    Io(String),
}

/// Result of waiting a bounded time for the next group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPoll {
    Ready(LoggedGroup),
    /// Nothing arrived in time; the stream is still open.
    Idle,
    EndOfStream,
}

/// Pull interface over the upstream log, restartable from any yielded position.
pub trait LogReader: Send {
    /// Blocks until a group is available; `None` once the stream has ended.
    fn next_group(&mut self) -> Result<Option<LoggedGroup>, LogReaderError>;

    /// Waits at most `timeout` for the next group. Readers over a finite
    /// source never report [`ReadPoll::Idle`].
    fn poll_group(&mut self, timeout: Duration) -> Result<ReadPoll, LogReaderError> {
        let _ = timeout;
        Ok(match self.next_group()? {
            Some(logged) => ReadPoll::Ready(logged),
            None => ReadPoll::EndOfStream,
        })
    }

    /// Repositions the reader so the next group is the first one ending after
    /// `after`; `None` rewinds to the start.
    fn seek(&mut self, after: Option<SourcePosition>) -> Result<(), LogReaderError>;
}

/// Finite log held in memory; positions are strictly increasing.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    groups: Vec<LoggedGroup>,
    cursor: usize,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_groups(
        groups: impl IntoIterator<Item = LoggedGroup>,
    ) -> Result<Self, LogReaderError> {
        let mut log = Self::new();
        for group in groups {
            log.push(group)?;
        }
        Ok(log)
    }

    /// Parses one `{"position": .., "group": ..}` document per non-empty line.
    pub fn from_json_lines(payload: &str) -> Result<Self, LogReaderError> {
        let mut log = Self::new();
        for (index, line) in payload.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let group: LoggedGroup =
                serde_json::from_str(line).map_err(|err| LogReaderError::Parse {
                    line: index + 1,
                    reason: err.to_string(),
                })?;
            log.push(group)?;
        }
        Ok(log)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, LogReaderError> {
        let path = path.as_ref();
        let payload = fs::read_to_string(path)
            .map_err(|err| LogReaderError::Io(format!("{}: {err}", path.display())))?;
        Self::from_json_lines(&payload)
    }

    pub fn push(&mut self, group: LoggedGroup) -> Result<(), LogReaderError> {
        if let Some(last) = self.groups.last() {
            if group.position <= last.position {
                return Err(LogReaderError::OutOfOrder {
                    position: group.position,
                    previous: last.position,
                });
            }
        }
        self.groups.push(group);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[LoggedGroup] {
        &self.groups
    }
}

impl LogReader for MemoryLog {
    fn next_group(&mut self) -> Result<Option<LoggedGroup>, LogReaderError> {
        let next = self.groups.get(self.cursor).cloned();
        if next.is_some() {
            self.cursor += 1;
        }
        Ok(next)
    }

    fn seek(&mut self, after: Option<SourcePosition>) -> Result<(), LogReaderError> {
        self.cursor = match after {
            None => 0,
            Some(position) => self
                .groups
                .partition_point(|group| group.position <= position),
        };
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LiveState {
    groups: Vec<LoggedGroup>,
    closed: bool,
}

#[derive(Debug, Default)]
struct LiveShared {
    state: Mutex<LiveState>,
    appended: Condvar,
}

/// Log that grows while it is read. Readers block for new groups until the
/// feed is closed.
#[derive(Debug, Clone, Default)]
pub struct LiveLog {
    shared: Arc<LiveShared>,
    cursor: usize,
}

/// Producer side of a [`LiveLog`].
#[derive(Debug, Clone)]
pub struct LiveLogFeed {
    shared: Arc<LiveShared>,
}

impl LiveLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self) -> LiveLogFeed {
        LiveLogFeed {
            shared: self.shared.clone(),
        }
    }

    fn take(&mut self, deadline: Option<Instant>) -> ReadPoll {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(logged) = state.groups.get(self.cursor) {
                self.cursor += 1;
                return ReadPoll::Ready(logged.clone());
            }
            if state.closed {
                return ReadPoll::EndOfStream;
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.appended.wait_until(&mut state, deadline).timed_out()
                        && state.groups.len() <= self.cursor
                        && !state.closed
                    {
                        return ReadPoll::Idle;
                    }
                }
                None => self.shared.appended.wait(&mut state),
            }
        }
    }
}

impl LiveLogFeed {
    pub fn push(&self, group: LoggedGroup) -> Result<(), LogReaderError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(LogReaderError::Io("feed is closed".into()));
        }
        if let Some(last) = state.groups.last() {
            if group.position <= last.position {
                return Err(LogReaderError::OutOfOrder {
                    position: group.position,
                    previous: last.position,
                });
            }
        }
        state.groups.push(group);
        drop(state);
        self.shared.appended.notify_all();
        Ok(())
    }

    /// Ends the stream once the groups already pushed have been read.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.appended.notify_all();
    }
}

impl LogReader for LiveLog {
    fn next_group(&mut self) -> Result<Option<LoggedGroup>, LogReaderError> {
        Ok(match self.take(None) {
            ReadPoll::Ready(logged) => Some(logged),
            _ => None,
        })
    }

    fn poll_group(&mut self, timeout: Duration) -> Result<ReadPoll, LogReaderError> {
        Ok(self.take(Some(Instant::now() + timeout)))
    }

    fn seek(&mut self, after: Option<SourcePosition>) -> Result<(), LogReaderError> {
        let state = self.shared.state.lock();
        self.cursor = match after {
            None => 0,
            Some(position) => state
                .groups
                .partition_point(|group| group.position <= position),
        };
        Ok(())
    }
}
