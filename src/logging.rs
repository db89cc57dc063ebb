use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as fmt_layer, EnvFilter};

/// Severity levels accepted by the JSON-line logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the canonical uppercase representation.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&Level> for LogLevel {
    fn from(level: &Level) -> Self {
        if *level == Level::ERROR {
            LogLevel::Error
        } else if *level == Level::WARN {
            LogLevel::Warn
        } else if *level == Level::INFO {
            LogLevel::Info
        } else if *level == Level::DEBUG {
            LogLevel::Debug
        } else {
            LogLevel::Trace
        }
    }
}

/// Rotation policy for the in-memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: usize,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 1 << 20,
            max_files: 4,
        }
    }
}

/// Accumulated log lines for a rotated segment.
#[derive(Debug, Default, Clone)]
pub struct LogFile {
    lines: Vec<String>,
    bytes_written: usize,
}

impl LogFile {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

/// One structured entry: which worker, which group, what happened.
#[derive(Debug, Clone, Copy)]
pub struct LogEntry<'a> {
    pub ts_ms: u64,
    pub level: LogLevel,
    pub target: &'a str,
    pub worker: Option<&'a str>,
    pub group: Option<&'a str>,
    pub message: &'a str,
}

/// JSON-line logger with deterministic rotation.
#[derive(Debug, Clone)]
pub struct JsonLineLogger {
    policy: LogRotationPolicy,
    current_level: LogLevel,
    files: VecDeque<LogFile>,
    active: LogFile,
}

impl JsonLineLogger {
    pub fn new(policy: LogRotationPolicy) -> Self {
        Self {
            policy,
            current_level: LogLevel::Info,
            files: VecDeque::new(),
            active: LogFile::default(),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.current_level
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.current_level = level;
    }

    /// Appends one entry unless it is below the current level.
    pub fn log(&mut self, entry: LogEntry<'_>) -> Result<(), LoggingError> {
        if entry.level < self.current_level {
            return Ok(());
        }
        let record = LogRecord {
            ts: entry.ts_ms,
            level: entry.level.as_str(),
            target: entry.target,
            worker: entry.worker,
            group: entry.group,
            message: entry.message,
        };
        let line = serde_json::to_string(&record).map_err(LoggingError::Serialize)?;
        self.rotate_if_needed(line.len());
        self.active.bytes_written = self.active.bytes_written.saturating_add(line.len());
        self.active.lines.push(line);
        Ok(())
    }

    /// Rotated history followed by the active segment.
    pub fn files(&self) -> impl Iterator<Item = &LogFile> {
        self.files.iter().chain(std::iter::once(&self.active))
    }

    pub fn lines(&self) -> Vec<String> {
        self.files()
            .flat_map(|file| file.lines().iter().cloned())
            .collect()
    }

    fn rotate_if_needed(&mut self, next_line_len: usize) {
        if self.active.bytes_written + next_line_len <= self.policy.max_bytes {
            return;
        }
        if !self.active.lines.is_empty() {
            self.files.push_back(std::mem::take(&mut self.active));
            while self.files.len() > self.policy.max_files {
                self.files.pop_front();
            }
        }
        self.active = LogFile::default();
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to serialize log record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    ts: u64,
    level: &'a str,
    target: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<&'a str>,
    message: &'a str,
}

/// `tracing` layer feeding every event into a shared [`JsonLineLogger`].
#[derive(Debug, Clone)]
pub struct JsonLineLayer {
    logger: Arc<Mutex<JsonLineLogger>>,
}

impl JsonLineLayer {
    pub fn new(logger: Arc<Mutex<JsonLineLogger>>) -> Self {
        Self { logger }
    }

    pub fn logger(&self) -> &Arc<Mutex<JsonLineLogger>> {
        &self.logger
    }
}

#[derive(Default)]
struct EventFields {
    message: Option<String>,
    worker: Option<String>,
    group: Option<String>,
}

impl EventFields {
    fn store(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "worker" => self.worker = Some(value),
            "group" => self.group = Some(value),
            _ => {}
        }
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.store(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.store(field, format!("{value:?}"));
    }
}

impl<S> Layer<S> for JsonLineLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        event.record(&mut fields);
        let metadata = event.metadata();
        let entry = LogEntry {
            ts_ms: now_ms(),
            level: LogLevel::from(metadata.level()),
            target: metadata.target(),
            worker: fields.worker.as_deref(),
            group: fields.group.as_deref(),
            message: fields.message.as_deref().unwrap_or_default(),
        };
        // A record that fails to serialize is dropped; logging never fails the caller.
        let _ = self.logger.lock().log(entry);
    }
}

/// Installs the process-wide subscriber: human-readable lines on stderr
/// filtered by `RUST_LOG` (default `info`), plus an optional JSON-line sink.
pub fn init_tracing(json: Option<JsonLineLayer>) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer::layer().with_writer(std::io::stderr))
        .with(json)
        .try_init()
        .map_err(|err| LoggingError::Install(err.to_string()))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
