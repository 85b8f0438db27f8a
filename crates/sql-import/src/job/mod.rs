//! Import jobs: state, log, persistence and execution.

mod executor;
mod guard;
mod store;

pub use executor::ImportJobExecutor;
pub use guard::{MappingLease, MappingLeases};
pub use store::{FileJobStore, JobStore, MemoryJobStore};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::core::KeyValue;
use crate::mapping::MappingSnapshot;

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Draft,
    Running,
    Done,
    Error,
    Cancelled,
}

impl JobState {
    /// Whether `action_retry` may resume from this state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobState::Error | JobState::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Draft => f.write_str("draft"),
            JobState::Running => f.write_str("running"),
            JobState::Done => f.write_str("done"),
            JobState::Error => f.write_str("error"),
            JobState::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Severity of a job log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => f.write_str("INFO"),
            LogLevel::Warning => f.write_str("WARNING"),
            LogLevel::Error => f.write_str("ERROR"),
        }
    }
}

/// One entry of a job's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLogLine {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for JobLogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] [{}] {}",
            self.at.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// One execution of a mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: String,

    /// Display name, `Import Job - <timestamp>`.
    pub name: String,

    /// Name of the mapping this job executes.
    pub mapping: String,

    /// Mapping configuration captured at start.
    pub snapshot: Option<MappingSnapshot>,

    pub state: JobState,

    /// Rows matching the filter when the job first started.
    pub total_records: u64,
    pub imported_records: u64,
    pub failed_records: u64,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Column ordering the keyset read.
    pub key_column: Option<String>,

    /// Highest key that existed at first start; rows above it are not read.
    pub upto_key: Option<KeyValue>,

    /// Key of the last row written successfully.
    pub cursor: Option<KeyValue>,

    /// Rows that failed after `cursor`; they are read again on retry.
    #[serde(default)]
    pub failed_since_cursor: u64,

    /// Append-only log.
    pub log: Vec<JobLogLine>,

    /// Most specific single-line cause, set only in the error state.
    pub error_message: Option<String>,

    /// HMAC-SHA256 of the persisted form, keyed by the snapshot hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl Job {
    /// Create a draft job for a mapping.
    pub fn new(mapping: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: format!("Import Job - {}", now.format("%Y-%m-%d %H:%M:%S")),
            mapping: mapping.into(),
            snapshot: None,
            state: JobState::Draft,
            total_records: 0,
            imported_records: 0,
            failed_records: 0,
            created_at: now,
            started_at: None,
            ended_at: None,
            key_column: None,
            upto_key: None,
            cursor: None,
            failed_since_cursor: 0,
            log: Vec::new(),
            error_message: None,
            hmac: None,
        }
    }

    /// Rows imported or failed so far.
    pub fn processed(&self) -> u64 {
        self.imported_records + self.failed_records
    }

    /// Percent of rows processed, 0 when the total is unknown or zero.
    pub fn progress(&self) -> f64 {
        if self.total_records == 0 {
            return 0.0;
        }
        self.processed() as f64 / self.total_records as f64 * 100.0
    }

    /// Time between start and end, once the job has ended.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Append a log line and emit it through `tracing`.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!(job = %self.id, mapping = %self.mapping, "{}", message),
            LogLevel::Warning => warn!(job = %self.id, mapping = %self.mapping, "{}", message),
            LogLevel::Error => error!(job = %self.id, mapping = %self.mapping, "{}", message),
        }
        self.log.push(JobLogLine {
            at: Utc::now(),
            level,
            message,
        });
    }

    /// Log as text, one line per entry.
    pub fn log_text(&self) -> String {
        self.log
            .iter()
            .map(|line| format!("{}\n", line))
            .collect()
    }

    /// Count a written row and advance the cursor past it.
    pub fn record_success(&mut self, key: KeyValue) {
        self.imported_records += 1;
        self.cursor = Some(key);
        self.failed_since_cursor = 0;
        self.keep_total_bound();
    }

    /// Count a failed row.
    pub fn record_failure(&mut self) {
        self.failed_records += 1;
        self.failed_since_cursor += 1;
        self.keep_total_bound();
    }

    /// Forget failures after the cursor so a retry reads those rows again.
    pub fn requeue_trailing_failures(&mut self) -> u64 {
        let requeued = self.failed_since_cursor;
        self.failed_records -= requeued.min(self.failed_records);
        self.failed_since_cursor = 0;
        requeued
    }

    fn keep_total_bound(&mut self) {
        if self.processed() > self.total_records {
            self.total_records = self.processed();
        }
    }

    /// One-line status for listings.
    pub fn summary_line(&self) -> String {
        format!(
            "{}  {}  {:<9}  {}/{} imported, {} failed ({:.1}%)",
            self.id,
            self.mapping,
            self.state.to_string(),
            self.imported_records,
            self.total_records,
            self.failed_records,
            self.progress()
        )
    }
}
