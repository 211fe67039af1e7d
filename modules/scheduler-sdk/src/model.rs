use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Opaque task identifier assigned by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

impl IntervalUnit {
    /// `from` advanced by `every` units. Month steps clamp to the last day of
    /// the target month. `None` on overflow.
    pub fn advance(self, from: DateTime<Utc>, every: u32) -> Option<DateTime<Utc>> {
        let n = i64::from(every);
        match self {
            IntervalUnit::Minutes => from.checked_add_signed(ChronoDuration::minutes(n)),
            IntervalUnit::Hours => from.checked_add_signed(ChronoDuration::hours(n)),
            IntervalUnit::Days => from.checked_add_signed(ChronoDuration::days(n)),
            IntervalUnit::Weeks => from.checked_add_signed(ChronoDuration::weeks(n)),
            IntervalUnit::Months => from.checked_add_months(Months::new(every)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub every: u32,
    pub unit: IntervalUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// What to run. `action` is a name the owning module resolves when the task fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub name: String,
    pub owner_module: String,
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskRequest {
    pub fn new(
        name: impl Into<String>,
        owner_module: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            owner_module: owner_module.into(),
            action: action.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub owner_module: String,
    pub status: TaskStatus,
    pub recurrence: Option<Recurrence>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
}

/// Every set field must match; an empty filter matches all tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub owner_module: Option<String>,
    pub recurring: Option<bool>,
}

impl TaskFilter {
    pub fn matches(&self, task: &TaskInfo) -> bool {
        self.status.map_or(true, |s| s == task.status)
            && self
                .owner_module
                .as_deref()
                .map_or(true, |m| m == task.owner_module)
            && self
                .recurring
                .map_or(true, |r| r == task.recurrence.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Delete files older than this, e.g. `"7d"`.
    MaxAge(#[serde(with = "humantime_serde")] Duration),
    /// Keep the newest N files.
    MaxCount(usize),
    /// Delete oldest files until the total is at most this many bytes.
    MaxTotalSize(u64),
}

/// Periodic cleanup of files matching a glob `pattern` inside `directory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSpec {
    pub owner_module: String,
    pub directory: PathBuf,
    pub pattern: String,
    pub retention: RetentionPolicy,
    /// How often the cleanup runs.
    pub schedule: Recurrence,
}
