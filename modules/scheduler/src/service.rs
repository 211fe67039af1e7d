//! In-memory task table behind [`SchedulerApi`].
//!
//! Tasks fire from [`Scheduler::run_due`], which the module's tick loop calls.
//! Action tasks are recorded in a bounded run history; cleanup tasks apply their
//! retention policy to the matching files when they fire.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use glob::Pattern;
use parking_lot::Mutex;
use scheduler_sdk::{
    CleanupSpec, IntervalUnit, Recurrence, RetentionPolicy, SchedulerApi, SchedulerError,
    TaskFilter, TaskId, TaskInfo, TaskRequest, TaskStatus,
};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Action name recorded for cleanup runs.
pub const CLEANUP_ACTION: &str = "cleanup";

#[derive(Clone)]
enum Work {
    Action {
        action: String,
        payload: serde_json::Value,
    },
    Cleanup {
        directory: PathBuf,
        pattern: Pattern,
        retention: RetentionPolicy,
    },
}

struct Task {
    info: TaskInfo,
    work: Work,
}

/// One fired task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRun {
    pub id: TaskId,
    pub owner_module: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
    /// Files deleted by a cleanup run; empty for action tasks.
    pub removed: Vec<PathBuf>,
}

pub struct Scheduler {
    tasks: Mutex<BTreeMap<TaskId, Task>>,
    history: Mutex<VecDeque<TaskRun>>,
    history_limit: usize,
    next_id: AtomicU64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Scheduler {
    pub fn new(history_limit: usize) -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit,
            next_id: AtomicU64::new(1),
        }
    }

    /// Oldest first.
    pub fn recent_runs(&self) -> Vec<TaskRun> {
        self.history.lock().iter().cloned().collect()
    }

    /// Fire every scheduled task whose `next_run` is at or before `now`.
    /// Returns the fired ids in id order.
    pub fn run_due(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let due: Vec<TaskId> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.info.status == TaskStatus::Scheduled)
            .filter(|t| t.info.next_run.is_some_and(|at| at <= now))
            .map(|t| t.info.id.clone())
            .collect();

        due.into_iter()
            .filter(|id| self.fire(id, now, true).is_ok())
            .collect()
    }

    fn insert(
        &self,
        name: String,
        owner_module: String,
        next_run: Option<DateTime<Utc>>,
        recurrence: Option<Recurrence>,
        work: Work,
    ) -> TaskId {
        let id = TaskId(format!("task-{}", self.next_id.fetch_add(1, Ordering::Relaxed)));
        tracing::debug!(task = %id, name = %name, owner = %owner_module, next_run = ?next_run, "task scheduled");
        self.tasks.lock().insert(
            id.clone(),
            Task {
                info: TaskInfo {
                    id: id.clone(),
                    name,
                    owner_module,
                    status: TaskStatus::Scheduled,
                    recurrence,
                    next_run,
                    last_run: None,
                },
                work,
            },
        );
        id
    }

    fn transition(
        &self,
        id: &TaskId,
        action: &'static str,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
        if !from.contains(&task.info.status) {
            return Err(SchedulerError::InvalidState {
                id: id.clone(),
                action,
                status: task.info.status,
            });
        }
        task.info.status = to;
        if to == TaskStatus::Cancelled {
            task.info.next_run = None;
        }
        Ok(())
    }

    /// Run one task. With `advance`, the schedule moves on: one-shot tasks
    /// complete, recurring ones get their next slot after `now`.
    fn fire(&self, id: &TaskId, now: DateTime<Utc>, advance: bool) -> Result<(), SchedulerError> {
        let (owner_module, work) = {
            let mut tasks = self.tasks.lock();
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
            if task.info.status.is_terminal() {
                return Err(SchedulerError::InvalidState {
                    id: id.clone(),
                    action: "execute",
                    status: task.info.status,
                });
            }
            task.info.last_run = Some(now);
            if advance {
                match task.info.recurrence {
                    Some(r) => task.info.next_run = next_slot(task.info.next_run, r, now),
                    None => {
                        task.info.status = TaskStatus::Completed;
                        task.info.next_run = None;
                    }
                }
            }
            (task.info.owner_module.clone(), task.work.clone())
        };

        let run = match work {
            Work::Action { action, payload } => {
                tracing::info!(task = %id, owner = %owner_module, action = %action, "task fired");
                TaskRun {
                    id: id.clone(),
                    owner_module,
                    action,
                    payload,
                    at: now,
                    removed: Vec::new(),
                }
            }
            Work::Cleanup {
                directory,
                pattern,
                retention,
            } => {
                let removed = match apply_retention(&directory, &pattern, &retention, SystemTime::now()) {
                    Ok(removed) => removed,
                    Err(e) => {
                        tracing::warn!(task = %id, dir = %directory.display(), error = %e, "cleanup failed");
                        Vec::new()
                    }
                };
                tracing::info!(task = %id, owner = %owner_module, removed = removed.len(), "cleanup ran");
                TaskRun {
                    id: id.clone(),
                    owner_module,
                    action: CLEANUP_ACTION.to_string(),
                    payload: serde_json::Value::Null,
                    at: now,
                    removed,
                }
            }
        };

        let mut history = self.history.lock();
        history.push_back(run);
        while history.len() > self.history_limit {
            history.pop_front();
        }
        Ok(())
    }
}

/// First slot on the `r` grid after `now`, starting from the previous slot.
/// Missed slots are skipped rather than replayed.
fn next_slot(
    prev: Option<DateTime<Utc>>,
    r: Recurrence,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut at = r.unit.advance(prev.unwrap_or(now), r.every)?;
    while at <= now {
        at = r.unit.advance(at, r.every)?;
    }
    Some(at)
}

/// Delete files in `dir` whose names match `pattern` and fall outside `retention`.
/// Newer files (by modification time) are kept first. A missing directory is
/// nothing to clean.
pub fn apply_retention(
    dir: &Path,
    pattern: &Pattern,
    retention: &RetentionPolicy,
    now: SystemTime,
) -> std::io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() || !pattern.matches(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((entry.path(), modified, meta.len()));
    }
    files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let doomed: Vec<PathBuf> = match retention {
        RetentionPolicy::MaxAge(age) => files
            .into_iter()
            .filter(|(_, modified, _)| now.duration_since(*modified).is_ok_and(|d| d > *age))
            .map(|(path, _, _)| path)
            .collect(),
        RetentionPolicy::MaxCount(keep) => files.into_iter().skip(*keep).map(|(path, _, _)| path).collect(),
        RetentionPolicy::MaxTotalSize(limit) => {
            let mut total = 0u64;
            files
                .into_iter()
                .filter(|(_, _, len)| {
                    total = total.saturating_add(*len);
                    total > *limit
                })
                .map(|(path, _, _)| path)
                .collect()
        }
    };

    let mut removed = Vec::new();
    for path in doomed {
        match std::fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "cleanup could not remove file"),
        }
    }
    Ok(removed)
}

#[async_trait]
impl SchedulerApi for Scheduler {
    async fn schedule_at(&self, task: TaskRequest, at: DateTime<Utc>) -> Result<TaskId, SchedulerError> {
        Ok(self.insert(
            task.name,
            task.owner_module,
            Some(at),
            None,
            Work::Action {
                action: task.action,
                payload: task.payload,
            },
        ))
    }

    async fn schedule_recurring(
        &self,
        task: TaskRequest,
        every: u32,
        unit: IntervalUnit,
        start_at: Option<DateTime<Utc>>,
    ) -> Result<TaskId, SchedulerError> {
        if every == 0 {
            return Err(SchedulerError::InvalidSchedule("interval must be positive".into()));
        }
        let first = match start_at {
            Some(t) => t,
            None => unit
                .advance(Utc::now(), every)
                .ok_or_else(|| SchedulerError::InvalidSchedule("interval overflows".into()))?,
        };
        Ok(self.insert(
            task.name,
            task.owner_module,
            Some(first),
            Some(Recurrence { every, unit }),
            Work::Action {
                action: task.action,
                payload: task.payload,
            },
        ))
    }

    async fn cancel(&self, id: &TaskId) -> Result<(), SchedulerError> {
        self.transition(
            id,
            "cancel",
            &[TaskStatus::Scheduled, TaskStatus::Paused],
            TaskStatus::Cancelled,
        )
    }

    async fn pause(&self, id: &TaskId) -> Result<(), SchedulerError> {
        self.transition(id, "pause", &[TaskStatus::Scheduled], TaskStatus::Paused)
    }

    async fn resume(&self, id: &TaskId) -> Result<(), SchedulerError> {
        self.transition(id, "resume", &[TaskStatus::Paused], TaskStatus::Scheduled)
    }

    async fn execute_now(&self, id: &TaskId) -> Result<(), SchedulerError> {
        self.fire(id, Utc::now(), false)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskInfo>, SchedulerError> {
        Ok(self
            .tasks
            .lock()
            .values()
            .map(|t| &t.info)
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn register_cleanup(&self, spec: CleanupSpec) -> Result<TaskId, SchedulerError> {
        let CleanupSpec {
            owner_module,
            directory,
            pattern,
            retention,
            schedule,
        } = spec;
        if schedule.every == 0 {
            return Err(SchedulerError::InvalidSchedule("interval must be positive".into()));
        }
        let compiled = Pattern::new(&pattern)
            .map_err(|e| SchedulerError::InvalidSchedule(format!("pattern '{pattern}': {e}")))?;
        let first = schedule
            .unit
            .advance(Utc::now(), schedule.every)
            .ok_or_else(|| SchedulerError::InvalidSchedule("interval overflows".into()))?;

        Ok(self.insert(
            format!("cleanup:{}/{}", directory.display(), pattern),
            owner_module,
            Some(first),
            Some(schedule),
            Work::Cleanup {
                directory,
                pattern: compiled,
                retention,
            },
        ))
    }
}
