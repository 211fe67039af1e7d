use async_trait::async_trait;
use chrono::{DateTime, Utc};
use modkit::{ModuleCtx, ServiceUnavailable};
use std::sync::Arc;

use crate::error::SchedulerError;
use crate::model::{CleanupSpec, IntervalUnit, TaskFilter, TaskId, TaskInfo, TaskRequest};

/// Registry name the scheduler publishes itself under.
pub const SCHEDULER_SERVICE: &str = "scheduler_service";

/// Public API of the scheduler service that other modules can use.
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    /// Run `task` once at `at`.
    async fn schedule_at(&self, task: TaskRequest, at: DateTime<Utc>) -> Result<TaskId, SchedulerError>;

    /// Run `task` every `every` `unit`s, first at `start_at` (or one interval from now).
    async fn schedule_recurring(
        &self,
        task: TaskRequest,
        every: u32,
        unit: IntervalUnit,
        start_at: Option<DateTime<Utc>>,
    ) -> Result<TaskId, SchedulerError>;

    async fn cancel(&self, id: &TaskId) -> Result<(), SchedulerError>;

    async fn pause(&self, id: &TaskId) -> Result<(), SchedulerError>;

    async fn resume(&self, id: &TaskId) -> Result<(), SchedulerError>;

    /// Trigger an immediate run without changing the schedule.
    async fn execute_now(&self, id: &TaskId) -> Result<(), SchedulerError>;

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskInfo>, SchedulerError>;

    /// Register a recurring file cleanup job.
    async fn register_cleanup(&self, spec: CleanupSpec) -> Result<TaskId, SchedulerError>;
}

/// Resolve the scheduler from the service registry.
pub fn scheduler(ctx: &ModuleCtx) -> Result<Arc<dyn SchedulerApi>, ServiceUnavailable> {
    ctx.require_service::<dyn SchedulerApi>(SCHEDULER_SERVICE)
}
