//! Scheduler service contract.
//!
//! Interface, models and errors only; the scheduler implementation lives in its own
//! module and publishes itself under [`SCHEDULER_SERVICE`]:
//!
//! ```rust,ignore
//! ctx.register_service::<dyn SchedulerApi>(SCHEDULER_SERVICE, Arc::new(MyScheduler::new()))?;
//! ```
//!
//! Consumers resolve it in their phase-2 setup hook with [`scheduler`].

pub mod api;
pub mod error;
pub mod model;

pub use api::{scheduler, SchedulerApi, SCHEDULER_SERVICE};
pub use error::SchedulerError;
pub use model::{
    CleanupSpec, IntervalUnit, Recurrence, RetentionPolicy, TaskFilter, TaskId, TaskInfo,
    TaskRequest, TaskStatus,
};
