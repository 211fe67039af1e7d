use thiserror::Error;

use crate::model::{TaskId, TaskStatus};

/// Errors that are safe to expose to other modules
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id} cannot {action} while {status:?}")]
    InvalidState {
        id: TaskId,
        action: &'static str,
        status: TaskStatus,
    },

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}
