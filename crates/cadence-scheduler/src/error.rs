use thiserror::Error;

use crate::queue::QueueError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The schedule definition cannot be turned into a due-time rule.
    #[error("Invalid schedule '{name}': {reason}")]
    InvalidSchedule { name: String, reason: String },

    /// No schedule with the given name exists in the store.
    #[error("Schedule not found: {name}")]
    ScheduleNotFound { name: String },

    /// The execution layer refused or could not take the job.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// The store could not be reached or its worker failed.
    #[error("Store error: {0}")]
    Store(String),

    /// A stored JSON payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Scheduler settings rejected at construction time.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SchedulerError {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        SchedulerError::InvalidSchedule {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
