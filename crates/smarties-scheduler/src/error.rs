use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store error from the data layer, surfaced unmodified.
    #[error("Database error: {0}")]
    Db(#[from] smarties_db::DbError),

    /// The payload could not be serialized for storage.
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The schedule definition is invalid or unsupported.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
