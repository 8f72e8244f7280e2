use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

/// Application-wide error types for Hermes.
#[derive(Error, Debug)]
pub enum AppError {
    /// Submitted query does not match any supported shape.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Job id is absent from the store, or its record expired.
    #[error("Job {0} not found")]
    NotFound(Uuid),

    /// Requested status change violates the transition table.
    ///
    /// The message is user-facing and surfaced verbatim.
    #[error("Cannot set status from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Job is not cancellable in its current status.
    #[error("Job cannot be cancelled in status {0}")]
    CancelNotAllowed(JobStatus),

    /// Query-content updates are only allowed while a job is pending.
    #[error("Job cannot be updated in status {0}")]
    UpdateNotAllowed(JobStatus),

    /// KV store backend failure.
    #[error("Store error: {0}")]
    StoreError(String),

    /// Tenant database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Statement hit its server-side timeout.
    ///
    /// Rendered as a fixed, non-leaking failure reason.
    #[error("Query execution was timed out")]
    StatementTimeout,

    /// Statement was stopped by a backend-cancel signal.
    #[error("Query execution was cancelled")]
    QueryCancelled,

    /// Configuration error (missing or malformed settings).
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl AppError {
    /// Returns true if this error means the statement stopped on an
    /// external signal rather than a genuine SQL failure.
    ///
    /// The runner uses this to avoid overwriting a status the canceller
    /// already persisted.
    pub fn is_cancel_signal(&self) -> bool {
        matches!(self, AppError::QueryCancelled)
    }
}
