//! Queue error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobStatus;

/// Result type used across the queue.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced to callers of the queue.
///
/// Caller/usage errors (`NotFound`, `InvalidState`, `Validation`,
/// `Unauthorized`) are never retried. `Store` wraps infrastructure failures;
/// `Timeout` never changes job state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// No record exists for the job id.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The requested operation is not a legal edge from the job's current status.
    #[error("cannot {action} job {id} while {status}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        action: &'static str,
    },

    /// `wait_for_job` deadline elapsed before the job reached a terminal status.
    #[error("timed out after {waited_ms}ms waiting for job {id}")]
    Timeout { id: JobId, waited_ms: u64 },

    /// The access guard refused the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed input (empty job type, bad identifier, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(String),

    #[error("queue is already running")]
    AlreadyRunning,

    /// The event channel was closed while waiting.
    #[error("queue is closed")]
    Closed,
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_state(id: JobId, status: JobStatus, action: &'static str) -> Self {
        Self::InvalidState { id, status, action }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }
}
