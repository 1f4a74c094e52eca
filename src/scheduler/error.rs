//! Scheduler error types.
//!
//! Rejections (validation, backpressure, lifecycle) are never retried.
//! Payload failures are retried locally and only surface once exhausted.

use thiserror::Error;

use super::priority::Priority;

/// Boxed error returned by task payloads.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the scheduler to callers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid task: {0}")]
    Validation(String),

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Queue full for tenant {tenant} at {priority} priority ({depth} pending)")]
    QueueFull {
        priority: Priority,
        tenant: String,
        depth: usize,
    },

    #[error("Task failed after {attempts} attempt(s): {source}")]
    Execution {
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("Lifecycle violation: {0}")]
    Lifecycle(String),

    #[error("Request cancelled before dispatch")]
    Cancelled,
}

impl SchedulerError {
    /// Returns true if the request was refused before it ever ran.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotRunning | Self::QueueFull { .. }
        )
    }

    /// Number of payload invocations behind this error, if any ran.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Execution { attempts, .. } | Self::RetriesExhausted { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }
}

/// Payload panic converted into an ordinary task failure.
#[derive(Debug, Error)]
#[error("task panicked: {0}")]
pub struct TaskPanicked(pub String);
