//! Queued request type for the priority queue manager.

use std::time::{Duration, Instant};

use serde::Serialize;

use super::error::{BoxError, SchedulerError};
use super::priority::Priority;
use super::task::{Completion, Metadata, RequestId, ResponseTx, ScheduledTask, TaskFn};

/// Lifecycle state of a request.
///
/// `Queued -> Dispatched -> {Completed | Failed -> (Retrying -> Queued)* -> DeadLettered}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Dispatched,
    Failed,
    Retrying,
    Completed,
    DeadLettered,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered)
    }
}

/// A schedulable unit of work owned by exactly one component at a time.
pub struct QueuedRequest<T> {
    pub id: RequestId,
    pub priority: Priority,
    pub tenant: String,
    pub metadata: Metadata,
    pub enqueued_at: Instant,
    pub retry_count: u32,
    /// Cause of the most recent failed attempt, if any.
    pub last_error: Option<BoxError>,
    pub(crate) execute: TaskFn<T>,
    /// Channel for sending the outcome back to the caller.
    pub(crate) response_tx: Option<ResponseTx<T>>,
}

impl<T> std::fmt::Debug for QueuedRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("tenant", &self.tenant)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

impl<T: Send + 'static> QueuedRequest<T> {
    /// Create a queued request from a validated task.
    pub(crate) fn from_task(task: ScheduledTask<T>, response_tx: Option<ResponseTx<T>>) -> Self {
        Self {
            id: task.id.unwrap_or_else(RequestId::generate),
            priority: task.priority,
            tenant: task.tenant,
            metadata: task.metadata,
            enqueued_at: Instant::now(),
            retry_count: 0,
            last_error: None,
            execute: task.execute,
            response_tx,
        }
    }

    /// Create a request without a response channel. Used for testing and benches.
    pub fn detached(task: ScheduledTask<T>) -> Self {
        Self::from_task(task, None)
    }
}

impl<T> QueuedRequest<T> {
    /// Time spent waiting since the last (re-)enqueue.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    /// Number of payload invocations so far.
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    /// Settle successfully. Consumes the request.
    pub(crate) fn complete(mut self, output: T, latency: Duration) {
        if let Some(tx) = self.response_tx.take() {
            let _ = tx.send(Ok(Completion {
                id: self.id,
                output,
                retry_count: self.retry_count,
                latency,
                metadata: self.metadata,
            }));
        }
    }

    /// Settle with an error. Consumes the request.
    pub(crate) fn reject(mut self, error: SchedulerError) {
        if let Some(tx) = self.response_tx.take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Settle a request that will never run again because the scheduler stopped.
    pub(crate) fn abandon(mut self) {
        let error = match self.last_error.take() {
            Some(source) => SchedulerError::Execution {
                attempts: self.retry_count,
                source,
            },
            None => SchedulerError::NotRunning,
        };
        self.reject(error);
    }
}

/// A request refused by the queue, handed back so its caller can be settled.
#[derive(Debug)]
pub struct Rejected<T> {
    pub reason: SchedulerError,
    pub request: QueuedRequest<T>,
}

impl<T> Rejected<T> {
    /// Deliver the rejection to the request's caller.
    pub(crate) fn settle(self) {
        self.request.reject(self.reason);
    }
}
