//! Caller-facing task types: the unit of work, its id, and its outcome.
//!
//! The scheduler never looks inside a payload. Everything the gateway does
//! for a request (parsing, scanning, policy, the provider call) is packaged
//! into the payload before it is scheduled.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::error::{BoxError, SchedulerError};
use super::priority::Priority;

/// Tenant used when the caller does not name one.
pub const DEFAULT_TENANT: &str = "default";

/// Upper bound on caller-supplied id and tenant key lengths.
pub const MAX_KEY_LEN: usize = 256;

/// Unique request identifier, caller-supplied or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque metadata passed through untouched.
pub type Metadata = HashMap<String, String>;

/// A re-invocable asynchronous unit of work.
///
/// Retries call `execute` again, so implementations must be able to run
/// more than once.
#[async_trait]
pub trait Task<T>: Send + Sync {
    async fn execute(&self) -> Result<T, BoxError>;
}

/// Type-erased payload shared between the queue and dispatched workers.
pub type TaskFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync>;

/// A task submitted to `RequestScheduler::schedule`.
pub struct ScheduledTask<T> {
    pub(crate) id: Option<RequestId>,
    pub(crate) priority: Priority,
    pub(crate) tenant: String,
    pub(crate) metadata: Metadata,
    pub(crate) execute: TaskFn<T>,
}

impl<T: Send + 'static> ScheduledTask<T> {
    /// Build a task from an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let execute: TaskFn<T> = Arc::new(move || f().boxed());
        Self::from_fn(execute)
    }

    /// Build a task from a `Task` implementation.
    pub fn from_task(task: Arc<dyn Task<T>>) -> Self {
        let execute: TaskFn<T> = Arc::new(move || {
            let task = Arc::clone(&task);
            async move { task.execute().await }.boxed()
        });
        Self::from_fn(execute)
    }

    fn from_fn(execute: TaskFn<T>) -> Self {
        Self {
            id: None,
            priority: Priority::default(),
            tenant: DEFAULT_TENANT.to_string(),
            metadata: Metadata::new(),
            execute,
        }
    }

    pub fn id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Reject malformed tasks before they reach the queue.
    pub(crate) fn validate(&self) -> Result<(), SchedulerError> {
        if let Some(id) = &self.id {
            validate_key("id", id.as_str())?;
        }
        validate_key("tenant", &self.tenant)
    }
}

impl<T> fmt::Debug for ScheduledTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("tenant", &self.tenant)
            .finish()
    }
}

fn validate_key(field: &str, value: &str) -> Result<(), SchedulerError> {
    if value.trim().is_empty() {
        return Err(SchedulerError::Validation(format!("{field} must not be empty")));
    }
    if value.len() > MAX_KEY_LEN {
        return Err(SchedulerError::Validation(format!(
            "{field} exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

/// Successful settlement of a scheduled task.
#[derive(Debug)]
pub struct Completion<T> {
    pub id: RequestId,
    pub output: T,
    /// Retries consumed before the successful attempt.
    pub retry_count: u32,
    /// Wall-clock duration of the successful attempt.
    pub latency: Duration,
    pub metadata: Metadata,
}

/// Settlement delivered to the caller.
pub type TaskOutcome<T> = Result<Completion<T>, SchedulerError>;

/// Sender half kept with the queued request.
pub type ResponseTx<T> = oneshot::Sender<TaskOutcome<T>>;

/// Future returned by `schedule`; settles exactly once.
pub struct ScheduleHandle<T> {
    id: RequestId,
    rx: oneshot::Receiver<TaskOutcome<T>>,
}

impl<T> fmt::Debug for ScheduleHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<T> ScheduleHandle<T> {
    pub(crate) fn new(id: RequestId, rx: oneshot::Receiver<TaskOutcome<T>>) -> Self {
        Self { id, rx }
    }

    /// Id assigned to the scheduled request.
    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

impl<T> Future for ScheduleHandle<T> {
    type Output = TaskOutcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let received = match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(received) => received,
            Poll::Pending => return Poll::Pending,
        };
        Poll::Ready(received.unwrap_or_else(|_| {
            Err(SchedulerError::Lifecycle(format!(
                "request {} dropped without settlement",
                this.id
            )))
        }))
    }
}
