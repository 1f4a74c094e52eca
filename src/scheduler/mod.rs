//! Request scheduling for the gateway.
//!
//! Admission, prioritization, tenant fairness, submission batching, local
//! retry, and latency-driven concurrency control for asynchronous request
//! handlers.

mod adaptive;
mod batch;
mod dispatcher;
mod error;
mod priority;
mod queue;
mod queued_request;
mod retry;
mod task;

pub use adaptive::{
    AdaptiveConcurrencyController, AdaptiveConfig, ConcurrencyAdjustment, ConcurrencyState,
    LatencyWindow,
};
pub use batch::{BatchAccumulator, BatchConfig};
pub use dispatcher::{RequestScheduler, SchedulerMetrics, SchedulerStatus};
pub use error::{BoxError, SchedulerError, TaskPanicked};
pub use priority::Priority;
pub use queue::{Partitioning, PriorityQueueManager, QueueConfig, QueueMetrics};
pub use queued_request::{QueuedRequest, Rejected, RequestState};
pub use retry::RetryQueue;
pub use task::{
    Completion, Metadata, RequestId, ScheduleHandle, ScheduledTask, Task, TaskFn, TaskOutcome,
    DEFAULT_TENANT, MAX_KEY_LEN,
};
