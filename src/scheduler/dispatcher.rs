//! Request scheduler: lifecycle, dispatch loop, and retry policy.
//!
//! One dispatch loop makes every admission decision. Each dequeued request
//! runs as its own tokio task; the loop never waits on it. The loop sleeps
//! until work is enqueued, a slot frees up, a backoff deadline passes, or
//! the idle safety net fires.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::adaptive::{
    AdaptiveConcurrencyController, AdaptiveConfig, ConcurrencyAdjustment, ConcurrencyState,
};
use super::batch::{BatchAccumulator, BatchConfig};
use super::error::{BoxError, SchedulerError, TaskPanicked};
use super::queue::{PriorityQueueManager, QueueMetrics};
use super::queued_request::{QueuedRequest, RequestState};
use super::retry::RetryQueue;
use super::task::{RequestId, ScheduleHandle, ScheduledTask, TaskFn};
use crate::config::{ConfigError, SchedulerConfig, Strategy};
use crate::shutdown::{DrainResult, InFlightTracker, LifecycleState};
use crate::telemetry::{names, FacadeSink, MetricsSink, RequestSpan, SpanExt};

/// Scheduler-wide metrics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    pub queue: QueueMetrics,
    pub in_flight: usize,
    pub current_concurrency: usize,
    pub average_latency_ms: Option<f64>,
    pub pending_retries: usize,
    pub buffered: usize,
    pub batches_flushed: u64,
}

/// Lightweight status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: LifecycleState,
    pub strategy: Strategy,
    pub current_concurrency: usize,
    pub max_concurrency: usize,
    pub queue_size: usize,
    pub in_flight: usize,
}

struct Running {
    shutdown: CancellationToken,
    dispatch: JoinHandle<()>,
    adaptive: Option<JoinHandle<()>>,
}

struct Inner<T> {
    config: SchedulerConfig,
    queue: Arc<PriorityQueueManager<T>>,
    concurrency: Arc<ConcurrencyState>,
    controller: Arc<AdaptiveConcurrencyController>,
    batcher: Option<Arc<BatchAccumulator<T>>>,
    retries: Mutex<RetryQueue<T>>,
    in_flight: InFlightTracker,
    wake: Arc<Notify>,
    state: RwLock<LifecycleState>,
    metrics: Arc<dyn MetricsSink>,
}

/// Priority- and tenant-aware scheduler with adaptive concurrency.
pub struct RequestScheduler<T> {
    inner: Arc<Inner<T>>,
    running: Mutex<Option<Running>>,
}

impl<T: Send + 'static> RequestScheduler<T> {
    /// Build a scheduler that reports through the `metrics` facade.
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        Self::with_metrics(config, Arc::new(FacadeSink))
    }

    /// Build a scheduler with an injected metrics sink.
    pub fn with_metrics(
        config: SchedulerConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let wake = Arc::new(Notify::new());
        let queue = Arc::new(PriorityQueueManager::new(
            config.queue_config(),
            Arc::clone(&wake),
            Arc::clone(&metrics),
        ));
        let concurrency = Arc::new(ConcurrencyState::new(
            config.starting_concurrency(),
            config.min_concurrency,
            config.max_concurrency,
            config.latency_window,
        ));
        let controller = Arc::new(AdaptiveConcurrencyController::new(
            AdaptiveConfig {
                target_latency: config.target_latency(),
                interval: config.adaptive_interval(),
                step: config.concurrency_step,
                channel_capacity: config.adjustment_channel_capacity,
            },
            Arc::clone(&concurrency),
            Arc::clone(&metrics),
        )
        .with_wake(Arc::clone(&wake)));
        let batcher = config.enable_batching.then(|| {
            Arc::new(BatchAccumulator::new(
                BatchConfig {
                    batch_size: config.batch_size,
                    batch_timeout: config.batch_timeout(),
                },
                Arc::clone(&queue),
                Arc::clone(&metrics),
            ))
        });

        Ok(Self {
            inner: Arc::new(Inner {
                queue,
                concurrency,
                controller,
                batcher,
                retries: Mutex::new(RetryQueue::new()),
                in_flight: InFlightTracker::new(Arc::clone(&wake)),
                wake,
                state: RwLock::new(LifecycleState::Stopped),
                metrics,
                config,
            }),
            running: Mutex::new(None),
        })
    }

    /// Start the dispatch loop (and the adaptive controller for the
    /// adaptive strategy). A no-op while already running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            tracing::info!("scheduler already running");
            return;
        }
        {
            let mut state = self.inner.state.write();
            if *state == LifecycleState::Draining {
                tracing::warn!("scheduler is still draining; start ignored");
                return;
            }
            *state = LifecycleState::Running;
        }

        let shutdown = CancellationToken::new();
        let dispatch = tokio::spawn(dispatch_loop(Arc::clone(&self.inner), shutdown.clone()));
        let adaptive = (self.inner.config.strategy == Strategy::Adaptive)
            .then(|| Arc::clone(&self.inner.controller).spawn(shutdown.clone()));

        self.inner
            .metrics
            .set_gauge(names::CONCURRENCY_LIMIT, self.inner.concurrency.current() as f64);
        tracing::info!(
            strategy = %self.inner.config.strategy,
            concurrency = self.inner.concurrency.current(),
            "scheduler started"
        );
        *running = Some(Running {
            shutdown,
            dispatch,
            adaptive,
        });
    }

    /// Stop admitting and dispatching, settle everything that has not run,
    /// and wait for in-flight tasks up to the configured drain timeout.
    /// In-flight tasks are never aborted.
    pub async fn stop(&self) -> DrainResult {
        let running = self.running.lock().take();
        let Some(running) = running else {
            tracing::debug!("scheduler not running; stop ignored");
            return DrainResult::Complete;
        };
        *self.inner.state.write() = LifecycleState::Draining;
        running.shutdown.cancel();

        if let Some(batcher) = &self.inner.batcher {
            for request in batcher.shutdown() {
                request.abandon();
            }
        }
        if let Err(e) = running.dispatch.await {
            tracing::error!(error = %e, "dispatch loop ended abnormally");
        }
        if let Some(adaptive) = running.adaptive {
            if let Err(e) = adaptive.await {
                tracing::error!(error = %e, "adaptive controller ended abnormally");
            }
        }

        let queued = self.inner.queue.cleanup();
        let backing_off = self.inner.retries.lock().drain();
        let abandoned = queued.len() + backing_off.len();
        for request in queued {
            request.abandon();
        }
        for request in backing_off {
            self.inner.queue.forget(&request.id);
            request.abandon();
        }

        let result = self
            .inner
            .in_flight
            .wait_for_drain(self.inner.config.drain_timeout())
            .await;
        *self.inner.state.write() = LifecycleState::Stopped;
        tracing::info!(abandoned, result = ?result, "scheduler stopped");
        result
    }

    /// Submit a task. Fails fast when stopped, when the task is malformed,
    /// or when its partition is full; otherwise the handle settles exactly
    /// once with the task's outcome.
    pub fn schedule(&self, task: ScheduledTask<T>) -> Result<ScheduleHandle<T>, SchedulerError> {
        // Held through admission so stop() cannot drain between check and enqueue.
        let state = self.inner.state.read();
        if *state != LifecycleState::Running {
            return Err(SchedulerError::NotRunning);
        }
        task.validate()?;
        if let Some(id) = &task.id {
            if let Some(existing) = self.inner.queue.state(id) {
                return Err(SchedulerError::Validation(format!(
                    "request {id} is already {existing:?}"
                )));
            }
        }

        let (tx, rx) = oneshot::channel();
        let request = QueuedRequest::from_task(task, Some(tx));
        let handle = ScheduleHandle::new(request.id.clone(), rx);
        match &self.inner.batcher {
            Some(batcher) => batcher.push(request),
            None => {
                self.inner.queue.enqueue(request).map_err(|r| r.reason)?;
            }
        }
        drop(state);
        Ok(handle)
    }

    /// Withdraw a request that is still queued. Its handle settles with
    /// `Cancelled`. Dispatched requests are not affected.
    pub fn cancel(&self, id: &RequestId) -> bool {
        match self.inner.queue.cancel(id) {
            Some(request) => {
                request.reject(SchedulerError::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        let inner = &self.inner;
        SchedulerMetrics {
            queue: inner.queue.metrics(),
            in_flight: inner.in_flight.count(),
            current_concurrency: inner.concurrency.current(),
            average_latency_ms: inner
                .concurrency
                .average_latency()
                .map(|d| d.as_secs_f64() * 1000.0),
            pending_retries: inner.retries.lock().len(),
            buffered: inner.batcher.as_ref().map_or(0, |b| b.buffered()),
            batches_flushed: inner.batcher.as_ref().map_or(0, |b| b.flushed_batches()),
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let inner = &self.inner;
        SchedulerStatus {
            state: *inner.state.read(),
            strategy: inner.config.strategy,
            current_concurrency: inner.concurrency.current(),
            max_concurrency: inner.config.max_concurrency,
            queue_size: inner.queue.len(),
            in_flight: inner.in_flight.count(),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.inner.state.read() == LifecycleState::Running
    }

    /// Lifecycle state of a live request.
    pub fn request_state(&self, id: &RequestId) -> Option<RequestState> {
        self.inner.queue.state(id)
    }

    /// Receive concurrency adjustments made by the adaptive controller.
    pub fn subscribe_adjustments(&self) -> broadcast::Receiver<ConcurrencyAdjustment> {
        self.inner.controller.subscribe()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }
}

impl<T> Drop for RequestScheduler<T> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown.cancel();
        }
    }
}

async fn dispatch_loop<T: Send + 'static>(inner: Arc<Inner<T>>, shutdown: CancellationToken) {
    let idle = inner.config.idle_poll();
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        inner.release_due_retries();
        inner.fill_slots();

        let next_retry = inner.retries.lock().next_due();
        let backoff_elapsed = async move {
            match next_retry {
                Some(due) => tokio::time::sleep_until(due.into()).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            () = inner.wake.notified() => {}
            () = backoff_elapsed => {}
            () = tokio::time::sleep(idle) => {
                tracing::trace!("dispatch loop safety-net wake");
            }
        }
    }
    tracing::debug!("dispatch loop exited");
}

impl<T: Send + 'static> Inner<T> {
    /// Dispatch while there is work and a free slot.
    fn fill_slots(self: &Arc<Self>) {
        while self.in_flight.count() < self.concurrency.current() {
            let Some(request) = self.queue.dequeue() else {
                break;
            };
            self.dispatch(request);
        }
    }

    fn dispatch(self: &Arc<Self>, request: QueuedRequest<T>) {
        let guard = self.in_flight.track();
        self.metrics.increment_counter(names::REQUESTS_DISPATCHED, 1);
        self.metrics.set_gauge(names::IN_FLIGHT, self.in_flight.count() as f64);

        let span = RequestSpan::new(&request.id, &request.tenant, request.priority, request.attempts());
        let inner = Arc::clone(self);
        let task_span = span.clone();
        tokio::spawn(
            async move {
                let started = Instant::now();
                let result = run_payload(&request.execute).await;
                let latency = started.elapsed();
                task_span.record("latency_ms", latency.as_millis() as u64);
                task_span.record_result(&result);
                inner.settle(request, result, latency);
                drop(guard);
                inner.metrics.set_gauge(names::IN_FLIGHT, inner.in_flight.count() as f64);
            }
            .instrument(span),
        );
    }

    fn settle(&self, request: QueuedRequest<T>, result: Result<T, BoxError>, latency: Duration) {
        self.concurrency.record_latency(latency);
        self.metrics
            .record_histogram(names::TASK_LATENCY_MS, latency.as_secs_f64() * 1000.0);

        match result {
            Ok(output) => {
                // Lifecycle violations are logged by the queue manager.
                let _ = self.queue.complete(&request.id);
                request.complete(output, latency);
            }
            Err(error) => self.handle_failure(request, error),
        }
    }

    fn handle_failure(&self, mut request: QueuedRequest<T>, error: BoxError) {
        let _ = self.queue.mark_failed(&request.id);
        let attempts = request.attempts();
        let retry_allowed =
            self.config.enable_retry && request.retry_count < self.config.max_retries;

        if retry_allowed {
            // Read lock keeps stop() from draining the backoff queue mid-push.
            let state = self.state.read();
            if *state == LifecycleState::Running {
                request.retry_count += 1;
                let backoff = RetryQueue::<T>::backoff(self.config.retry_delay(), request.retry_count);
                tracing::warn!(
                    request_id = %request.id,
                    attempt = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "attempt failed; retrying"
                );
                request.last_error = Some(error);
                let _ = self.queue.mark_retrying(&request.id);
                self.retries.lock().push(Instant::now() + backoff, request);
                drop(state);
                self.metrics.increment_counter(names::TASK_RETRIES, 1);
                self.wake.notify_one();
                return;
            }
        }

        let reason = if self.config.enable_retry && !retry_allowed {
            SchedulerError::RetriesExhausted {
                attempts,
                source: error,
            }
        } else {
            SchedulerError::Execution {
                attempts,
                source: error,
            }
        };
        let _ = self.queue.fail(&request.id, &reason);
        request.reject(reason);
    }

    /// Move requests whose backoff has elapsed back into the queue.
    fn release_due_retries(&self) {
        let due = self.retries.lock().pop_due(Instant::now());
        for request in due {
            if let Err(rejected) = self.queue.enqueue(request) {
                let _ = self.queue.fail(&rejected.request.id, &rejected.reason);
                rejected.settle();
            }
        }
    }
}

/// Run a payload in its own task so a panic becomes an ordinary failure.
async fn run_payload<T: Send + 'static>(execute: &TaskFn<T>) -> Result<T, BoxError> {
    match tokio::spawn(execute().in_current_span()).await {
        Ok(result) => result,
        Err(join_error) if join_error.is_panic() => {
            Err(TaskPanicked(panic_message(join_error.into_panic())).into())
        }
        Err(join_error) => Err(join_error.to_string().into()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
