//! Submission-time batching.
//!
//! Buffers scheduled requests and moves them into the queue manager as one
//! admission event when the buffer reaches `batch_size` or `batch_timeout`
//! has elapsed since the first buffered request, whichever comes first.
//! Each flush closes a buffer generation; a timer armed for a generation
//! that was already flushed by size does nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::queue::PriorityQueueManager;
use super::queued_request::QueuedRequest;
use crate::telemetry::{names, MetricsSink};

/// Configuration for the batch accumulator.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_timeout: Duration::from_millis(100),
        }
    }
}

struct BatchBuffer<T> {
    pending: Vec<QueuedRequest<T>>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl<T> BatchBuffer<T> {
    /// Close the current generation and hand back its requests.
    fn take(&mut self) -> Vec<QueuedRequest<T>> {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        std::mem::take(&mut self.pending)
    }
}

/// Coalesces bursts of submissions into single queue admissions.
pub struct BatchAccumulator<T> {
    config: BatchConfig,
    buffer: Mutex<BatchBuffer<T>>,
    queue: Arc<PriorityQueueManager<T>>,
    flushes: AtomicU64,
    metrics: Arc<dyn MetricsSink>,
}

impl<T: Send + 'static> BatchAccumulator<T> {
    pub fn new(
        config: BatchConfig,
        queue: Arc<PriorityQueueManager<T>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let config = BatchConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };
        Self {
            buffer: Mutex::new(BatchBuffer {
                pending: Vec::with_capacity(config.batch_size),
                generation: 0,
                timer: None,
            }),
            config,
            queue,
            flushes: AtomicU64::new(0),
            metrics,
        }
    }

    /// Buffer a request. Arms the timeout on the first request of a
    /// generation and flushes immediately when the size bound is reached.
    pub fn push(self: &Arc<Self>, request: QueuedRequest<T>) {
        let ready = {
            let mut buffer = self.buffer.lock();
            if buffer.pending.is_empty() && self.config.batch_size > 1 {
                let generation = buffer.generation;
                buffer.timer = Some(self.arm_timer(generation));
            }
            buffer.pending.push(request);
            if buffer.pending.len() >= self.config.batch_size {
                Some(buffer.take())
            } else {
                None
            }
        };
        if let Some(batch) = ready {
            self.flush_batch(batch, "size");
        }
    }

    /// Flush whatever is buffered now.
    pub fn flush(&self) {
        let batch = self.buffer.lock().take();
        if !batch.is_empty() {
            self.flush_batch(batch, "manual");
        }
    }

    /// Cancel the timer and return buffered requests without admitting them.
    pub fn shutdown(&self) -> Vec<QueuedRequest<T>> {
        self.buffer.lock().take()
    }

    /// Requests waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().pending.len()
    }

    /// Number of flush events so far.
    pub fn flushed_batches(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    fn arm_timer(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let timeout = self.config.batch_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(this) = weak.upgrade() {
                this.flush_generation(generation);
            }
        })
    }

    fn flush_generation(&self, generation: u64) {
        let batch = {
            let mut buffer = self.buffer.lock();
            if buffer.generation != generation || buffer.pending.is_empty() {
                return;
            }
            // This task is the timer; detach instead of aborting itself.
            buffer.timer = None;
            buffer.take()
        };
        self.flush_batch(batch, "timeout");
    }

    fn flush_batch(&self, batch: Vec<QueuedRequest<T>>, trigger: &'static str) {
        let size = batch.len();
        let rejected = self.queue.enqueue_batch(batch);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment_counter(names::BATCHES_FLUSHED, 1);
        self.metrics.record_histogram(names::BATCH_SIZE, size as f64);
        tracing::debug!(size, trigger, rejected = rejected.len(), "batch flushed");
        for rejection in rejected {
            rejection.settle();
        }
    }
}
