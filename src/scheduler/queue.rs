//! Priority queue manager: admission, fair selection, lifecycle bookkeeping.
//!
//! Pending work lives in one lane per priority level. Each lane is an arena
//! of per-tenant FIFO slots plus a tenant-key index and a round-robin cursor,
//! so selection within a level is O(tenants) worst case and iteration order
//! is deterministic.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use super::error::SchedulerError;
use super::priority::Priority;
use super::queued_request::{QueuedRequest, RequestState, Rejected};
use super::task::RequestId;
use crate::config::Strategy;
use crate::telemetry::{names, MetricsSink};

/// How requests are partitioned into sub-queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioning {
    /// One queue, submission order.
    Fifo,
    /// One queue per priority level.
    Priority,
    /// One queue per (priority, tenant) pair with round robin across tenants.
    Fair,
}

impl From<Strategy> for Partitioning {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Fifo => Self::Fifo,
            Strategy::Priority => Self::Priority,
            Strategy::Fair | Strategy::Adaptive => Self::Fair,
        }
    }
}

/// Configuration for the queue manager.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub partitioning: Partitioning,
    /// Maximum pending requests per partition.
    pub max_queue_depth: usize,
    /// Age after which a request competes one level higher. `None` disables aging.
    pub max_wait: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            partitioning: Partitioning::Fair,
            max_queue_depth: 1024,
            max_wait: Some(Duration::from_secs(30)),
        }
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueMetrics {
    pub depth: usize,
    pub depth_by_priority: BTreeMap<Priority, usize>,
    pub depth_by_tenant: BTreeMap<String, usize>,
    pub oldest_pending_ms: Option<u64>,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_evicted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
}

struct TenantSlot<T> {
    key: String,
    pending: VecDeque<QueuedRequest<T>>,
}

/// All pending work at one priority level.
struct PriorityLane<T> {
    slots: Vec<TenantSlot<T>>,
    index: HashMap<String, usize>,
    cursor: usize,
    len: usize,
}

impl<T> PriorityLane<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            cursor: 0,
            len: 0,
        }
    }

    fn depth_of(&self, key: &str) -> usize {
        self.index
            .get(key)
            .map_or(0, |&i| self.slots[i].pending.len())
    }

    fn push(&mut self, key: &str, request: QueuedRequest<T>) {
        let slot = match self.index.get(key) {
            Some(&i) => i,
            None => {
                self.slots.push(TenantSlot {
                    key: key.to_string(),
                    pending: VecDeque::new(),
                });
                let i = self.slots.len() - 1;
                self.index.insert(key.to_string(), i);
                i
            }
        };
        self.slots[slot].pending.push_back(request);
        self.len += 1;
    }

    /// Next slot with pending work at or after the round-robin cursor.
    fn next_slot(&self) -> Option<usize> {
        let n = self.slots.len();
        (0..n)
            .map(|step| (self.cursor + step) % n)
            .find(|&i| !self.slots[i].pending.is_empty())
    }

    /// Next slot at or after the cursor whose head has waited at least
    /// `max_wait`. Aged work keeps the lane's tenant rotation.
    fn next_aged_slot(&self, now: Instant, max_wait: Duration) -> Option<usize> {
        let n = self.slots.len();
        (0..n).map(|step| (self.cursor + step) % n).find(|&i| {
            self.slots[i]
                .pending
                .front()
                .is_some_and(|head| head.age(now) >= max_wait)
        })
    }

    fn head_enqueued_at(&self, slot: usize) -> Option<Instant> {
        self.slots[slot].pending.front().map(|r| r.enqueued_at)
    }

    /// Pop the head of `slot` and advance the cursor past it.
    fn pop(&mut self, slot: usize) -> Option<QueuedRequest<T>> {
        let request = self.slots[slot].pending.pop_front()?;
        self.len -= 1;
        self.cursor = (slot + 1) % self.slots.len();
        if self.len == 0 {
            self.reset();
        }
        Some(request)
    }

    fn remove(&mut self, id: &RequestId) -> Option<QueuedRequest<T>> {
        for slot in &mut self.slots {
            if let Some(pos) = slot.pending.iter().position(|r| &r.id == id) {
                let request = slot.pending.remove(pos);
                self.len -= 1;
                if self.len == 0 {
                    self.reset();
                }
                return request;
            }
        }
        None
    }

    fn drain(&mut self) -> Vec<QueuedRequest<T>> {
        let drained = self
            .slots
            .iter_mut()
            .flat_map(|slot| slot.pending.drain(..))
            .collect();
        self.reset();
        drained
    }

    /// Drop tenant slots once the lane is idle so the arena stays bounded.
    fn reset(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.cursor = 0;
        self.len = 0;
    }

    fn iter(&self) -> impl Iterator<Item = &QueuedRequest<T>> {
        self.slots.iter().flat_map(|slot| slot.pending.iter())
    }

    #[cfg(test)]
    fn tenant_keys(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.key.as_str()).collect()
    }
}

struct Counters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    evicted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Thread-safe priority/tenant partitioned queue with lifecycle tracking.
pub struct PriorityQueueManager<T> {
    lanes: Mutex<[PriorityLane<T>; Priority::LEVELS]>,
    states: DashMap<RequestId, RequestState>,
    config: QueueConfig,
    /// Wakes the dispatch loop when work is enqueued.
    notify: Arc<Notify>,
    counters: Counters,
    metrics: Arc<dyn MetricsSink>,
}

impl<T: Send + 'static> PriorityQueueManager<T> {
    pub fn new(config: QueueConfig, notify: Arc<Notify>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            lanes: Mutex::new(std::array::from_fn(|_| PriorityLane::new())),
            states: DashMap::new(),
            config,
            notify,
            counters: Counters {
                enqueued: AtomicU64::new(0),
                dequeued: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            },
            metrics,
        }
    }

    /// Sub-queue a request belongs to under the configured partitioning.
    fn partition<'a>(&self, request: &'a QueuedRequest<T>) -> (Priority, &'a str) {
        match self.config.partitioning {
            Partitioning::Fifo => (Priority::Normal, ""),
            Partitioning::Priority => (request.priority, ""),
            Partitioning::Fair => (request.priority, request.tenant.as_str()),
        }
    }

    /// Admit a request. Never blocks; wakes the dispatch loop on success.
    ///
    /// Fresh ids must be unknown. A request re-entering after a failed
    /// attempt must be in the `Retrying` state.
    pub fn enqueue(&self, request: QueuedRequest<T>) -> Result<RequestId, Rejected<T>> {
        let id = self.admit(request)?;
        self.notify.notify_one();
        Ok(id)
    }

    /// Admit a batch in submission order with a single wake-up.
    /// Returns the requests that were refused.
    pub fn enqueue_batch(&self, requests: Vec<QueuedRequest<T>>) -> Vec<Rejected<T>> {
        let mut rejected = Vec::new();
        let mut admitted = 0usize;
        for request in requests {
            match self.admit(request) {
                Ok(_) => admitted += 1,
                Err(r) => rejected.push(r),
            }
        }
        if admitted > 0 {
            self.notify.notify_one();
        }
        rejected
    }

    fn admit(&self, mut request: QueuedRequest<T>) -> Result<RequestId, Rejected<T>> {
        let mut lanes = self.lanes.lock();
        // Registry entries for new ids are only created here, under the lanes lock.
        let retrying = match self.states.get(&request.id).map(|s| *s) {
            None => false,
            Some(RequestState::Retrying) => true,
            Some(state) => {
                drop(lanes);
                let reason = SchedulerError::Validation(format!(
                    "request {} is already {:?}",
                    request.id, state
                ));
                return Err(Rejected { reason, request });
            }
        };

        let (level, key) = self.partition(&request);
        let lane = &mut lanes[level.index()];
        let depth = lane.depth_of(key);
        if depth >= self.config.max_queue_depth {
            drop(lanes);
            self.metrics.increment_counter(names::REQUESTS_REJECTED, 1);
            let reason = SchedulerError::QueueFull {
                priority: request.priority,
                tenant: request.tenant.clone(),
                depth,
            };
            return Err(Rejected { reason, request });
        }

        let id = request.id.clone();
        let key = key.to_string();
        if retrying {
            request.enqueued_at = Instant::now();
        }
        self.states.insert(id.clone(), RequestState::Queued);
        lane.push(&key, request);
        let total: usize = lanes.iter().map(|l| l.len).sum();
        drop(lanes);

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment_counter(names::REQUESTS_ENQUEUED, 1);
        self.metrics.set_gauge(names::QUEUE_DEPTH, total as f64);
        tracing::trace!(request_id = %id, retrying, "request enqueued");
        Ok(id)
    }

    /// Select the next request: highest effective level first, round robin
    /// across tenants within a level, aged requests competing one level up.
    ///
    /// Aging lifts a request by exactly one level, so work two or more levels
    /// below a level that never empties can still wait indefinitely.
    pub fn dequeue(&self) -> Option<QueuedRequest<T>> {
        let now = Instant::now();
        let mut lanes = self.lanes.lock();
        let mut selected = None;

        for level in Priority::DESCENDING {
            let native = lanes[level.index()].next_slot();
            let aged = match (self.config.max_wait, level.demoted()) {
                (Some(max_wait), Some(lower)) => lanes[lower.index()]
                    .next_aged_slot(now, max_wait)
                    .map(|slot| (lower, slot)),
                _ => None,
            };

            selected = match (native, aged) {
                (None, None) => continue,
                (Some(slot), None) => lanes[level.index()].pop(slot),
                (None, Some((lower, slot))) => lanes[lower.index()].pop(slot),
                (Some(slot), Some((lower, aged_slot))) => {
                    let native_at = lanes[level.index()].head_enqueued_at(slot);
                    let aged_at = lanes[lower.index()].head_enqueued_at(aged_slot);
                    if aged_at < native_at {
                        lanes[lower.index()].pop(aged_slot)
                    } else {
                        lanes[level.index()].pop(slot)
                    }
                }
            };
            break;
        }

        if let Some(request) = &selected {
            self.states.insert(request.id.clone(), RequestState::Dispatched);
        }
        let total: usize = lanes.iter().map(|l| l.len).sum();
        drop(lanes);

        let request = selected?;
        self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
        self.metrics.set_gauge(names::QUEUE_DEPTH, total as f64);
        self.metrics
            .record_histogram(names::QUEUE_WAIT_MS, request.age(now).as_secs_f64() * 1000.0);
        Some(request)
    }

    /// Mark terminal success and release the request's bookkeeping.
    pub fn complete(&self, id: &RequestId) -> Result<(), SchedulerError> {
        self.transition(id, RequestState::Dispatched, RequestState::Completed)?;
        self.states.remove(id);
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment_counter(names::REQUESTS_COMPLETED, 1);
        Ok(())
    }

    /// Record a failed attempt. Retry policy lives in the scheduler.
    pub fn mark_failed(&self, id: &RequestId) -> Result<(), SchedulerError> {
        self.transition(id, RequestState::Dispatched, RequestState::Failed)
    }

    /// Record that a failed request will be re-enqueued after backoff.
    pub fn mark_retrying(&self, id: &RequestId) -> Result<(), SchedulerError> {
        self.transition(id, RequestState::Failed, RequestState::Retrying)
    }

    /// Mark terminal failure without retry and release the bookkeeping.
    pub fn fail(&self, id: &RequestId, error: &SchedulerError) -> Result<(), SchedulerError> {
        let state = self.state(id).ok_or_else(|| self.lifecycle_violation(id, "fail", None))?;
        if !matches!(
            state,
            RequestState::Dispatched | RequestState::Failed | RequestState::Retrying
        ) {
            return Err(self.lifecycle_violation(id, "fail", Some(state)));
        }
        self.states.remove(id);
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment_counter(names::REQUESTS_DEAD_LETTERED, 1);
        tracing::warn!(request_id = %id, error = %error, "request dead-lettered");
        Ok(())
    }

    /// Remove a still-queued request. Returns it so the caller can be settled.
    pub fn cancel(&self, id: &RequestId) -> Option<QueuedRequest<T>> {
        if self.state(id) != Some(RequestState::Queued) {
            return None;
        }
        let removed = self.lanes.lock().iter_mut().find_map(|lane| lane.remove(id))?;
        self.states.remove(id);
        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment_counter(names::REQUESTS_EVICTED, 1);
        Some(removed)
    }

    /// Current lifecycle state of a live request.
    pub fn state(&self, id: &RequestId) -> Option<RequestState> {
        self.states.get(id).map(|s| *s)
    }

    /// Drain every queue, releasing all queued requests to the caller.
    pub fn cleanup(&self) -> Vec<QueuedRequest<T>> {
        let drained: Vec<_> = {
            let mut lanes = self.lanes.lock();
            lanes.iter_mut().flat_map(|lane| lane.drain()).collect()
        };
        for request in &drained {
            self.states.remove(&request.id);
        }
        let count = drained.len() as u64;
        self.counters.evicted.fetch_add(count, Ordering::Relaxed);
        if count > 0 {
            self.metrics.increment_counter(names::REQUESTS_EVICTED, count);
        }
        self.metrics.set_gauge(names::QUEUE_DEPTH, 0.0);
        drained
    }

    /// Forget a request that left the queue without a terminal transition
    /// (abandoned during shutdown).
    pub(crate) fn forget(&self, id: &RequestId) {
        if self.states.remove(id).is_some() {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.lanes.lock().iter().map(|l| l.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue depth per priority/tenant, oldest pending age, lifetime totals.
    pub fn metrics(&self) -> QueueMetrics {
        let now = Instant::now();
        let mut metrics = QueueMetrics::default();
        let mut oldest: Option<Instant> = None;
        {
            let lanes = self.lanes.lock();
            for request in lanes.iter().flat_map(|lane| lane.iter()) {
                metrics.depth += 1;
                *metrics.depth_by_priority.entry(request.priority).or_default() += 1;
                *metrics.depth_by_tenant.entry(request.tenant.clone()).or_default() += 1;
                oldest = Some(oldest.map_or(request.enqueued_at, |o| o.min(request.enqueued_at)));
            }
        }
        metrics.oldest_pending_ms = oldest.map(|o| now.saturating_duration_since(o).as_millis() as u64);
        metrics.total_enqueued = self.counters.enqueued.load(Ordering::Relaxed);
        metrics.total_dequeued = self.counters.dequeued.load(Ordering::Relaxed);
        metrics.total_evicted = self.counters.evicted.load(Ordering::Relaxed);
        metrics.total_completed = self.counters.completed.load(Ordering::Relaxed);
        metrics.total_failed = self.counters.failed.load(Ordering::Relaxed);
        metrics
    }

    fn transition(
        &self,
        id: &RequestId,
        from: RequestState,
        to: RequestState,
    ) -> Result<(), SchedulerError> {
        let op = format!("{from:?} -> {to:?}");
        let mut entry = self
            .states
            .get_mut(id)
            .ok_or_else(|| self.lifecycle_violation(id, &op, None))?;
        if *entry != from {
            let current = *entry;
            drop(entry);
            return Err(self.lifecycle_violation(id, &op, Some(current)));
        }
        *entry = to;
        Ok(())
    }

    fn lifecycle_violation(
        &self,
        id: &RequestId,
        op: &str,
        state: Option<RequestState>,
    ) -> SchedulerError {
        let message = match state {
            Some(state) => format!("{op} on request {id} in state {state:?}"),
            None => format!("{op} on unknown request {id}"),
        };
        tracing::error!(request_id = %id, "{message}");
        SchedulerError::Lifecycle(message)
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
