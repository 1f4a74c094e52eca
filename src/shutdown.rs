//! Lifecycle state and in-flight tracking for graceful stop.
//!
//! Every dispatched task holds an `InFlightGuard`. Dropping the guard frees
//! the concurrency slot, wakes the dispatch loop, and lets a pending drain
//! re-check the count.

use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Running,
    /// Stop requested; no new admissions, in-flight work finishing.
    Draining,
}

/// Result of waiting for in-flight work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: usize },
}

/// Counts dispatched-but-unsettled tasks.
pub struct InFlightTracker {
    count: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    wake: Arc<Notify>,
}

impl InFlightTracker {
    /// `wake` is signalled each time a slot frees up.
    pub fn new(wake: Arc<Notify>) -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
            wake,
        }
    }

    /// Claim a slot for a dispatched task.
    pub fn track(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            count: Arc::clone(&self.count),
            drained: Arc::clone(&self.drained),
            wake: Arc::clone(&self.wake),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until nothing is in flight or `timeout` elapses.
    pub async fn wait_for_drain(&self, timeout: Duration) -> DrainResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register before checking so a guard dropped in between is not missed.
            let mut notified = pin!(self.drained.notified());
            notified.as_mut().enable();

            let count = self.count();
            if count == 0 {
                return DrainResult::Complete;
            }
            if tokio::time::Instant::now() >= deadline {
                return DrainResult::Timeout { remaining: count };
            }

            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    let remaining = self.count();
                    if remaining == 0 {
                        return DrainResult::Complete;
                    }
                    return DrainResult::Timeout { remaining };
                }
            }
        }
    }
}

/// RAII guard for one in-flight task.
pub struct InFlightGuard {
    count: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    wake: Arc<Notify>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.drained.notify_waiters();
        self.wake.notify_one();
    }
}
