//! Latency-driven concurrency ceiling (additive increase / additive decrease).
//!
//! The controller ticks on a fixed interval and compares the mean of the
//! recent latency window against the target. Below 0.8x it adds a step,
//! above 1.2x it removes one, in between it holds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::telemetry::{names, MetricsSink};

const INCREASE_BELOW: f64 = 0.8;
const DECREASE_ABOVE: f64 = 1.2;

/// Fixed-capacity ring of recent task latencies. Oldest evicted on overflow.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Shared concurrency state: the ceiling and the latency window.
///
/// The adaptive controller is the only writer of the ceiling. Workers append
/// latency samples as tasks settle.
#[derive(Debug)]
pub struct ConcurrencyState {
    current: AtomicUsize,
    min: usize,
    max: usize,
    latencies: Mutex<LatencyWindow>,
}

impl ConcurrencyState {
    pub fn new(initial: usize, min: usize, max: usize, window: usize) -> Self {
        Self {
            current: AtomicUsize::new(initial.clamp(min, max)),
            min,
            max,
            latencies: Mutex::new(LatencyWindow::new(window)),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn record_latency(&self, latency: Duration) {
        self.latencies.lock().push(latency);
    }

    pub fn average_latency(&self) -> Option<Duration> {
        self.latencies.lock().mean()
    }

    fn set(&self, value: usize) {
        self.current.store(value.clamp(self.min, self.max), Ordering::Release);
    }
}

/// One discrete change of the concurrency ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConcurrencyAdjustment {
    pub previous: usize,
    pub current: usize,
    pub average_latency_ms: f64,
}

/// Adaptive controller settings.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub target_latency: Duration,
    pub interval: Duration,
    pub step: usize,
    pub channel_capacity: usize,
}

/// Periodically recomputes the concurrency ceiling from observed latency.
pub struct AdaptiveConcurrencyController {
    config: AdaptiveConfig,
    state: Arc<ConcurrencyState>,
    events: broadcast::Sender<ConcurrencyAdjustment>,
    metrics: Arc<dyn MetricsSink>,
    /// Signalled when the ceiling rises so idle capacity is used at once.
    wake: Option<Arc<Notify>>,
}

impl AdaptiveConcurrencyController {
    pub fn new(
        config: AdaptiveConfig,
        state: Arc<ConcurrencyState>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            config,
            state,
            events,
            metrics,
            wake: None,
        }
    }

    /// Notify `wake` whenever the ceiling increases.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Receive every adjustment made after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ConcurrencyAdjustment> {
        self.events.subscribe()
    }

    pub fn state(&self) -> &Arc<ConcurrencyState> {
        &self.state
    }

    /// Run one control step. Returns the adjustment if the ceiling changed.
    pub fn tick(&self) -> Option<ConcurrencyAdjustment> {
        let average = self.state.average_latency()?;
        let avg_ms = average.as_secs_f64() * 1000.0;
        let target_ms = self.config.target_latency.as_secs_f64() * 1000.0;
        let previous = self.state.current();

        let proposed = if avg_ms < target_ms * INCREASE_BELOW {
            previous.saturating_add(self.config.step).min(self.state.max())
        } else if avg_ms > target_ms * DECREASE_ABOVE {
            previous.saturating_sub(self.config.step).max(self.state.min())
        } else {
            previous
        };

        if proposed == previous {
            tracing::trace!(avg_ms, current = previous, "concurrency unchanged");
            return None;
        }

        self.state.set(proposed);
        if proposed > previous {
            if let Some(wake) = &self.wake {
                wake.notify_one();
            }
        }
        let adjustment = ConcurrencyAdjustment {
            previous,
            current: proposed,
            average_latency_ms: avg_ms,
        };
        tracing::info!(
            previous,
            current = proposed,
            avg_latency_ms = avg_ms,
            target_latency_ms = target_ms,
            "concurrency adjusted"
        );
        self.metrics.increment_counter(names::CONCURRENCY_ADJUSTMENTS, 1);
        self.metrics.set_gauge(names::CONCURRENCY_LIMIT, proposed as f64);
        // No subscribers is fine.
        let _ = self.events.send(adjustment);
        Some(adjustment)
    }

    /// Tick on the configured interval until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the window fills.
            interval.tick().await;
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        tracing::debug!("adaptive controller: shutdown signal received");
                        break;
                    }
                    _ = interval.tick() => {
                        self.tick();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{MetricsStore, NoopSink};

    fn controller(initial: usize, min: usize, max: usize, step: usize) -> AdaptiveConcurrencyController {
        let state = Arc::new(ConcurrencyState::new(initial, min, max, 100));
        AdaptiveConcurrencyController::new(
            AdaptiveConfig {
                target_latency: Duration::from_millis(100),
                interval: Duration::from_millis(10),
                step,
                channel_capacity: 16,
            },
            state,
            Arc::new(NoopSink),
        )
    }

    fn feed(c: &AdaptiveConcurrencyController, ms: u64, n: usize) {
        for _ in 0..n {
            c.state().record_latency(Duration::from_millis(ms));
        }
    }

    #[test]
    fn window_evicts_oldest() {
        let mut window = LatencyWindow::new(3);
        for ms in [100, 10, 10, 10] {
            window.push(Duration::from_millis(ms));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.mean(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn empty_window_is_a_no_op() {
        let c = controller(10, 1, 50, 5);
        assert_eq!(c.tick(), None);
        assert_eq!(c.state().current(), 10);
    }

    #[test]
    fn low_latency_increases_by_step() {
        let c = controller(10, 1, 50, 5);
        feed(&c, 50, 20);
        let adj = c.tick().unwrap();
        assert_eq!((adj.previous, adj.current), (10, 15));
        assert_eq!(c.state().current(), 15);
        assert!((adj.average_latency_ms - 50.0).abs() < 1e-6);
    }

    #[test]
    fn high_latency_decreases_by_step() {
        let c = controller(10, 1, 50, 5);
        feed(&c, 150, 20);
        assert_eq!(c.tick().map(|a| a.current), Some(5));
    }

    #[test]
    fn dead_band_holds() {
        let c = controller(10, 1, 50, 5);
        feed(&c, 100, 10);
        assert_eq!(c.tick(), None);
        feed(&c, 119, 100);
        assert_eq!(c.tick(), None);
        assert_eq!(c.state().current(), 10);
    }

    #[test]
    fn converges_to_bounds_monotonically() {
        let c = controller(10, 2, 50, 5);
        feed(&c, 10, 50);
        let mut last = c.state().current();
        for _ in 0..20 {
            c.tick();
            let now = c.state().current();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 50);

        feed(&c, 500, 100);
        for _ in 0..20 {
            c.tick();
            let now = c.state().current();
            assert!(now <= last);
            last = now;
        }
        assert_eq!(last, 2);
    }

    #[test]
    fn adjustments_are_broadcast_and_counted() {
        let store = Arc::new(MetricsStore::new());
        let state = Arc::new(ConcurrencyState::new(4, 1, 8, 10));
        let c = AdaptiveConcurrencyController::new(
            AdaptiveConfig {
                target_latency: Duration::from_millis(100),
                interval: Duration::from_millis(10),
                step: 1,
                channel_capacity: 4,
            },
            state,
            store.clone(),
        );
        let mut rx = c.subscribe();
        feed(&c, 1, 5);
        c.tick();
        assert_eq!(rx.try_recv().unwrap().current, 5);
        assert_eq!(store.counter(names::CONCURRENCY_ADJUSTMENTS), 1);
        assert_eq!(store.gauge(names::CONCURRENCY_LIMIT), Some(5.0));
    }

    #[tokio::test]
    async fn spawned_loop_ticks_until_cancelled() {
        let c = Arc::new(controller(1, 1, 100, 1));
        feed(&c, 1, 10);
        let mut rx = c.subscribe();
        let shutdown = CancellationToken::new();
        let handle = c.clone().spawn(shutdown.clone());

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.previous, 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn increase_wakes_dispatch() {
        let wake = Arc::new(Notify::new());
        let c = controller(2, 1, 8, 2).with_wake(Arc::clone(&wake));
        feed(&c, 10, 10);
        assert!(c.tick().is_some());
        tokio::time::timeout(Duration::from_millis(100), wake.notified())
            .await
            .unwrap();
    }
}
