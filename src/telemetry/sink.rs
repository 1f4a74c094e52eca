//! Injected metrics sink.
//!
//! Components receive an `Arc<dyn MetricsSink>` at construction instead of
//! reaching for a process-wide collector.

use std::sync::Arc;

/// Counters, gauges and histograms emitted by the scheduler.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &'static str, value: u64);
    fn set_gauge(&self, name: &'static str, value: f64);
    fn record_histogram(&self, name: &'static str, value: f64);
}

/// Metric names used across the scheduler.
pub mod names {
    pub const REQUESTS_ENQUEUED: &str = "gateway_sched_requests_enqueued_total";
    pub const REQUESTS_REJECTED: &str = "gateway_sched_requests_rejected_total";
    pub const REQUESTS_DISPATCHED: &str = "gateway_sched_requests_dispatched_total";
    pub const REQUESTS_COMPLETED: &str = "gateway_sched_requests_completed_total";
    pub const REQUESTS_DEAD_LETTERED: &str = "gateway_sched_requests_dead_lettered_total";
    pub const REQUESTS_EVICTED: &str = "gateway_sched_requests_evicted_total";
    pub const TASK_RETRIES: &str = "gateway_sched_task_retries_total";
    pub const TASK_LATENCY_MS: &str = "gateway_sched_task_latency_ms";
    pub const QUEUE_WAIT_MS: &str = "gateway_sched_queue_wait_ms";
    pub const QUEUE_DEPTH: &str = "gateway_sched_queue_depth";
    pub const IN_FLIGHT: &str = "gateway_sched_in_flight";
    pub const CONCURRENCY_LIMIT: &str = "gateway_sched_concurrency_limit";
    pub const CONCURRENCY_ADJUSTMENTS: &str = "gateway_sched_concurrency_adjustments_total";
    pub const BATCHES_FLUSHED: &str = "gateway_sched_batches_flushed_total";
    pub const BATCH_SIZE: &str = "gateway_sched_batch_size";
}

/// Forwards to the `metrics` crate facade, for whatever recorder the
/// embedding process installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeSink;

impl MetricsSink for FacadeSink {
    fn increment_counter(&self, name: &'static str, value: u64) {
        metrics::counter!(name).increment(value);
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        metrics::gauge!(name).set(value);
    }

    fn record_histogram(&self, name: &'static str, value: f64) {
        metrics::histogram!(name).record(value);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment_counter(&self, _name: &'static str, _value: u64) {}
    fn set_gauge(&self, _name: &'static str, _value: f64) {}
    fn record_histogram(&self, _name: &'static str, _value: f64) {}
}

/// Fans out to several sinks, e.g. the in-memory store plus the facade.
pub struct TeeSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl TeeSink {
    pub fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }
}

impl MetricsSink for TeeSink {
    fn increment_counter(&self, name: &'static str, value: u64) {
        self.sinks.iter().for_each(|s| s.increment_counter(name, value));
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        self.sinks.iter().for_each(|s| s.set_gauge(name, value));
    }

    fn record_histogram(&self, name: &'static str, value: f64) {
        self.sinks.iter().for_each(|s| s.record_histogram(name, value));
    }
}
