//! Telemetry: structured logging, request spans, and the injected metrics sink.

mod logging;
mod sink;
mod spans;
mod store;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use sink::{names, FacadeSink, MetricsSink, NoopSink, TeeSink};
pub use spans::{RequestSpan, SpanExt};
pub use store::{HistogramSummary, MetricsSnapshot, MetricsStore};
