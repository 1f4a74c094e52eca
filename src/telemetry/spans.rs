//! Span utilities for scheduled requests.

use tracing::{info_span, Span};

use crate::scheduler::{Priority, RequestId};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for per-attempt request spans.
pub struct RequestSpan;

impl RequestSpan {
    /// `status`, `error.message` and `latency_ms` are filled in on settlement.
    pub fn new(id: &RequestId, tenant: &str, priority: Priority, attempt: u32) -> Span {
        info_span!(
            "scheduled_request",
            request_id = %id,
            tenant = %tenant,
            priority = %priority,
            attempt,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}
