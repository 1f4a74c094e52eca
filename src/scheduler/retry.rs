//! Deadline-ordered backoff queue.
//!
//! Failed requests waiting out their backoff sit here instead of in a
//! sleeping task. The dispatch loop sleeps until the earliest deadline and
//! moves due requests back into the queue manager.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use super::queued_request::QueuedRequest;

struct RetryEntry<T> {
    due: Instant,
    sequence: u64,
    request: QueuedRequest<T>,
}

impl<T> PartialEq for RetryEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl<T> Eq for RetryEntry<T> {}

impl<T> PartialOrd for RetryEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for RetryEntry<T> {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Requests waiting out linear backoff.
pub struct RetryQueue<T> {
    heap: BinaryHeap<RetryEntry<T>>,
    next_sequence: u64,
}

impl<T> RetryQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    /// Backoff before retry number `retry_count` (1-based): `delay * retry_count`.
    pub fn backoff(delay: Duration, retry_count: u32) -> Duration {
        delay.saturating_mul(retry_count)
    }

    pub fn push(&mut self, due: Instant, request: QueuedRequest<T>) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(RetryEntry {
            due,
            sequence,
            request,
        });
    }

    /// Earliest deadline, if anything is waiting.
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.due)
    }

    /// Remove every request whose deadline has passed, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<QueuedRequest<T>> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|e| e.due <= now) {
            if let Some(entry) = self.heap.pop() {
                due.push(entry.request);
            }
        }
        due
    }

    pub fn drain(&mut self) -> Vec<QueuedRequest<T>> {
        self.heap.drain().map(|e| e.request).collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<T> Default for RetryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
