//! Tests for the request scheduler dispatch loop and lifecycle.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use super::*;
use crate::scheduler::{Priority, TaskOutcome};
use crate::telemetry::{MetricsStore, NoopSink};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrency: 4,
        retry_delay_ms: 5,
        idle_poll_ms: 10,
        drain_timeout_ms: 1000,
        ..SchedulerConfig::default()
    }
}

fn started(config: SchedulerConfig) -> RequestScheduler<u32> {
    let scheduler = RequestScheduler::with_metrics(config, Arc::new(NoopSink)).unwrap();
    scheduler.start();
    scheduler
}

async fn settle(handle: ScheduleHandle<u32>) -> TaskOutcome<u32> {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("request settled in time")
}

fn ok(value: u32) -> Result<u32, BoxError> {
    Ok(value)
}

fn fail(msg: &str) -> Result<u32, BoxError> {
    Err(msg.into())
}

fn sleeper(ms: u64, value: u32) -> ScheduledTask<u32> {
    ScheduledTask::new(move || async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        ok(value)
    })
}

#[tokio::test]
async fn schedule_before_start_is_rejected() {
    let scheduler: RequestScheduler<u32> =
        RequestScheduler::with_metrics(config(), Arc::new(NoopSink)).unwrap();
    let err = scheduler
        .schedule(ScheduledTask::new(|| async { ok(1) }))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NotRunning));
}

#[tokio::test]
async fn invalid_config_is_refused() {
    let bad = SchedulerConfig {
        min_concurrency: 8,
        max_concurrency: 2,
        ..config()
    };
    assert!(RequestScheduler::<u32>::with_metrics(bad, Arc::new(NoopSink)).is_err());
}

#[tokio::test]
async fn completes_with_output_and_metadata() {
    let scheduler = started(config());
    let handle = scheduler
        .schedule(
            ScheduledTask::new(|| async { ok(42) })
                .id("req-1")
                .tenant("acme")
                .metadata("route", "chat"),
        )
        .unwrap();
    assert_eq!(handle.id().as_str(), "req-1");

    let done = settle(handle).await.unwrap();
    assert_eq!(done.output, 42);
    assert_eq!(done.retry_count, 0);
    assert_eq!(done.metadata.get("route").map(String::as_str), Some("chat"));
    // Terminal requests leave the registry.
    assert_eq!(scheduler.request_state(&RequestId::from("req-1")), None);
    scheduler.stop().await;
}

#[tokio::test]
async fn validation_errors_are_immediate() {
    let scheduler = started(config());
    let err = scheduler
        .schedule(ScheduledTask::new(|| async { ok(1) }).tenant("  "))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));

    let first = scheduler
        .schedule(sleeper(50, 1).id("dup"))
        .unwrap();
    let err = scheduler.schedule(sleeper(1, 2).id("dup")).unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));
    assert_eq!(settle(first).await.unwrap().output, 1);
    scheduler.stop().await;
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let scheduler = started(config());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let handle = scheduler
        .schedule(ScheduledTask::new(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    fail("transient")
                } else {
                    ok(7)
                }
            }
        }))
        .unwrap();

    let done = settle(handle).await.unwrap();
    assert_eq!(done.output, 7);
    assert_eq!(done.retry_count, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    scheduler.stop().await;
}

#[tokio::test]
async fn retries_are_bounded() {
    let scheduler = started(SchedulerConfig {
        max_retries: 2,
        ..config()
    });
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let handle = scheduler
        .schedule(ScheduledTask::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { fail("always") }
        }))
        .unwrap();

    let err = settle(handle).await.unwrap_err();
    assert!(matches!(err, SchedulerError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(err.to_string().contains("always"));
    scheduler.stop().await;
}

#[tokio::test]
async fn retry_disabled_fails_on_first_error() {
    let scheduler = started(SchedulerConfig {
        enable_retry: false,
        ..config()
    });
    let handle = scheduler
        .schedule(ScheduledTask::new(|| async { fail("nope") }))
        .unwrap();
    let err = settle(handle).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Execution { attempts: 1, .. }));
    scheduler.stop().await;
}

#[tokio::test]
async fn panics_become_failures() {
    let scheduler = started(SchedulerConfig {
        enable_retry: false,
        ..config()
    });
    let handle = scheduler
        .schedule(ScheduledTask::new(|| async {
            if true {
                panic!("boom");
            }
            ok(0)
        }))
        .unwrap();
    let err = settle(handle).await.unwrap_err();
    assert!(err.to_string().contains("boom"));

    // The loop survives the panic.
    let handle = scheduler
        .schedule(ScheduledTask::new(|| async { ok(5) }))
        .unwrap();
    assert_eq!(settle(handle).await.unwrap().output, 5);
    scheduler.stop().await;
}

#[tokio::test]
async fn in_flight_never_exceeds_ceiling() {
    let scheduler = started(SchedulerConfig {
        max_concurrency: 2,
        ..config()
    });
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let active = active.clone();
            let peak = peak.clone();
            scheduler
                .schedule(ScheduledTask::new(move || {
                    let active = active.clone();
                    let peak = peak.clone();
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(15)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        ok(i)
                    }
                }))
                .unwrap()
        })
        .collect();

    for handle in handles {
        settle(handle).await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    scheduler.stop().await;
}

#[tokio::test]
async fn dispatches_by_priority_when_saturated() {
    let scheduler = started(SchedulerConfig {
        max_concurrency: 1,
        ..config()
    });
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let blocker = scheduler.schedule(sleeper(40, 0)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut handles = Vec::new();
    for (name, priority) in [
        ("low", Priority::Low),
        ("normal", Priority::Normal),
        ("critical", Priority::Critical),
        ("high", Priority::High),
    ] {
        let order = order.clone();
        let task = ScheduledTask::new(move || {
            let order = order.clone();
            async move {
                order.lock().push(name);
                ok(0)
            }
        })
        .priority(priority);
        handles.push(scheduler.schedule(task).unwrap());
    }

    settle(blocker).await.unwrap();
    for handle in handles {
        settle(handle).await.unwrap();
    }
    assert_eq!(*order.lock(), ["critical", "high", "normal", "low"]);
    scheduler.stop().await;
}

#[tokio::test]
async fn cancel_withdraws_queued_request() {
    let scheduler = started(SchedulerConfig {
        max_concurrency: 1,
        ..config()
    });
    let blocker = scheduler.schedule(sleeper(40, 0)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let queued = scheduler.schedule(sleeper(1, 1).id("later")).unwrap();
    assert!(scheduler.cancel(&RequestId::from("later")));
    assert!(matches!(settle(queued).await, Err(SchedulerError::Cancelled)));
    assert!(!scheduler.cancel(&RequestId::from("later")));

    settle(blocker).await.unwrap();
    scheduler.stop().await;
}

#[tokio::test]
async fn stop_settles_queued_and_waits_for_in_flight() {
    let scheduler = started(SchedulerConfig {
        max_concurrency: 1,
        ..config()
    });
    let running = scheduler.schedule(sleeper(60, 1)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let queued = scheduler.schedule(sleeper(1, 2)).unwrap();

    assert_eq!(scheduler.stop().await, DrainResult::Complete);
    assert!(matches!(settle(queued).await, Err(SchedulerError::NotRunning)));
    assert_eq!(settle(running).await.unwrap().output, 1);
    assert_eq!(scheduler.status().state, LifecycleState::Stopped);

    let err = scheduler.schedule(sleeper(1, 3)).unwrap_err();
    assert!(matches!(err, SchedulerError::NotRunning));
}

#[tokio::test]
async fn stop_reports_remaining_after_drain_timeout() {
    let scheduler = started(SchedulerConfig {
        drain_timeout_ms: 20,
        ..config()
    });
    let slow = scheduler.schedule(sleeper(200, 9)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(scheduler.stop().await, DrainResult::Timeout { remaining: 1 });
    // In-flight work is never aborted.
    assert_eq!(settle(slow).await.unwrap().output, 9);
}

#[tokio::test]
async fn failures_during_stop_are_terminal() {
    let scheduler = started(config());
    let failing = scheduler
        .schedule(ScheduledTask::new(|| async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            fail("late")
        }))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    scheduler.stop().await;
    let err = settle(failing).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Execution { attempts: 1, .. }));
}

#[tokio::test]
async fn stop_settles_requests_in_backoff() {
    let scheduler = started(SchedulerConfig {
        retry_delay_ms: 10_000,
        ..config()
    });
    let handle = scheduler
        .schedule(ScheduledTask::new(|| async { fail("flaky") }))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(scheduler.metrics().pending_retries, 1);
    assert_eq!(
        scheduler.request_state(handle.id()),
        Some(RequestState::Retrying)
    );

    scheduler.stop().await;
    let err = settle(handle).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Execution { attempts: 1, .. }));
}

#[tokio::test]
async fn restart_after_stop() {
    let scheduler = started(config());
    scheduler.stop().await;
    assert!(!scheduler.is_running());

    scheduler.start();
    scheduler.start();
    assert!(scheduler.is_running());
    let handle = scheduler
        .schedule(ScheduledTask::new(|| async { ok(3) }))
        .unwrap();
    assert_eq!(settle(handle).await.unwrap().output, 3);
    scheduler.stop().await;
}

#[tokio::test]
async fn batching_admits_on_timeout() {
    let scheduler = started(SchedulerConfig {
        enable_batching: true,
        batch_size: 8,
        batch_timeout_ms: 30,
        ..config()
    });
    let handles: Vec<_> = (0..3)
        .map(|i| scheduler.schedule(ScheduledTask::new(move || async move { ok(i) })).unwrap())
        .collect();
    assert_eq!(scheduler.metrics().buffered, 3);

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(settle(handle).await.unwrap().output, i as u32);
    }
    assert_eq!(scheduler.metrics().batches_flushed, 1);
    scheduler.stop().await;
}

#[tokio::test]
async fn stop_settles_buffered_batch() {
    let scheduler = started(SchedulerConfig {
        enable_batching: true,
        batch_size: 8,
        batch_timeout_ms: 10_000,
        ..config()
    });
    let handle = scheduler.schedule(sleeper(1, 1)).unwrap();
    scheduler.stop().await;
    assert!(matches!(settle(handle).await, Err(SchedulerError::NotRunning)));
}

#[tokio::test]
async fn adaptive_strategy_raises_ceiling_under_low_latency() {
    let scheduler = started(SchedulerConfig {
        strategy: Strategy::Adaptive,
        min_concurrency: 1,
        max_concurrency: 8,
        initial_concurrency: Some(2),
        concurrency_step: 2,
        adaptive_interval_ms: 20,
        ..config()
    });
    assert_eq!(scheduler.status().current_concurrency, 2);
    let mut adjustments = scheduler.subscribe_adjustments();

    for i in 0..4 {
        let handle = scheduler
            .schedule(ScheduledTask::new(move || async move { ok(i) }))
            .unwrap();
        settle(handle).await.unwrap();
    }

    let adjustment = tokio::time::timeout(Duration::from_secs(2), adjustments.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((adjustment.previous, adjustment.current), (2, 4));
    scheduler.stop().await;
}

#[tokio::test]
async fn reports_metrics_through_sink() {
    let store = Arc::new(MetricsStore::new());
    let scheduler: RequestScheduler<u32> =
        RequestScheduler::with_metrics(config(), store.clone()).unwrap();
    scheduler.start();

    for i in 0..3 {
        let handle = scheduler
            .schedule(ScheduledTask::new(move || async move { ok(i) }))
            .unwrap();
        settle(handle).await.unwrap();
    }

    // Slots are released just after the handle settles.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.counter(names::REQUESTS_DISPATCHED), 3);
    let metrics = scheduler.metrics();
    assert_eq!(metrics.queue.total_completed, 3);
    assert_eq!(metrics.in_flight, 0);
    assert!(metrics.average_latency_ms.is_some());
    scheduler.stop().await;
}
