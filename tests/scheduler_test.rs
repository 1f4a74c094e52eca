//! End-to-end tests for dispatch ordering, fairness, retry, and concurrency.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_test::{assert_pending, assert_ready, task};

use gateway_sched::config::{SchedulerConfig, Strategy};
use gateway_sched::scheduler::{
    BoxError, Partitioning, Priority, PriorityQueueManager, QueueConfig, QueuedRequest,
    RequestScheduler, ScheduleHandle, ScheduledTask, SchedulerError, TaskOutcome,
};
use gateway_sched::telemetry::NoopSink;

fn config(max_concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        strategy: Strategy::Fair,
        max_concurrency,
        retry_delay_ms: 10,
        idle_poll_ms: 10,
        drain_timeout_ms: 2000,
        ..SchedulerConfig::default()
    }
}

fn started<T: Send + 'static>(config: SchedulerConfig) -> RequestScheduler<T> {
    let scheduler = RequestScheduler::with_metrics(config, Arc::new(NoopSink)).unwrap();
    scheduler.start();
    scheduler
}

async fn settle<T>(handle: ScheduleHandle<T>) -> TaskOutcome<T> {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("request settled in time")
}

/// Task that records `label` when it starts, then sleeps briefly.
fn recording(log: &Arc<Mutex<Vec<String>>>, label: String) -> ScheduledTask<()> {
    let log = log.clone();
    ScheduledTask::new(move || {
        let log = log.clone();
        let label = label.clone();
        async move {
            log.lock().push(label);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, BoxError>(())
        }
    })
}

#[tokio::test]
async fn single_slot_runs_high_before_low() {
    let scheduler = started::<()>(config(1));
    let log = Arc::new(Mutex::new(Vec::new()));

    let handles = vec![
        scheduler
            .schedule(recording(&log, "high-1".into()).priority(Priority::High))
            .unwrap(),
        scheduler
            .schedule(recording(&log, "high-2".into()).priority(Priority::High))
            .unwrap(),
        scheduler
            .schedule(recording(&log, "low".into()).priority(Priority::Low))
            .unwrap(),
    ];
    for handle in handles {
        settle(handle).await.unwrap();
    }

    assert_eq!(*log.lock(), ["high-1", "high-2", "low"]);
    scheduler.stop().await;
}

#[tokio::test]
async fn permanently_failing_task_is_attempted_one_plus_max_retries_times() {
    let scheduler = started::<u32>(SchedulerConfig {
        max_retries: 2,
        ..config(4)
    });
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();

    let handle = scheduler
        .schedule(ScheduledTask::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, BoxError>("provider unavailable".into()) }
        }))
        .unwrap();

    match settle(handle).await {
        Err(SchedulerError::RetriesExhausted { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert_eq!(source.to_string(), "provider unavailable");
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    scheduler.stop().await;
}

#[tokio::test]
async fn success_on_last_allowed_attempt_records_retry_count() {
    let scheduler = started::<&'static str>(SchedulerConfig {
        max_retries: 2,
        ..config(4)
    });
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();

    let handle = scheduler
        .schedule(ScheduledTask::new(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err::<&'static str, BoxError>("rate limited".into())
                } else {
                    Ok("done")
                }
            }
        }))
        .unwrap();

    let completion = settle(handle).await.unwrap();
    assert_eq!(completion.output, "done");
    assert_eq!(completion.retry_count, 2);
    scheduler.stop().await;
}

#[tokio::test]
async fn two_tenants_alternate_dispatches() {
    let scheduler = started::<()>(config(2));
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for tenant in ["a", "b"] {
        for n in 0..10 {
            let task = recording(&log, tenant.to_string())
                .tenant(tenant)
                .priority(Priority::High)
                .id(format!("{tenant}-{n}"));
            handles.push(scheduler.schedule(task).unwrap());
        }
    }
    for handle in handles {
        settle(handle).await.unwrap();
    }

    let order = log.lock().clone();
    assert_eq!(order.len(), 20);
    for pair in order.windows(2) {
        assert_ne!(pair[0], pair[1], "tenant dispatched twice in a row: {order:?}");
    }
    scheduler.stop().await;
}

#[test]
fn fairness_window_selects_each_tenant_equally() {
    let queue: PriorityQueueManager<()> = PriorityQueueManager::new(
        QueueConfig {
            partitioning: Partitioning::Fair,
            ..QueueConfig::default()
        },
        Arc::new(Notify::new()),
        Arc::new(NoopSink),
    );
    let tenants = ["t0", "t1", "t2"];
    for n in 0..6 {
        for tenant in tenants {
            let task = ScheduledTask::new(|| async { Ok::<_, BoxError>(()) })
                .tenant(tenant)
                .id(format!("{tenant}-{n}"));
            queue.enqueue(QueuedRequest::detached(task)).unwrap();
        }
    }

    let k = 4;
    let window: Vec<String> = (0..tenants.len() * k)
        .filter_map(|_| queue.dequeue())
        .map(|r| r.tenant)
        .collect();
    for tenant in tenants {
        assert_eq!(window.iter().filter(|t| *t == tenant).count(), k);
    }
}

#[tokio::test]
async fn in_flight_bounded_by_max_concurrency() {
    let scheduler = started::<()>(config(3));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for n in 0..12 {
        let active = active.clone();
        let peak = peak.clone();
        let task = ScheduledTask::new(move || {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        })
        .tenant(format!("tenant-{}", n % 4));
        handles.push(scheduler.schedule(task).unwrap());
    }
    for handle in handles {
        settle(handle).await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(scheduler.status().current_concurrency <= 3);
    scheduler.stop().await;
}

#[tokio::test]
async fn full_partition_rejects_at_schedule_time() {
    let scheduler = started::<()>(SchedulerConfig {
        max_queue_depth: 2,
        ..config(1)
    });
    let gate = Arc::new(Notify::new());
    let blocker_gate = gate.clone();
    let blocker = scheduler
        .schedule(ScheduledTask::new(move || {
            let gate = blocker_gate.clone();
            async move {
                gate.notified().await;
                Ok::<_, BoxError>(())
            }
        }))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let quick = || ScheduledTask::new(|| async { Ok::<_, BoxError>(()) }).tenant("busy");
    let queued = [
        scheduler.schedule(quick()).unwrap(),
        scheduler.schedule(quick()).unwrap(),
    ];
    let err = scheduler.schedule(quick()).unwrap_err();
    assert!(matches!(err, SchedulerError::QueueFull { depth: 2, .. }));
    assert!(err.is_rejection());

    // Other tenants have their own partition.
    let other = scheduler
        .schedule(ScheduledTask::new(|| async { Ok::<_, BoxError>(()) }).tenant("quiet"))
        .unwrap();

    gate.notify_one();
    settle(blocker).await.unwrap();
    for handle in queued {
        settle(handle).await.unwrap();
    }
    settle(other).await.unwrap();
    scheduler.stop().await;
}

#[tokio::test]
async fn handle_stays_pending_until_payload_settles() {
    let scheduler = started::<u8>(config(2));
    let gate = Arc::new(Notify::new());
    let task_gate = gate.clone();

    let mut handle = task::spawn(
        scheduler
            .schedule(ScheduledTask::new(move || {
                let gate = task_gate.clone();
                async move {
                    gate.notified().await;
                    Ok::<_, BoxError>(1)
                }
            }))
            .unwrap(),
    );
    assert_pending!(handle.poll());

    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(handle.is_woken());
    let completion = assert_ready!(handle.poll()).unwrap();
    assert_eq!(completion.output, 1);
    scheduler.stop().await;
}

#[tokio::test]
async fn strategies_all_complete_work() {
    for strategy in [
        Strategy::Fifo,
        Strategy::Priority,
        Strategy::Fair,
        Strategy::Adaptive,
    ] {
        let scheduler = started::<usize>(SchedulerConfig {
            strategy,
            min_concurrency: 2,
            ..config(4)
        });
        let handles: Vec<_> = (0..10)
            .map(|n| {
                scheduler
                    .schedule(
                        ScheduledTask::new(move || async move { Ok::<_, BoxError>(n) })
                            .priority(Priority::from((n % 4) as u8))
                            .tenant(format!("t{}", n % 3)),
                    )
                    .unwrap()
            })
            .collect();
        let mut outputs = Vec::new();
        for handle in handles {
            outputs.push(settle(handle).await.unwrap().output);
        }
        outputs.sort_unstable();
        assert_eq!(outputs, (0..10).collect::<Vec<_>>(), "strategy {strategy}");
        scheduler.stop().await;
    }
}
