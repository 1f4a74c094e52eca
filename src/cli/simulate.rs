//! `simulate` subcommand: push a synthetic workload through a live scheduler.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::parse_flag;
use crate::config::SchedulerConfig;
use crate::scheduler::{BoxError, Priority, RequestScheduler, ScheduledTask, SchedulerMetrics};
use crate::telemetry::{FacadeSink, MetricsSnapshot, MetricsStore, MetricsSink, TeeSink};

/// Workload shape for `simulate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulateOptions {
    pub tasks: usize,
    pub tenants: usize,
    /// Every Nth task fails its first attempt.
    pub fail_every: Option<usize>,
}

impl Default for SimulateOptions {
    fn default() -> Self {
        Self {
            tasks: 200,
            tenants: 4,
            fail_every: None,
        }
    }
}

impl SimulateOptions {
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        let defaults = Self::default();
        let tasks = parse_flag(args, "--tasks", defaults.tasks)?;
        let tenants = parse_flag(args, "--tenants", defaults.tenants)?.max(1);
        let fail_every = match parse_flag(args, "--fail-every", 0usize)? {
            0 => None,
            n => Some(n),
        };
        Ok(Self {
            tasks,
            tenants,
            fail_every,
        })
    }
}

/// Final report printed as JSON.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub retried: u64,
    pub elapsed_ms: u64,
    pub scheduler: SchedulerMetrics,
    pub metrics: MetricsSnapshot,
}

/// Run the workload and return the report.
pub async fn simulate(
    options: &SimulateOptions,
    config: SchedulerConfig,
) -> Result<SimulationReport, BoxError> {
    let store = Arc::new(MetricsStore::new());
    let sinks: Vec<Arc<dyn MetricsSink>> = vec![store.clone(), Arc::new(FacadeSink)];
    let scheduler: RequestScheduler<usize> =
        RequestScheduler::with_metrics(config, Arc::new(TeeSink::new(sinks)))?;
    scheduler.start();

    let started = Instant::now();
    let mut handles = Vec::with_capacity(options.tasks);
    for n in 0..options.tasks {
        let flaky = options.fail_every.is_some_and(|k| (n + 1) % k == 0);
        let attempts = Arc::new(AtomicU32::new(0));
        let work = Duration::from_millis(1 + (n % 7) as u64);
        let task = ScheduledTask::new(move || {
            let attempts = attempts.clone();
            async move {
                tokio::time::sleep(work).await;
                if flaky && attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err::<usize, BoxError>(format!("task {n} transient failure").into());
                }
                Ok(n)
            }
        })
        .tenant(format!("tenant-{}", n % options.tenants))
        .priority(Priority::from((n % 4) as u8));
        handles.push(scheduler.schedule(task)?);
    }

    let (mut completed, mut failed) = (0, 0);
    for handle in handles {
        match handle.await {
            Ok(_) => completed += 1,
            Err(e) => {
                tracing::warn!(error = %e, "simulated task failed");
                failed += 1;
            }
        }
    }
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let scheduler_metrics = scheduler.metrics();
    scheduler.stop().await;

    Ok(SimulationReport {
        tasks: options.tasks,
        completed,
        failed,
        retried: store.counter(crate::telemetry::names::TASK_RETRIES),
        elapsed_ms,
        scheduler: scheduler_metrics,
        metrics: store.snapshot(),
    })
}

/// CLI entry: run and print the report. Returns an exit code.
pub async fn run_simulate(options: &SimulateOptions, config: SchedulerConfig) -> i32 {
    match simulate(options, config).await {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                println!("{json}");
                if report.failed == 0 {
                    0
                } else {
                    1
                }
            }
            Err(e) => {
                eprintln!("Failed to serialize report: {e}");
                1
            }
        },
        Err(e) => {
            eprintln!("Simulation failed: {e}");
            1
        }
    }
}
