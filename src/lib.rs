//! Gateway request scheduler
//!
//! Admission control and scheduling for an AI gateway. Requests are
//! opaque asynchronous payloads tagged with a priority and a tenant; the
//! scheduler decides when each one runs.
//!
//! # Behavior
//!
//! - **Priority**: higher levels dispatch first; waiting requests age one
//!   level up so low priorities are never starved
//! - **Fairness**: round robin across tenants within a priority level
//! - **Backpressure**: bounded pending depth per (priority, tenant)
//! - **Concurrency**: a ceiling on in-flight work, optionally adapted to
//!   observed latency
//! - **Resilience**: local retry with linear backoff and graceful drain
//!
//! ```no_run
//! use gateway_sched::config::SchedulerConfig;
//! use gateway_sched::scheduler::{BoxError, Priority, RequestScheduler, ScheduledTask};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = RequestScheduler::new(SchedulerConfig::default())?;
//! scheduler.start();
//!
//! let handle = scheduler.schedule(
//!     ScheduledTask::new(|| async { Ok::<_, BoxError>("pong") })
//!         .priority(Priority::High)
//!         .tenant("acme"),
//! )?;
//! let done = handle.await?;
//! assert_eq!(done.output, "pong");
//!
//! scheduler.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod health;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;

pub use config::{ConfigError, SchedulerConfig, Strategy};
pub use scheduler::{
    BoxError, Completion, Priority, RequestId, RequestScheduler, ScheduleHandle, ScheduledTask,
    SchedulerError,
};
pub use shutdown::DrainResult;
