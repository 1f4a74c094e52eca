//! Health check support for the scheduler.
//!
//! Derives liveness, readiness, and a full health report from a
//! `SchedulerStatus` snapshot.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::scheduler::SchedulerStatus;
use crate::shutdown::LifecycleState;

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Detailed health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub ready: bool,
    pub lifecycle: LifecycleState,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub current_concurrency: usize,
    pub uptime_secs: u64,
}

/// Health check configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Queue depth at which the scheduler reports degraded and not ready.
    pub degraded_queue_depth: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_queue_depth: 1000,
        }
    }
}

/// Aggregates health information from scheduler status.
pub struct HealthChecker {
    config: HealthConfig,
    start_time: Instant,
}

impl HealthChecker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            start_time: Instant::now(),
        }
    }

    /// Check liveness: process is responsive.
    pub fn is_alive(&self) -> bool {
        true
    }

    /// Check readiness: running and not backed up.
    pub fn is_ready(&self, status: &SchedulerStatus) -> bool {
        status.state == LifecycleState::Running
            && status.queue_size < self.config.degraded_queue_depth
    }

    /// Generate full health report.
    pub fn report(&self, status: &SchedulerStatus) -> HealthReport {
        HealthReport {
            state: self.compute_state(status),
            ready: self.is_ready(status),
            lifecycle: status.state,
            queue_depth: status.queue_size,
            in_flight: status.in_flight,
            current_concurrency: status.current_concurrency,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    fn compute_state(&self, status: &SchedulerStatus) -> HealthState {
        if status.state != LifecycleState::Running {
            return HealthState::Unhealthy;
        }
        if status.queue_size >= self.config.degraded_queue_depth {
            return HealthState::Degraded;
        }
        HealthState::Healthy
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}
