//! Scheduler configuration.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `GW_SCHED_*` environment variables. Invalid environment values keep the
//! current value without failing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GW_SCHED_STRATEGY` | fair | `fifo`, `priority`, `fair` or `adaptive` |
//! | `GW_SCHED_MIN_CONCURRENCY` | 1 | Floor for the concurrency ceiling |
//! | `GW_SCHED_MAX_CONCURRENCY` | 2 x cores (2..=64) | Cap for the concurrency ceiling |
//! | `GW_SCHED_INITIAL_CONCURRENCY` | min | Adaptive starting point |
//! | `GW_SCHED_CONCURRENCY_STEP` | 1 | Additive adjustment step |
//! | `GW_SCHED_TARGET_LATENCY_MS` | 1000 | Adaptive latency target |
//! | `GW_SCHED_ADAPTIVE_INTERVAL_MS` | 5000 | Adaptive tick interval |
//! | `GW_SCHED_LATENCY_WINDOW` | 100 | Latency samples kept |
//! | `GW_SCHED_ENABLE_BATCHING` | false | Coalesce submissions |
//! | `GW_SCHED_BATCH_SIZE` | 10 | Flush at this many buffered tasks |
//! | `GW_SCHED_BATCH_TIMEOUT_MS` | 100 | Flush this long after the first buffered task |
//! | `GW_SCHED_ENABLE_RETRY` | true | Retry failed payloads |
//! | `GW_SCHED_MAX_RETRIES` | 3 | Retries after the first attempt |
//! | `GW_SCHED_RETRY_DELAY_MS` | 1000 | Linear backoff unit |
//! | `GW_SCHED_MAX_WAIT_MS` | 30000 | Aging threshold (0 disables) |
//! | `GW_SCHED_MAX_QUEUE_DEPTH` | 1024 | Pending limit per priority/tenant |
//! | `GW_SCHED_IDLE_POLL_MS` | 100 | Dispatch loop safety-net wake |
//! | `GW_SCHED_DRAIN_TIMEOUT_MS` | 30000 | Wait for in-flight work on stop |

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::{Partitioning, QueueConfig};

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Scheduling strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Submission order; priority and tenant are recorded only.
    Fifo,
    /// Strict priority, FIFO within a level.
    Priority,
    /// Priority plus per-tenant round robin.
    #[default]
    Fair,
    /// Fair selection plus latency-driven concurrency.
    Adaptive,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fifo => "fifo",
            Self::Priority => "priority",
            Self::Fair => "fair",
            Self::Adaptive => "adaptive",
        })
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "priority" => Ok(Self::Priority),
            "fair" => Ok(Self::Fair),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(ConfigError::Invalid(format!("unknown strategy: {other}"))),
        }
    }
}

/// Scheduler configuration. Immutable once the scheduler is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SchedulerConfig {
    pub strategy: Strategy,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub initial_concurrency: Option<usize>,
    pub concurrency_step: usize,
    pub target_latency_ms: u64,
    pub adaptive_interval_ms: u64,
    pub latency_window: usize,
    pub enable_batching: bool,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub enable_retry: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_wait_ms: u64,
    pub max_queue_depth: usize,
    pub idle_poll_ms: u64,
    pub drain_timeout_ms: u64,
    pub adjustment_channel_capacity: usize,
}

fn default_max_concurrency() -> usize {
    (num_cpus::get() * 2).clamp(2, 64)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Fair,
            min_concurrency: 1,
            max_concurrency: default_max_concurrency(),
            initial_concurrency: None,
            concurrency_step: 1,
            target_latency_ms: 1000,
            adaptive_interval_ms: 5000,
            latency_window: 100,
            enable_batching: false,
            batch_size: 10,
            batch_timeout_ms: 100,
            enable_retry: true,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_wait_ms: 30_000,
            max_queue_depth: 1024,
            idle_poll_ms: 100,
            drain_timeout_ms: 30_000,
            adjustment_channel_capacity: 64,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Parse a TOML document. Missing keys take defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load a TOML file, then overlay environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay `GW_SCHED_*` variables onto the current values.
    pub fn apply_env(&mut self) {
        if let Some(strategy) = env_parse("GW_SCHED_STRATEGY") {
            self.strategy = strategy;
        }
        env_into("GW_SCHED_MIN_CONCURRENCY", &mut self.min_concurrency);
        env_into("GW_SCHED_MAX_CONCURRENCY", &mut self.max_concurrency);
        if let Some(initial) = env_parse("GW_SCHED_INITIAL_CONCURRENCY") {
            self.initial_concurrency = Some(initial);
        }
        env_into("GW_SCHED_CONCURRENCY_STEP", &mut self.concurrency_step);
        env_into("GW_SCHED_TARGET_LATENCY_MS", &mut self.target_latency_ms);
        env_into("GW_SCHED_ADAPTIVE_INTERVAL_MS", &mut self.adaptive_interval_ms);
        env_into("GW_SCHED_LATENCY_WINDOW", &mut self.latency_window);
        env_into("GW_SCHED_ENABLE_BATCHING", &mut self.enable_batching);
        env_into("GW_SCHED_BATCH_SIZE", &mut self.batch_size);
        env_into("GW_SCHED_BATCH_TIMEOUT_MS", &mut self.batch_timeout_ms);
        env_into("GW_SCHED_ENABLE_RETRY", &mut self.enable_retry);
        env_into("GW_SCHED_MAX_RETRIES", &mut self.max_retries);
        env_into("GW_SCHED_RETRY_DELAY_MS", &mut self.retry_delay_ms);
        env_into("GW_SCHED_MAX_WAIT_MS", &mut self.max_wait_ms);
        env_into("GW_SCHED_MAX_QUEUE_DEPTH", &mut self.max_queue_depth);
        env_into("GW_SCHED_IDLE_POLL_MS", &mut self.idle_poll_ms);
        env_into("GW_SCHED_DRAIN_TIMEOUT_MS", &mut self.drain_timeout_ms);
    }

    /// Reject configurations the scheduler cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1".into());
        }
        if self.min_concurrency == 0 {
            return invalid("min_concurrency must be at least 1".into());
        }
        if self.min_concurrency > self.max_concurrency {
            return invalid(format!(
                "min_concurrency ({}) exceeds max_concurrency ({})",
                self.min_concurrency, self.max_concurrency
            ));
        }
        if let Some(initial) = self.initial_concurrency {
            if !(self.min_concurrency..=self.max_concurrency).contains(&initial) {
                return invalid(format!(
                    "initial_concurrency ({initial}) outside [{}, {}]",
                    self.min_concurrency, self.max_concurrency
                ));
            }
        }
        if self.concurrency_step == 0 {
            return invalid("concurrency_step must be at least 1".into());
        }
        if self.target_latency_ms == 0 || self.adaptive_interval_ms == 0 {
            return invalid("target_latency_ms and adaptive_interval_ms must be positive".into());
        }
        if self.latency_window == 0 {
            return invalid("latency_window must be at least 1".into());
        }
        if self.enable_batching && (self.batch_size == 0 || self.batch_timeout_ms == 0) {
            return invalid("batch_size and batch_timeout_ms must be positive".into());
        }
        if self.max_queue_depth == 0 {
            return invalid("max_queue_depth must be at least 1".into());
        }
        if self.idle_poll_ms == 0 {
            return invalid("idle_poll_ms must be positive".into());
        }
        if self.adjustment_channel_capacity == 0 {
            return invalid("adjustment_channel_capacity must be at least 1".into());
        }
        Ok(())
    }

    /// Ceiling the scheduler starts with.
    pub fn starting_concurrency(&self) -> usize {
        match self.strategy {
            Strategy::Adaptive => self
                .initial_concurrency
                .unwrap_or(self.min_concurrency)
                .clamp(self.min_concurrency, self.max_concurrency),
            _ => self.max_concurrency,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            partitioning: Partitioning::from(self.strategy),
            max_queue_depth: self.max_queue_depth,
            max_wait: (self.max_wait_ms > 0).then(|| Duration::from_millis(self.max_wait_ms)),
        }
    }

    pub fn target_latency(&self) -> Duration {
        Duration::from_millis(self.target_latency_ms)
    }

    pub fn adaptive_interval(&self) -> Duration {
        Duration::from_millis(self.adaptive_interval_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_into<T: FromStr>(key: &str, slot: &mut T) {
    if let Some(value) = env_parse(key) {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert!((2..=64).contains(&config.max_concurrency));
        assert_eq!(config.strategy, Strategy::Fair);
    }

    #[test]
    fn starting_concurrency_depends_on_strategy() {
        let mut config = SchedulerConfig {
            min_concurrency: 2,
            max_concurrency: 8,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.starting_concurrency(), 8);
        config.strategy = Strategy::Adaptive;
        assert_eq!(config.starting_concurrency(), 2);
        config.initial_concurrency = Some(5);
        assert_eq!(config.starting_concurrency(), 5);
    }

    #[test]
    fn zero_max_wait_disables_aging() {
        let config = SchedulerConfig {
            max_wait_ms: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.queue_config().max_wait, None);
    }

    #[test]
    fn strategy_parses() {
        assert_eq!("Adaptive".parse::<Strategy>().unwrap(), Strategy::Adaptive);
        assert!("random".parse::<Strategy>().is_err());
    }
}
