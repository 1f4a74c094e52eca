//! Config CLI subcommands: show, defaults, validate.
//!
//! These read configuration from an optional TOML file and `GW_SCHED_*`
//! environment variables without starting a scheduler.

use std::path::Path;

use crate::config::{ConfigError, SchedulerConfig};

/// Print the effective config (file + env) as TOML. Returns an exit code.
pub fn run_show(path: Option<&Path>) -> i32 {
    match SchedulerConfig::load(path).and_then(|cfg| render(&cfg)) {
        Ok(text) => {
            print!("{text}");
            0
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

/// Print default config values (no file, no env overrides).
pub fn run_defaults() -> i32 {
    match render(&SchedulerConfig::default()) {
        Ok(text) => {
            print!("{text}");
            0
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

/// Load and validate. Returns 0 if valid, 1 otherwise.
pub fn run_validate(path: Option<&Path>) -> i32 {
    match SchedulerConfig::load(path) {
        Ok(_) => {
            println!("Configuration is valid.");
            0
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

fn render(cfg: &SchedulerConfig) -> Result<String, ConfigError> {
    toml::to_string_pretty(cfg).map_err(|e| ConfigError::Invalid(e.to_string()))
}
