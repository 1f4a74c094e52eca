//! CLI subcommands for the `gateway-sched` binary.
//!
//! ## Usage
//!
//! ```bash
//! gateway-sched simulate --tasks 500 --tenants 4   # synthetic workload, metrics as JSON
//! gateway-sched config show --file sched.toml      # effective configuration
//! gateway-sched config validate                    # exit 0 if usable
//! ```

pub mod config_cmd;
pub mod simulate;

use std::path::PathBuf;

pub use simulate::{run_simulate, SimulateOptions};

/// Value following `flag`, if present.
pub fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Parse the value following `flag`, falling back to `default` when absent.
pub fn parse_flag<T: std::str::FromStr>(
    args: &[String],
    flag: &str,
    default: T,
) -> Result<T, String> {
    match flag_value(args, flag) {
        Some(raw) => raw
            .parse()
            .map_err(|_| format!("invalid value for {flag}: {raw}")),
        None => Ok(default),
    }
}

/// Config file from `--file`, else `GW_SCHED_CONFIG`.
pub fn config_path(args: &[String]) -> Option<PathBuf> {
    flag_value(args, "--file")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("GW_SCHED_CONFIG").map(PathBuf::from))
}
