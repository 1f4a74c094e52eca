//! `gateway-sched` entry point.
//!
//! ## CLI Subcommands
//!
//! - `gateway-sched simulate [--tasks N] [--tenants M] [--fail-every K] [--file PATH]`
//! - `gateway-sched config show|defaults|validate [--file PATH]`
//! - `gateway-sched version`
//! - `gateway-sched help`

use std::process::ExitCode;

use gateway_sched::cli::{config_cmd, config_path, run_simulate, SimulateOptions};
use gateway_sched::config::SchedulerConfig;
use gateway_sched::telemetry::{init_logging, LogConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    if let Err(e) = init_logging(&LogConfig::from_env()) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match command {
        "simulate" => {
            let options = match SimulateOptions::from_args(&args[2..]) {
                Ok(options) => options,
                Err(e) => {
                    eprintln!("{e}");
                    print_command_help("simulate");
                    return ExitCode::FAILURE;
                }
            };
            let config = match SchedulerConfig::load(config_path(&args).as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{e}");
                    return ExitCode::FAILURE;
                }
            };
            exit_code(run_simulate(&options, config).await)
        }
        "config" => {
            let path = config_path(&args);
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => exit_code(config_cmd::run_show(path.as_deref())),
                "defaults" => exit_code(config_cmd::run_defaults()),
                "validate" => exit_code(config_cmd::run_validate(path.as_deref())),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("gateway-sched {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(code.clamp(0, 255) as u8)
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "gateway-sched - gateway request scheduler v{}

USAGE:
    gateway-sched <COMMAND> [OPTIONS]

COMMANDS:
    simulate    Run a synthetic workload and print metrics as JSON
    config      Show, print defaults, or validate configuration
    version     Print version
    help        Print this message or help for a command

ENVIRONMENT:
    GW_SCHED_CONFIG        Config file used when --file is absent
    GW_SCHED_LOG           Log filter (default: info)
    GW_SCHED_LOG_FORMAT    json | pretty
    GW_SCHED_*             Per-field overrides, see `config defaults`",
        version
    );
}

fn print_command_help(command: &str) {
    match command {
        "simulate" => eprintln!(
            "gateway-sched simulate [--tasks N] [--tenants M] [--fail-every K] [--file PATH]

    --tasks N        Tasks to submit (default 200)
    --tenants M      Tenants to spread them across (default 4)
    --fail-every K   Every Kth task fails its first attempt (default off)
    --file PATH      TOML config file"
        ),
        "config" => eprintln!(
            "gateway-sched config <show|defaults|validate> [--file PATH]

    show        Effective configuration (file + environment) as TOML
    defaults    Built-in defaults as TOML
    validate    Exit 0 if the configuration is usable"
        ),
        other => {
            eprintln!("No help for '{}'", other);
            print_usage();
        }
    }
}
