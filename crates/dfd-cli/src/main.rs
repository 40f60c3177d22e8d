#![forbid(unsafe_code)]
//! defragd — opportunistic btrfs defragmentation scheduler.
//!
//! Parses the CLI surface into an immutable [`Config`], initializes
//! logging, and hands the process to the supervisor. The process runs
//! until killed; any panic in a worker thread aborts it so the init
//! system can restart from persisted state.

use anyhow::{Context, Result};
use clap::Parser;
use dfd_daemon::Supervisor;
use dfd_types::Config;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "defragd",
    about = "Schedules online btrfs defragmentation on rotating disks",
    version
)]
struct Cli {
    /// Log at debug level.
    #[arg(long)]
    verbose: bool,

    /// Log at trace level (implies --verbose).
    #[arg(long)]
    debug: bool,

    /// Target duration of one full slow-scan pass, in hours.
    #[arg(long, value_name = "HOURS", value_parser = parse_scan_hours)]
    full_scan_time: Option<f64>,

    /// Passed through to the defrag tool as `-t <SIZE>`.
    #[arg(long, value_name = "SIZE")]
    target_extent_size: Option<String>,

    /// Scales I/O budgets and scan pacing.
    #[arg(long, value_name = "FACTOR", default_value_t = 1.0, value_parser = parse_positive)]
    speed_multiplier: f64,

    /// Delay before resuming a checkpointed slow scan, in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 600, value_parser = parse_slow_start)]
    slow_start: u64,

    /// Rotational drives backing each filesystem (RAID).
    #[arg(long, value_name = "COUNT", default_value_t = 1.0, value_parser = parse_drive_count)]
    drive_count: f64,
}

fn parse_scan_hours(value: &str) -> std::result::Result<f64, String> {
    let hours: f64 = value.parse().map_err(|_| "not a number".to_owned())?;
    if hours >= 1.0 {
        Ok(hours)
    } else {
        Err("full scan time must be at least 1 hour".to_owned())
    }
}

fn parse_positive(value: &str) -> std::result::Result<f64, String> {
    let factor: f64 = value.parse().map_err(|_| "not a number".to_owned())?;
    if factor > 0.0 {
        Ok(factor)
    } else {
        Err("speed multiplier must be positive".to_owned())
    }
}

fn parse_slow_start(value: &str) -> std::result::Result<u64, String> {
    let seconds: u64 = value.parse().map_err(|_| "not a number".to_owned())?;
    if seconds >= 1 {
        Ok(seconds)
    } else {
        Err("slow start must be at least 1 second".to_owned())
    }
}

fn parse_drive_count(value: &str) -> std::result::Result<f64, String> {
    let count: f64 = value.parse().map_err(|_| "not a number".to_owned())?;
    if count >= 1.0 {
        Ok(count)
    } else {
        Err("drive count must be at least 1".to_owned())
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let default_level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize logging: {error}"))
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    // Worker threads are fail-stop: a confused local state is worse than
    // a restart from persisted state.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::abort();
    }));

    let defaults = Config::default();
    let config = Config {
        slow_scan_period: cli
            .full_scan_time
            .map(|hours| Duration::from_secs_f64(hours * 3600.0))
            .unwrap_or(defaults.slow_scan_period),
        slow_start: Duration::from_secs(cli.slow_start),
        target_extent_size: cli.target_extent_size.clone(),
        speed_multiplier: cli.speed_multiplier,
        drive_count: cli.drive_count,
        ..defaults
    };

    tracing::info!(
        scan_hours = config.slow_scan_period.as_secs_f64() / 3600.0,
        speed = config.speed_multiplier,
        drives = config.drive_count,
        store = %config.store_dir.display(),
        "defragd_starting"
    );

    Supervisor::run(config).context("supervisor failed")
}
