//! Length-prefixed echo server on the mux-net framework.
//!
//! Frames are an 8-byte big-endian length followed by the body; every
//! frame is echoed back. Stop with Ctrl+C (SIGINT) or SIGTERM.
//!
//! ```text
//! cargo run --example echo_server -- --port 7000 --workers 4
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::Parser;
use tracing::{debug, error, info};

use mux_net::{
    LogMaintenance, Result, ScheduleEntry, Scheduler, Service, ServiceConfig, lifecycle,
    startup_schedule,
};
use mux_net_test::EchoHandler;

#[derive(Parser)]
#[command(about = "mux-net echo server")]
struct Args {
    #[arg(long, default_value_t = 7000)]
    port: u16,
    #[arg(long, default_value = "")]
    bind: String,
    #[arg(long, default_value_t = 4)]
    workers: usize,
    #[arg(long, default_value_t = 1)]
    accept_threads: usize,
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
    #[arg(long, default_value_t = 1024)]
    max_connections: usize,
}

/// Minimal scheduler collaborator: one thread ticking every second,
/// firing entries whose interval elapsed. Daily entries aligned to a
/// time of day start at their next wall-clock occurrence.
struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn start(&self, mut entries: Vec<ScheduleEntry>) -> Result<()> {
        std::thread::spawn(move || {
            let mut next: Vec<Duration> = entries
                .iter()
                .map(|e| match e.first_run {
                    Some(t) => seconds_until(t.hour, t.minute, t.second),
                    None => e.interval,
                })
                .collect();
            while lifecycle::running() {
                std::thread::sleep(Duration::from_secs(1));
                for (entry, due) in entries.iter_mut().zip(next.iter_mut()) {
                    *due = due.saturating_sub(Duration::from_secs(1));
                    if due.is_zero() {
                        (entry.job)();
                        *due = entry.interval;
                    }
                }
            }
        });
        Ok(())
    }
}

fn seconds_until(hour: u8, minute: u8, second: u8) -> Duration {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        % 86400;
    let target = u64::from(hour) * 3600 + u64::from(minute) * 60 + u64::from(second);
    Duration::from_secs((target + 86400 - now) % 86400)
}

/// Log maintenance backed by tracing; the fmt subscriber writes
/// unbuffered, so flush and rotation are informational here.
struct TracingLog;

impl LogMaintenance for TracingLog {
    fn sync_buffer(&self) {
        debug!("log buffer sync");
    }
    fn set_rotate_time_format(&self, format: &str) {
        debug!(format, "rotate time format set");
    }
    fn notify_rotate(&self) {
        info!("log rotation requested");
    }
    fn set_keep_days(&self, days: u32) {
        debug!(days, "log keep days set");
    }
    fn delete_old_files(&self) {
        info!("old log cleanup requested");
    }
}

fn run(args: &Args) -> Result<()> {
    lifecycle::install_signal_handlers()?;

    let config = ServiceConfig {
        outer_bind_addr: args.bind.clone(),
        outer_port: args.port,
        accept_threads: args.accept_threads,
        work_threads: args.workers,
        max_connections: args.max_connections,
        net_timeout: Duration::from_secs(args.timeout_secs),
        ..Default::default()
    };

    let (handler, counters) = EchoHandler::new();
    let mut service = Service::init(config.clone(), handler)?;
    service.listen()?;
    startup_schedule(&config, Arc::new(TracingLog), &ThreadScheduler)?;

    info!(addr = ?service.outer_addr(), "echo server ready");
    service.run_accept_loop()?;

    info!(
        requests = counters.requests.load(std::sync::atomic::Ordering::SeqCst),
        connections = counters.accepted.load(std::sync::atomic::Ordering::SeqCst),
        "shutting down"
    );
    service.destroy();
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "startup failed");
            ExitCode::from(e.exit_code().clamp(1, 255) as u8)
        }
    }
}
