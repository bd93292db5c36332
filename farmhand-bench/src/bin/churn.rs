//! Dispatch churn stress
//!
//! Floods the scheduler with short one-shot commands across a device pool
//! and measures how fast the queue drains. Exercises the dispatch path,
//! device allocation, and worker teardown under load.

use clap::Parser;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use farmhand_scheduler::{
    argv, DeviceInfo, DeviceManager, InvocationContext, InvocationError, InvocationRunner,
    Scheduler,
};

/// Dispatch churn stress
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of devices in the pool
    #[arg(short = 'n', long, default_value_t = 4)]
    devices: usize,

    /// Number of commands to push through
    #[arg(short = 'c', long, default_value_t = 200)]
    commands: u64,

    /// Simulated work per invocation (ms)
    #[arg(long, default_value_t = 5)]
    work_ms: u64,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 120)]
    timeout: u64,
}

struct WorkRunner {
    work_ms: u64,
}

impl InvocationRunner for WorkRunner {
    fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<(), InvocationError> {
        ctx.set_interruptible(true);
        ctx.sleep(Duration::from_millis(self.work_ms))?;
        Ok(())
    }
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt().with_env_filter("info").init();

    tracing::info!("dispatch churn stress");
    tracing::info!(
        "  {} commands x {}ms across {} device(s)",
        args.commands,
        args.work_ms,
        args.devices
    );

    let devices = Arc::new(DeviceManager::new());
    for i in 0..args.devices {
        devices.register(DeviceInfo::new(format!("bench-{i}"), "bench", true));
    }

    let scheduler = Scheduler::builder(Arc::new(WorkRunner {
        work_ms: args.work_ms,
    }))
    .devices(devices)
    .build();
    scheduler.start();

    let started = Instant::now();
    for i in 0..args.commands {
        scheduler
            .add_command(&argv(&[format!("churn-{i}").as_str()]))
            .expect("queue command");
    }

    let deadline = started + Duration::from_secs(args.timeout);
    while scheduler.stats().invocations_completed < args.commands {
        if Instant::now() > deadline {
            tracing::warn!(
                "only {} of {} invocations completed before timeout",
                scheduler.stats().invocations_completed,
                args.commands
            );
            std::process::exit(1);
        }
        thread::sleep(Duration::from_millis(10));
    }
    let elapsed = started.elapsed();

    scheduler.shutdown();
    scheduler.join(Some(Duration::from_secs(10)));

    let per_sec = args.commands as f64 / elapsed.as_secs_f64();
    tracing::info!("=== Results ===");
    tracing::info!("drained {} commands in {:.2?}", args.commands, elapsed);
    tracing::info!("throughput: {per_sec:.1} invocations/sec");
    tracing::info!("stats: {:?}", scheduler.stats());
}
