//! Fair scheduling demonstration
//!
//! Runs two loop-mode commands with different invocation durations on a
//! shared device pool and reports how often each one got to run. With the
//! slow configuration taking twice as long as the fast one, the fast one
//! should complete about twice as many invocations.

use clap::Parser;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use farmhand_scheduler::{
    argv, DeviceInfo, DeviceManager, InvocationContext, InvocationError, InvocationRunner,
    Scheduler,
};

/// Fair scheduling demonstration
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Invocation duration of the fast configuration (ms)
    #[arg(long, default_value_t = 100)]
    fast_ms: u64,

    /// Invocation duration of the slow configuration (ms)
    #[arg(long, default_value_t = 200)]
    slow_ms: u64,

    /// Number of devices in the pool
    #[arg(short = 'n', long, default_value_t = 1)]
    devices: usize,

    /// Duration to run the demonstration (seconds)
    #[arg(short, long, default_value_t = 10)]
    duration: u64,
}

/// Sleeps for a per-test duration and counts completed invocations.
struct SleeperRunner {
    durations: HashMap<String, u64>,
    counts: Mutex<HashMap<String, u64>>,
}

impl InvocationRunner for SleeperRunner {
    fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<(), InvocationError> {
        let test = ctx.command().options().test.clone();
        let ms = self.durations.get(&test).copied().unwrap_or(100);
        ctx.set_interruptible(true);
        ctx.sleep(Duration::from_millis(ms))?;
        *self.counts.lock().entry(test).or_insert(0) += 1;
        Ok(())
    }
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt().with_env_filter("info").init();

    tracing::info!("fair scheduling demonstration");
    tracing::info!("  fast invocation: {}ms", args.fast_ms);
    tracing::info!("  slow invocation: {}ms", args.slow_ms);
    tracing::info!("  {} device(s), {} second run", args.devices, args.duration);

    let devices = Arc::new(DeviceManager::new());
    for i in 0..args.devices {
        devices.register(DeviceInfo::new(format!("bench-{i}"), "bench", true));
    }

    let runner = Arc::new(SleeperRunner {
        durations: HashMap::from([
            ("fast".to_string(), args.fast_ms),
            ("slow".to_string(), args.slow_ms),
        ]),
        counts: Mutex::new(HashMap::new()),
    });

    let scheduler = Scheduler::builder(runner.clone()).devices(devices).build();
    scheduler.start();
    scheduler
        .add_command(&argv(&["fast", "--loop"]))
        .expect("queue fast command");
    scheduler
        .add_command(&argv(&["slow", "--loop"]))
        .expect("queue slow command");

    thread::sleep(Duration::from_secs(args.duration));

    scheduler.shutdown_hard();
    if !scheduler.join(Some(Duration::from_secs(30))) {
        tracing::warn!("scheduler did not close within 30s");
        std::process::exit(1);
    }

    let counts = runner.counts.lock();
    let fast = counts.get("fast").copied().unwrap_or(0);
    let slow = counts.get("slow").copied().unwrap_or(0);

    tracing::info!("=== Results ===");
    tracing::info!("fast invocations: {fast}");
    tracing::info!("slow invocations: {slow}");
    if slow > 0 {
        tracing::info!("ratio: {:.2}", fast as f64 / slow as f64);
    }
    tracing::info!("stats: {:?}", scheduler.stats());
}
