//! Integration tests for the Farmhand scheduler
//!
//! These drive the full scheduler against registered fake devices and
//! scripted invocation runners. No real hardware and no external services;
//! everything observable goes through listeners, counters, and the control
//! API.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use farmhand_scheduler::{
    argv, ArgvConfigurationFactory, Command, DeviceHandle, DeviceInfo, DeviceManager,
    InvocationContext, InvocationError, InvocationListener, InvocationOutcome, InvocationRunner,
    Scheduler, SchedulerError,
};

type Script = Box<dyn Fn(&InvocationContext<'_>) -> Result<(), InvocationError> + Send + Sync>;

/// Runner driven by a test-supplied closure, with run accounting.
struct ScriptedRunner {
    script: Script,
    runs: AtomicU64,
    interrupted_runs: AtomicU64,
}

impl ScriptedRunner {
    fn new(
        script: impl Fn(&InvocationContext<'_>) -> Result<(), InvocationError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            runs: AtomicU64::new(0),
            interrupted_runs: AtomicU64::new(0),
        })
    }

    fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    fn run_interrupted(&self) -> bool {
        self.interrupted_runs.load(Ordering::SeqCst) > 0
    }
}

impl InvocationRunner for ScriptedRunner {
    fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<(), InvocationError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let result = (self.script)(ctx);
        if matches!(result, Err(InvocationError::Interrupted)) {
            self.interrupted_runs.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

/// Register `n` identical physical devices.
fn farm(n: usize) -> Arc<DeviceManager> {
    let devices = Arc::new(DeviceManager::new());
    for i in 0..n {
        devices.register(DeviceInfo::new(format!("SN{i}"), "widget", false));
    }
    devices
}

fn started_scheduler(runner: Arc<ScriptedRunner>, devices: Arc<DeviceManager>) -> Scheduler {
    let scheduler = Scheduler::builder(runner).devices(devices).build();
    scheduler.start();
    scheduler
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Two loop-mode commands on one device, one twice as slow as the other: the
/// fast one must run about twice as often.
#[test]
fn test_fair_scheduling_between_fast_and_slow_loops() {
    let counts: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));
    let runner = ScriptedRunner::new({
        let counts = counts.clone();
        move |ctx: &InvocationContext<'_>| {
            let test = ctx.command().options().test.clone();
            let ms = if test == "fast" { 60 } else { 120 };
            ctx.set_interruptible(true);
            ctx.sleep(Duration::from_millis(ms))?;
            *counts.lock().entry(test).or_insert(0) += 1;
            Ok(())
        }
    });

    let scheduler = started_scheduler(runner, farm(1));
    scheduler.add_command(&argv(&["fast", "--loop"])).unwrap();
    scheduler.add_command(&argv(&["slow", "--loop"])).unwrap();

    let slow_done = wait_for(Duration::from_secs(30), || {
        counts.lock().get("slow").copied().unwrap_or(0) >= 12
    });
    assert!(slow_done, "slow command failed to accumulate runs");

    scheduler.shutdown_hard();
    assert!(scheduler.join(Some(Duration::from_secs(10))));

    let counts = counts.lock();
    let fast = counts.get("fast").copied().unwrap_or(0) as f64;
    let slow = counts.get("slow").copied().unwrap_or(0) as f64;
    let ratio = fast / slow;
    assert!(
        (1.5..=2.5).contains(&ratio),
        "expected fast to run about twice as often, got fast={fast} slow={slow}"
    );
}

/// Low battery with a protected worker: the stop request is deferred and the
/// invocation completes normally.
#[test]
fn test_low_battery_completes_protected_invocation() {
    let runner = ScriptedRunner::new(|ctx: &InvocationContext<'_>| {
        let _shield = ctx.shield();
        ctx.sleep(Duration::from_millis(600))?;
        Ok(())
    });

    let devices = farm(1);
    devices.set_battery("SN0", 10);
    let scheduler = started_scheduler(runner.clone(), devices);
    scheduler
        .add_command(&argv(&["smoke", "--cutoff-battery", "20"]))
        .unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        scheduler.stats().invocations_completed == 1
    }));
    assert!(!runner.run_interrupted());

    scheduler.shutdown();
    assert!(scheduler.join(Some(Duration::from_secs(5))));
}

/// Low battery with an interruptible worker: the invocation is interrupted
/// and the command is not requeued despite loop mode.
#[test]
fn test_low_battery_interrupts_interruptible_invocation() {
    let runner = ScriptedRunner::new(|ctx: &InvocationContext<'_>| {
        ctx.set_interruptible(true);
        ctx.sleep(Duration::from_secs(30))?;
        Ok(())
    });

    let devices = farm(1);
    devices.set_battery("SN0", 10);
    let scheduler = started_scheduler(runner.clone(), devices);
    scheduler
        .add_command(&argv(&["smoke", "--loop", "--cutoff-battery", "20"]))
        .unwrap();

    assert!(wait_for(Duration::from_secs(10), || runner.run_interrupted()));
    assert!(wait_for(Duration::from_secs(5), || {
        scheduler.active_invocation_count() == 0
    }));
    assert_eq!(runner.runs(), 1, "interrupted command must not loop");
    assert_eq!(scheduler.queued_command_count(), 0);

    scheduler.shutdown();
    assert!(scheduler.join(Some(Duration::from_secs(5))));
}

/// A loop-mode invocation that survives a battery dip under shield keeps
/// looping; the stale stop request does not cancel the loop.
#[test]
fn test_battery_dip_survived_under_shield_still_loops() {
    let runner = ScriptedRunner::new(|ctx: &InvocationContext<'_>| {
        let _shield = ctx.shield();
        ctx.sleep(Duration::from_millis(400))?;
        Ok(())
    });

    let devices = farm(1);
    devices.set_battery("SN0", 10);
    let scheduler = started_scheduler(runner.clone(), devices);
    scheduler
        .add_command(&argv(&["smoke", "--loop", "--cutoff-battery", "20"]))
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || {
            scheduler.stats().invocations_completed >= 2
        }),
        "survived command must keep looping"
    );
    assert!(!runner.run_interrupted());

    scheduler.shutdown_hard();
    assert!(scheduler.join(Some(Duration::from_secs(10))));
}

/// Hard shutdown against an interruptible worker stops it promptly and the
/// scheduler joins cleanly.
#[test]
fn test_hard_shutdown_interrupts_interruptible_worker() {
    let runner = ScriptedRunner::new(|ctx: &InvocationContext<'_>| {
        ctx.set_interruptible(true);
        ctx.sleep(Duration::from_secs(30))?;
        Ok(())
    });

    let scheduler = started_scheduler(runner.clone(), farm(1));
    scheduler.add_command(&argv(&["smoke", "--loop"])).unwrap();

    assert!(wait_for(Duration::from_secs(10), || runner.runs() == 1));
    thread::sleep(Duration::from_millis(100));

    scheduler.shutdown_hard();
    assert!(scheduler.join(Some(Duration::from_secs(5))));
    assert!(runner.run_interrupted());
}

/// Hard shutdown against a protected worker that finishes inside the grace
/// window: the invocation completes normally.
#[test]
fn test_hard_shutdown_waits_out_protected_worker_within_grace() {
    let runner = ScriptedRunner::new(|ctx: &InvocationContext<'_>| {
        let _shield = ctx.shield();
        for _ in 0..5 {
            ctx.sleep(Duration::from_millis(200))?;
        }
        Ok(())
    });

    let scheduler = started_scheduler(runner.clone(), farm(1));
    scheduler.add_command(&argv(&["smoke"])).unwrap();

    assert!(wait_for(Duration::from_secs(10), || runner.runs() == 1));
    thread::sleep(Duration::from_millis(100));

    scheduler.shutdown_hard();
    assert!(scheduler.join(Some(Duration::from_secs(10))));
    assert!(!runner.run_interrupted());
    assert_eq!(scheduler.stats().invocations_completed, 1);
}

/// Hard shutdown against a protected worker that outlives the grace window:
/// escalation tears it down anyway.
#[test]
fn test_hard_shutdown_escalates_when_grace_expires() {
    let runner = ScriptedRunner::new(|ctx: &InvocationContext<'_>| {
        let _shield = ctx.shield();
        for _ in 0..15 {
            ctx.sleep(Duration::from_millis(200))?;
        }
        Ok(())
    });

    let scheduler = started_scheduler(runner.clone(), farm(1));
    scheduler
        .add_command(&argv(&["smoke", "--shutdown-timeout-ms", "500"]))
        .unwrap();

    assert!(wait_for(Duration::from_secs(10), || runner.runs() == 1));
    thread::sleep(Duration::from_millis(100));

    scheduler.shutdown_hard();
    assert!(scheduler.join(Some(Duration::from_secs(10))));
    assert!(runner.run_interrupted());
    assert!(scheduler.stats().escalations >= 1);
}

/// Per-invocation timeout stops a long run.
#[test]
fn test_invocation_timeout_interrupts_worker() {
    let runner = ScriptedRunner::new(|ctx: &InvocationContext<'_>| {
        ctx.set_interruptible(true);
        ctx.sleep(Duration::from_secs(30))?;
        Ok(())
    });

    let scheduler = started_scheduler(runner.clone(), farm(1));
    let started = Instant::now();
    scheduler
        .add_command(&argv(&["smoke", "--loop", "--invocation-timeout-ms", "300"]))
        .unwrap();

    assert!(wait_for(Duration::from_secs(10), || runner.run_interrupted()));
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "timeout stop arrived too late"
    );
    assert!(wait_for(Duration::from_secs(5), || {
        scheduler.active_invocation_count() == 0
    }));
    assert_eq!(runner.runs(), 1, "timed-out command must not loop");

    scheduler.shutdown();
    assert!(scheduler.join(Some(Duration::from_secs(5))));
}

/// Commands with equal accumulated runtime dispatch in the order they were
/// added.
#[test]
fn test_equal_key_commands_dispatch_in_add_order() {
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let runner = ScriptedRunner::new({
        let order = order.clone();
        move |ctx: &InvocationContext<'_>| {
            order.lock().push(ctx.command().options().test.clone());
            ctx.set_interruptible(true);
            ctx.sleep(Duration::from_millis(30))?;
            Ok(())
        }
    });

    let scheduler = Scheduler::builder(runner).devices(farm(1)).build();
    scheduler.add_command(&argv(&["a"])).unwrap();
    scheduler.add_command(&argv(&["b"])).unwrap();
    scheduler.add_command(&argv(&["c"])).unwrap();
    scheduler.start();

    assert!(wait_for(Duration::from_secs(10), || order.lock().len() == 3));
    assert_eq!(*order.lock(), vec!["a", "b", "c"]);

    scheduler.shutdown();
    assert!(scheduler.join(Some(Duration::from_secs(5))));
}

/// No two workers ever hold the same device.
#[test]
fn test_no_two_workers_share_a_device() {
    let in_use: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let violated = Arc::new(AtomicBool::new(false));

    let runner = ScriptedRunner::new({
        let in_use = in_use.clone();
        let violated = violated.clone();
        move |ctx: &InvocationContext<'_>| {
            let serial = ctx.device().serial().to_string();
            if !in_use.lock().insert(serial.clone()) {
                violated.store(true, Ordering::SeqCst);
            }
            ctx.set_interruptible(true);
            let result = ctx.sleep(Duration::from_millis(40));
            in_use.lock().remove(&serial);
            result
        }
    });

    let scheduler = started_scheduler(runner.clone(), farm(2));
    for i in 0..8 {
        scheduler.add_command(&argv(&[&format!("cmd{i}")])).unwrap();
    }

    assert!(wait_for(Duration::from_secs(10), || runner.runs() == 8));
    assert!(!violated.load(Ordering::SeqCst), "device lease was shared");

    scheduler.shutdown();
    assert!(scheduler.join(Some(Duration::from_secs(5))));
}

/// `shutdown()` observed before `add_command` makes the add fail.
#[test]
fn test_add_command_fails_after_shutdown() {
    let runner = ScriptedRunner::new(|_ctx: &InvocationContext<'_>| Ok(()));
    let scheduler = started_scheduler(runner, farm(1));

    scheduler.shutdown();
    let result = scheduler.add_command(&argv(&["smoke"]));
    assert!(matches!(result, Err(SchedulerError::Closed)));

    assert!(scheduler.join(Some(Duration::from_secs(5))));
}

/// Bad arguments are rejected synchronously and nothing is queued.
#[test]
fn test_config_error_surfaces_synchronously() {
    let runner = ScriptedRunner::new(|_ctx: &InvocationContext<'_>| Ok(()));
    let scheduler = Scheduler::builder(runner).devices(farm(1)).build();

    assert!(matches!(
        scheduler.add_command(&argv(&["smoke", "--frobnicate"])),
        Err(SchedulerError::Config(_))
    ));
    assert!(matches!(
        scheduler.add_command(&[]),
        Err(SchedulerError::Config(_))
    ));
    assert_eq!(scheduler.queued_command_count(), 0);
    assert_eq!(scheduler.stats().commands_rejected, 2);
}

/// `remove_all_commands` drains the queue without touching running workers.
#[test]
fn test_remove_all_commands_drains_queue_only() {
    let runner = ScriptedRunner::new(|ctx: &InvocationContext<'_>| {
        ctx.set_interruptible(true);
        ctx.sleep(Duration::from_millis(600))?;
        Ok(())
    });

    // One device: the first command runs, the rest stay queued.
    let scheduler = started_scheduler(runner.clone(), farm(1));
    for i in 0..4 {
        scheduler.add_command(&argv(&[&format!("cmd{i}")])).unwrap();
    }

    assert!(wait_for(Duration::from_secs(10), || {
        scheduler.active_invocation_count() == 1
    }));
    scheduler.remove_all_commands();
    assert_eq!(scheduler.queued_command_count(), 0);

    // The in-flight invocation still finishes.
    assert!(wait_for(Duration::from_secs(10), || {
        scheduler.stats().invocations_completed == 1
    }));
    assert_eq!(runner.runs(), 1);

    scheduler.shutdown();
    assert!(scheduler.join(Some(Duration::from_secs(5))));
}

/// A device that drops out mid-run leaves the rotation and its command is
/// not requeued.
#[test]
fn test_device_not_available_removes_device_and_command() {
    let runner = ScriptedRunner::new(|ctx: &InvocationContext<'_>| {
        Err(InvocationError::DeviceNotAvailable(
            ctx.device().serial().to_string(),
        ))
    });

    let scheduler = started_scheduler(runner.clone(), farm(1));
    scheduler.add_command(&argv(&["smoke", "--loop"])).unwrap();

    assert!(wait_for(Duration::from_secs(10), || runner.runs() == 1));
    assert!(wait_for(Duration::from_secs(5), || {
        scheduler.active_invocation_count() == 0
    }));
    assert_eq!(scheduler.queued_command_count(), 0, "dead-device command must not loop");
    assert_eq!(scheduler.devices().free_count(), 0, "device must leave rotation");

    scheduler.shutdown();
    assert!(scheduler.join(Some(Duration::from_secs(5))));
}

/// An invocation can split itself by enqueueing derived commands.
#[test]
fn test_invocation_can_reschedule_derived_commands() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let runner = ScriptedRunner::new({
        let seen = seen.clone();
        move |ctx: &InvocationContext<'_>| {
            let test = ctx.command().options().test.clone();
            seen.lock().push(test.clone());
            if test == "parent" {
                ctx.reschedule(&argv(&["shard-0"])).expect("queue shard");
                ctx.reschedule(&argv(&["shard-1"])).expect("queue shard");
            }
            Ok(())
        }
    });

    let scheduler = started_scheduler(runner.clone(), farm(1));
    scheduler.add_command(&argv(&["parent"])).unwrap();

    assert!(wait_for(Duration::from_secs(10), || runner.runs() == 3));
    let seen = seen.lock().clone();
    assert!(seen.contains(&"shard-0".to_string()));
    assert!(seen.contains(&"shard-1".to_string()));

    scheduler.shutdown();
    assert!(scheduler.join(Some(Duration::from_secs(5))));
}

/// Loop-mode commands are paced by the minimum loop time.
#[test]
fn test_min_loop_time_paces_requeues() {
    let starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let runner = ScriptedRunner::new({
        let starts = starts.clone();
        move |ctx: &InvocationContext<'_>| {
            starts.lock().push(Instant::now());
            ctx.set_interruptible(true);
            ctx.sleep(Duration::from_millis(50))?;
            Ok(())
        }
    });

    let scheduler = started_scheduler(runner, farm(1));
    scheduler
        .add_command(&argv(&["smoke", "--loop", "--min-loop-time-ms", "300"]))
        .unwrap();

    assert!(wait_for(Duration::from_secs(10), || starts.lock().len() >= 3));
    scheduler.shutdown_hard();
    assert!(scheduler.join(Some(Duration::from_secs(5))));

    let starts = starts.lock();
    for pair in starts.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(250),
            "invocations spaced {gap:?}, expected at least the loop minimum"
        );
    }
}

/// A panicking invocation runner is contained: the device returns to the
/// pool, the command does not loop, and the scheduler still closes.
#[test]
fn test_panicking_runner_releases_device_and_scheduler_closes() {
    let runner = ScriptedRunner::new(|_ctx: &InvocationContext<'_>| -> Result<(), InvocationError> {
        panic!("runner blew up");
    });

    let devices = farm(1);
    let scheduler = started_scheduler(runner, devices.clone());
    scheduler.add_command(&argv(&["smoke", "--loop"])).unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        scheduler.stats().invocations_failed == 1
    }));
    assert!(wait_for(Duration::from_secs(5), || {
        scheduler.active_invocation_count() == 0
    }));
    assert_eq!(scheduler.queued_command_count(), 0, "panicked command must not loop");
    assert_eq!(devices.free_count(), 1, "device must return to the pool");

    scheduler.shutdown();
    assert!(
        scheduler.join(Some(Duration::from_secs(5))),
        "scheduler must still close after a runner panic"
    );
}

/// Listeners attached through the configuration factory observe every
/// invocation boundary.
#[test]
fn test_listeners_observe_invocation_boundaries() {
    #[derive(Default)]
    struct CountingListener {
        started: AtomicU64,
        completed: AtomicU64,
    }

    impl InvocationListener for CountingListener {
        fn on_invocation_started(&self, _command: &Command, _device: &DeviceHandle) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_invocation_ended(&self, _command: &Command, outcome: &InvocationOutcome) {
            if matches!(outcome, InvocationOutcome::Completed) {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    let listener = Arc::new(CountingListener::default());
    let runner = ScriptedRunner::new(|ctx: &InvocationContext<'_>| {
        ctx.set_interruptible(true);
        ctx.sleep(Duration::from_millis(20))?;
        Ok(())
    });

    let scheduler = Scheduler::builder(runner)
        .devices(farm(1))
        .factory(Arc::new(
            ArgvConfigurationFactory::new().with_listener(listener.clone()),
        ))
        .build();
    scheduler.start();
    scheduler.add_command(&argv(&["a"])).unwrap();
    scheduler.add_command(&argv(&["b"])).unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        listener.completed.load(Ordering::SeqCst) == 2
    }));
    assert_eq!(listener.started.load(Ordering::SeqCst), 2);

    scheduler.shutdown();
    assert!(scheduler.join(Some(Duration::from_secs(5))));
}

/// `join` times out while a worker is still running, then succeeds.
#[test]
fn test_join_times_out_then_completes() {
    let runner = ScriptedRunner::new(|ctx: &InvocationContext<'_>| {
        let _shield = ctx.shield();
        ctx.sleep(Duration::from_millis(800))?;
        Ok(())
    });

    let scheduler = started_scheduler(runner, farm(1));
    scheduler.add_command(&argv(&["smoke"])).unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        scheduler.active_invocation_count() == 1
    }));
    scheduler.shutdown();
    assert!(!scheduler.join(Some(Duration::from_millis(100))));
    assert!(scheduler.join(Some(Duration::from_secs(10))));
    assert_eq!(scheduler.active_invocation_count(), 0);
}
