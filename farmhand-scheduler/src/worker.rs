//! Worker activities
//!
//! Each dispatch spawns one worker thread bound to one command and one
//! device. The worker loads configuration, runs the invocation, updates the
//! command's accumulated runtime, returns the device, and decides whether the
//! command loops back into the queue.
//!
//! Watchdog threads ride alongside a worker: invocation timeout (stop
//! request, then escalation after a short secondary grace), battery cutoff
//! (stop request only), and the hard-shutdown grace window (escalation on
//! expiry). All of them observe the worker through its [`InterruptToken`] and
//! state word, never by touching the thread itself.
//!
//! The worker is the error boundary: panics out of the configuration
//! factory, the invocation runner, or a listener are caught and handled like
//! invocation failures, so the device always comes back and the worker
//! always deregisters.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use farmhand_common::consts::{BATTERY_POLL_MS, TIMEOUT_ESCALATE_GRACE_MS};
use farmhand_common::{CommandStatus, SchedulerState, StopCause, WorkerState};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::device::{DeviceHandle, DeviceInfo};
use crate::error::InvocationError;
use crate::interrupt::InterruptToken;
use crate::invocation::{self, InvocationContext, InvocationOutcome};
use crate::scheduler::{SchedulerEvent, SchedulerInner};
use crate::stats::SchedulerStats;

/// Shared view of one live worker, held by the pool and its watchdogs.
pub(crate) struct WorkerHandle {
    pub(crate) id: u64,
    pub(crate) command: Arc<Command>,
    pub(crate) token: Arc<InterruptToken>,
    /// Grace window this worker gets on hard shutdown.
    pub(crate) shutdown_timeout_ms: u64,
    state: AtomicU32,
}

impl WorkerHandle {
    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(WorkerState::Done)
    }

    /// Advance the lifecycle and wake anything blocked on the token, so
    /// watchdogs re-check their exit condition promptly.
    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u32, Ordering::Release);
        self.token.wake();
    }
}

/// Live workers, keyed by worker id.
#[derive(Default)]
pub(crate) struct WorkerPool {
    workers: Mutex<HashMap<u64, Arc<WorkerHandle>>>,
}

impl WorkerPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }

    pub(crate) fn active(&self) -> Vec<Arc<WorkerHandle>> {
        self.workers.lock().values().cloned().collect()
    }

    fn insert(&self, handle: Arc<WorkerHandle>) {
        self.workers.lock().insert(handle.id, handle);
    }

    fn remove(&self, id: u64) {
        self.workers.lock().remove(&id);
    }
}

/// Dispatch one (command, device) pair onto a fresh worker thread.
pub(crate) fn spawn(sched: Arc<SchedulerInner>, command: Arc<Command>, device: DeviceHandle) {
    let id = sched.next_worker_id();
    let handle = Arc::new(WorkerHandle {
        id,
        shutdown_timeout_ms: command
            .options()
            .effective_shutdown_timeout_ms(sched.default_shutdown_timeout_ms),
        command,
        token: Arc::new(InterruptToken::new()),
        state: AtomicU32::new(WorkerState::Idle as u32),
    });
    sched.pool.insert(handle.clone());

    let mut device = Some(device);
    let spawned = thread::Builder::new()
        .name(format!("farmhand-worker-{id}"))
        .spawn({
            let sched = sched.clone();
            let handle = handle.clone();
            let device = device.take().expect("device present before spawn");
            move || run(sched, handle, device)
        });

    if let Err(error) = spawned {
        warn!(%error, worker = id, "failed to spawn worker thread");
        handle.command.set_status(CommandStatus::Terminated);
        sched.devices.release(device.take().expect("device present after failed spawn"));
        sched.pool.remove(id);
    }
}

fn run(sched: Arc<SchedulerInner>, handle: Arc<WorkerHandle>, device: DeviceHandle) {
    let command = handle.command.clone();
    debug!(
        worker = handle.id,
        command = command.id(),
        device = device.serial(),
        "worker starting"
    );
    handle.set_state(WorkerState::Starting);

    let created = catch_unwind(AssertUnwindSafe(|| {
        sched.factory.create_configuration_from_args(command.args())
    }));
    let configuration = match created {
        Ok(Ok(configuration)) => configuration,
        Ok(Err(error)) => {
            warn!(
                %error,
                command = command.id(),
                "configuration failed at dispatch; dropping command"
            );
            abort_start(&sched, &handle, device);
            return;
        }
        Err(_) => {
            warn!(
                command = command.id(),
                "configuration factory panicked; dropping command"
            );
            abort_start(&sched, &handle, device);
            return;
        }
    };

    // A hard shutdown that raced this dispatch must not miss the worker.
    if sched.hard_interrupt_requested() {
        handle.token.force(StopCause::Shutdown);
        spawn_grace_watchdog(sched.clone(), handle.clone());
    }

    handle.set_state(WorkerState::Running);
    SchedulerStats::bump(&sched.stats.invocations_started);

    let options = configuration.command_options();
    if options.invocation_timeout_ms > 0 {
        spawn_timeout_watchdog(
            sched.clone(),
            handle.clone(),
            Duration::from_millis(options.invocation_timeout_ms),
        );
    }
    if let Some(cutoff) = configuration.device_options().cutoff_battery {
        if let Some(info) = sched.devices.device(device.serial()) {
            spawn_battery_watchdog(handle.clone(), info, cutoff);
        }
    }

    let listeners = configuration.test_invocation_listeners();
    invocation::notify_started(listeners, &command, &device);

    let started = Instant::now();
    let result = {
        let ctx = InvocationContext::new(
            &command,
            &device,
            &configuration,
            &handle.token,
            &*sched,
        );
        catch_unwind(AssertUnwindSafe(|| sched.runner.invoke(&ctx))).unwrap_or_else(|panic| {
            Err(InvocationError::Failed(format!(
                "invocation panicked: {}",
                panic_message(panic.as_ref())
            )))
        })
    };
    let elapsed = started.elapsed();
    command.add_exec_time_ms(elapsed.as_millis() as u64);
    handle.set_state(WorkerState::Stopping);

    let outcome = match &result {
        Ok(()) => InvocationOutcome::Completed,
        Err(InvocationError::Interrupted) => InvocationOutcome::Interrupted(handle.token.cause()),
        Err(InvocationError::DeviceNotAvailable(_)) => InvocationOutcome::DeviceNotAvailable,
        Err(InvocationError::Failed(message)) => InvocationOutcome::Failed(message.clone()),
    };
    invocation::notify_ended(listeners, &command, &outcome);

    match &outcome {
        InvocationOutcome::Completed => {
            debug!(worker = handle.id, command = command.id(), ?elapsed, "invocation completed");
            SchedulerStats::bump(&sched.stats.invocations_completed);
        }
        InvocationOutcome::Interrupted(cause) => {
            info!(worker = handle.id, command = command.id(), ?cause, "invocation interrupted");
            SchedulerStats::bump(&sched.stats.invocations_interrupted);
        }
        InvocationOutcome::DeviceNotAvailable | InvocationOutcome::Failed(_) => {
            warn!(worker = handle.id, command = command.id(), ?outcome, "invocation failed");
            SchedulerStats::bump(&sched.stats.invocations_failed);
        }
    }

    // The device goes back to the pool; one that dropped out mid-run leaves
    // rotation instead.
    match &result {
        Err(InvocationError::DeviceNotAvailable(_)) => sched.devices.mark_unhealthy(device),
        _ => sched.devices.release(device),
    }

    maybe_requeue(&sched, &handle, &command, result.is_ok(), elapsed);
    finish(&sched, &handle);
}

/// Loop-mode accounting after an invocation: sleep out the remainder of
/// `min_loop_time_ms`, then requeue with the freshly accumulated runtime.
/// Requeue eligibility depends on the invocation outcome and the scheduler
/// state only; a stop request the invocation already survived (a battery dip
/// under shield, say) does not cancel the loop. Shutdown during the pause
/// terminates the command instead.
fn maybe_requeue(
    sched: &Arc<SchedulerInner>,
    handle: &Arc<WorkerHandle>,
    command: &Arc<Command>,
    completed: bool,
    elapsed: Duration,
) {
    let eligible = completed && command.loop_mode() && sched.state() == SchedulerState::Open;
    if !eligible {
        command.set_status(CommandStatus::Terminated);
        return;
    }

    let pause_ms = command
        .options()
        .min_loop_time_ms
        .saturating_sub(elapsed.as_millis() as u64);
    if pause_ms > 0 {
        command.set_status(CommandStatus::Sleeping);
        let deadline = Instant::now() + Duration::from_millis(pause_ms);
        handle
            .token
            .wait_until(deadline, || sched.state() != SchedulerState::Open);
    }
    if sched.state() != SchedulerState::Open {
        command.set_status(CommandStatus::Terminated);
        return;
    }

    command.set_status(CommandStatus::Queued);
    sched.queue.requeue(command.clone());
    SchedulerStats::bump(&sched.stats.commands_requeued);
    let _ = sched.events_tx.send(SchedulerEvent::CommandAdded);
    debug!(command = command.id(), total_ms = command.total_exec_time_ms(), "command requeued");
}

/// Teardown for a worker that never reached its invocation.
fn abort_start(sched: &Arc<SchedulerInner>, handle: &Arc<WorkerHandle>, device: DeviceHandle) {
    handle.command.set_status(CommandStatus::Terminated);
    sched.devices.release(device);
    SchedulerStats::bump(&sched.stats.invocations_failed);
    finish(sched, handle);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

fn finish(sched: &Arc<SchedulerInner>, handle: &Arc<WorkerHandle>) {
    sched.pool.remove(handle.id);
    handle.set_state(WorkerState::Done);
    let _ = sched.events_tx.send(SchedulerEvent::WorkerDone);
    debug!(worker = handle.id, "worker done");
}

/// Stop the invocation once it has been running `timeout`; escalate if it
/// keeps running through the secondary grace.
fn spawn_timeout_watchdog(sched: Arc<SchedulerInner>, handle: Arc<WorkerHandle>, timeout: Duration) {
    let spawned = thread::Builder::new()
        .name(format!("farmhand-timeout-{}", handle.id))
        .spawn({
            let handle = handle.clone();
            move || {
            let deadline = Instant::now() + timeout;
            if handle.token.wait_until(deadline, || !handle.state().is_invoking()) {
                return;
            }
            info!(worker = handle.id, ?timeout, "invocation timeout; requesting stop");
            handle.token.force(StopCause::InvocationTimeout);

            let grace = Instant::now() + Duration::from_millis(TIMEOUT_ESCALATE_GRACE_MS);
            if handle.token.wait_until(grace, || !handle.state().is_invoking()) {
                return;
            }
            warn!(worker = handle.id, "invocation ignored timeout stop; forcing termination");
            SchedulerStats::bump(&sched.stats.escalations);
            handle.token.escalate(StopCause::InvocationTimeout);
            }
        });
    if let Err(error) = spawned {
        warn!(%error, worker = handle.id, "failed to spawn timeout watchdog");
    }
}

/// Poll the device battery while the invocation runs; request a stop once it
/// drops below the cutoff. No escalation: a protected worker finishes its run.
fn spawn_battery_watchdog(handle: Arc<WorkerHandle>, info: Arc<DeviceInfo>, cutoff: u8) {
    let spawned = thread::Builder::new()
        .name(format!("farmhand-battery-{}", handle.id))
        .spawn({
            let handle = handle.clone();
            move || loop {
                let next_poll = Instant::now() + Duration::from_millis(BATTERY_POLL_MS);
                if handle.token.wait_until(next_poll, || !handle.state().is_invoking()) {
                    return;
                }
                if let Some(level) = info.battery_level() {
                    if level < cutoff {
                        info!(
                            worker = handle.id,
                            serial = info.serial(),
                            level,
                            cutoff,
                            "battery below cutoff; requesting stop"
                        );
                        handle.token.force(StopCause::Battery);
                        return;
                    }
                }
            }
        });
    if let Err(error) = spawned {
        warn!(%error, worker = handle.id, "failed to spawn battery watchdog");
    }
}

/// Hard-shutdown grace: give the worker its window to finish cooperatively,
/// then tear it down.
pub(crate) fn spawn_grace_watchdog(sched: Arc<SchedulerInner>, handle: Arc<WorkerHandle>) {
    let spawned = thread::Builder::new()
        .name(format!("farmhand-grace-{}", handle.id))
        .spawn({
            let handle = handle.clone();
            move || {
                let deadline = Instant::now() + Duration::from_millis(handle.shutdown_timeout_ms);
                if handle.token.wait_until(deadline, || handle.state().is_terminal()) {
                    return;
                }
                warn!(
                    worker = handle.id,
                    grace_ms = handle.shutdown_timeout_ms,
                    "shutdown grace expired; forcing termination"
                );
                SchedulerStats::bump(&sched.stats.escalations);
                handle.token.escalate(StopCause::Shutdown);
            }
        });
    if let Err(error) = spawned {
        warn!(%error, worker = handle.id, "failed to spawn shutdown grace watchdog");
    }
}
