//! Command scheduler
//!
//! One coordinator thread matches head-of-queue commands to free devices and
//! hands each pair to a worker. The coordinator wakes on command adds, worker
//! completions, device-pool changes, shutdown requests, or a bounded poll
//! interval, whichever comes first.
//!
//! Shutdown runs `OPEN -> CLOSING -> CLOSED`: `shutdown()` stops dispatching
//! and lets workers drain; `shutdown_hard()` additionally requests a stop
//! from every active worker and arms the grace window; `join()` waits for
//! `CLOSED`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use crossbeam::select;
use farmhand_common::consts::{DEFAULT_SHUTDOWN_TIMEOUT_MS, DISPATCH_POLL_MS};
use farmhand_common::{CommandStatus, SchedulerState, StopCause};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::command::Command;
use crate::config::{ArgvConfigurationFactory, ConfigurationFactory};
use crate::device::DeviceManager;
use crate::error::{Result, SchedulerError};
use crate::invocation::{InvocationRunner, Rescheduler};
use crate::queue::CommandQueue;
use crate::stats::{SchedulerStats, StatsSnapshot};
use crate::worker::{self, WorkerPool};

/// Wakeup reasons delivered to the coordinator.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SchedulerEvent {
    CommandAdded,
    WorkerDone,
    Shutdown,
}

/// State shared between the control API, the coordinator, and the workers.
pub(crate) struct SchedulerInner {
    pub(crate) factory: Arc<dyn ConfigurationFactory>,
    pub(crate) runner: Arc<dyn InvocationRunner>,
    pub(crate) devices: Arc<DeviceManager>,
    pub(crate) queue: CommandQueue,
    pub(crate) pool: WorkerPool,
    pub(crate) stats: SchedulerStats,
    pub(crate) default_shutdown_timeout_ms: u64,
    pub(crate) events_tx: Sender<SchedulerEvent>,
    events_rx: Receiver<SchedulerEvent>,
    state: AtomicU32,
    state_lock: Mutex<()>,
    state_cv: Condvar,
    hard_armed: AtomicBool,
    next_command_id: AtomicU64,
    next_worker_id: AtomicU64,
}

impl SchedulerInner {
    pub(crate) fn state(&self) -> SchedulerState {
        SchedulerState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(SchedulerState::Closed)
    }

    fn set_state(&self, state: SchedulerState) {
        let _guard = self.state_lock.lock();
        self.state.store(state as u32, Ordering::Release);
        self.state_cv.notify_all();
    }

    pub(crate) fn next_worker_id(&self) -> u64 {
        self.next_worker_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether a hard shutdown has interrupted the worker fleet.
    pub(crate) fn hard_interrupt_requested(&self) -> bool {
        self.hard_armed.load(Ordering::Acquire)
    }

    fn add_command_impl(&self, args: &[String]) -> Result<()> {
        if !self.state().accepts_commands() {
            return Err(SchedulerError::Closed);
        }
        let configuration = match self.factory.create_configuration_from_args(args) {
            Ok(configuration) => configuration,
            Err(error) => {
                SchedulerStats::bump(&self.stats.commands_rejected);
                return Err(error.into());
            }
        };

        let id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
        let command = Arc::new(Command::new(id, args.to_vec(), &configuration));
        debug!(command = id, args = ?command.args(), "command queued");
        self.queue.add(command);
        SchedulerStats::bump(&self.stats.commands_added);
        let _ = self.events_tx.send(SchedulerEvent::CommandAdded);
        Ok(())
    }
}

impl Rescheduler for SchedulerInner {
    fn schedule(&self, args: &[String]) -> Result<()> {
        self.add_command_impl(args)
    }
}

/// The command scheduler control surface.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    started: AtomicBool,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start building a scheduler around an invocation runner.
    pub fn builder(runner: Arc<dyn InvocationRunner>) -> SchedulerBuilder {
        SchedulerBuilder::new(runner)
    }

    /// Spawn the coordinator. Idempotent after the first call.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        let join = thread::Builder::new()
            .name("farmhand-scheduler".to_string())
            .spawn(move || coordinator_loop(inner))
            .expect("failed to spawn scheduler coordinator thread");
        *self.coordinator.lock() = Some(join);
    }

    /// Validate and enqueue a command. Fails if the scheduler is shutting
    /// down or the arguments do not parse.
    pub fn add_command(&self, args: &[String]) -> Result<()> {
        self.inner.add_command_impl(args)
    }

    /// Drop every pending command. Running workers are untouched.
    pub fn remove_all_commands(&self) {
        let drained = self.inner.queue.drain();
        for command in &drained {
            command.set_status(CommandStatus::Terminated);
        }
        debug!(dropped = drained.len(), "pending commands removed");
    }

    /// Stop accepting and dispatching commands; let active workers drain.
    /// Idempotent.
    pub fn shutdown(&self) {
        let transitioned = self
            .inner
            .state
            .compare_exchange(
                SchedulerState::Open as u32,
                SchedulerState::Closing as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !transitioned {
            return;
        }
        info!("scheduler draining");
        if self.started.load(Ordering::Acquire) {
            let _ = self.inner.events_tx.send(SchedulerEvent::Shutdown);
        } else {
            // No coordinator running, nothing to drain.
            self.inner.set_state(SchedulerState::Closed);
        }
    }

    /// `shutdown()` plus a stop request to every active worker, with the
    /// grace window armed. Idempotent.
    pub fn shutdown_hard(&self) {
        self.shutdown();
        if self.inner.hard_armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let active = self.inner.pool.active();
        info!(workers = active.len(), "hard shutdown: interrupting active invocations");
        for handle in active {
            handle.token.force(StopCause::Shutdown);
            worker::spawn_grace_watchdog(self.inner.clone(), handle);
        }
    }

    /// Wait until the scheduler is fully closed. Returns `false` on timeout.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        {
            let mut guard = self.inner.state_lock.lock();
            while self.inner.state() != SchedulerState::Closed {
                match deadline {
                    Some(deadline) => {
                        let timed_out = self
                            .inner
                            .state_cv
                            .wait_until(&mut guard, deadline)
                            .timed_out();
                        if timed_out && self.inner.state() != SchedulerState::Closed {
                            return false;
                        }
                    }
                    None => self.inner.state_cv.wait(&mut guard),
                }
            }
        }
        if let Some(join) = self.coordinator.lock().take() {
            let _ = join.join();
        }
        true
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.state()
    }

    pub fn queued_command_count(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn active_invocation_count(&self) -> usize {
        self.inner.pool.len()
    }

    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.inner.devices
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder {
    runner: Arc<dyn InvocationRunner>,
    factory: Arc<dyn ConfigurationFactory>,
    devices: Arc<DeviceManager>,
    shutdown_timeout: Duration,
}

impl SchedulerBuilder {
    fn new(runner: Arc<dyn InvocationRunner>) -> Self {
        Self {
            runner,
            factory: Arc::new(ArgvConfigurationFactory::new()),
            devices: Arc::new(DeviceManager::new()),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        }
    }

    /// Replace the default argv configuration factory.
    pub fn factory(mut self, factory: Arc<dyn ConfigurationFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Share a device manager instead of creating a fresh one.
    pub fn devices(mut self, devices: Arc<DeviceManager>) -> Self {
        self.devices = devices;
        self
    }

    /// Default hard-shutdown grace window for commands that do not set one.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> Scheduler {
        let (events_tx, events_rx) = unbounded();
        Scheduler {
            inner: Arc::new(SchedulerInner {
                factory: self.factory,
                runner: self.runner,
                devices: self.devices,
                queue: CommandQueue::new(),
                pool: WorkerPool::new(),
                stats: SchedulerStats::default(),
                default_shutdown_timeout_ms: self.shutdown_timeout.as_millis() as u64,
                events_tx,
                events_rx,
                state: AtomicU32::new(SchedulerState::Open as u32),
                state_lock: Mutex::new(()),
                state_cv: Condvar::new(),
                hard_armed: AtomicBool::new(false),
                next_command_id: AtomicU64::new(0),
                next_worker_id: AtomicU64::new(0),
            }),
            started: AtomicBool::new(false),
            coordinator: Mutex::new(None),
        }
    }
}

fn coordinator_loop(inner: Arc<SchedulerInner>) {
    info!("command scheduler running");
    let control = inner.events_rx.clone();
    let device_events = inner.devices.subscribe_state();

    loop {
        select! {
            recv(control) -> _ => {}
            recv(device_events) -> _ => {}
            default(Duration::from_millis(DISPATCH_POLL_MS)) => {}
        }
        // Coalesce bursts of wakeups into one pass.
        while control.try_recv().is_ok() {}
        while device_events.try_recv().is_ok() {}

        if inner.state().accepts_commands() {
            dispatch_pass(&inner);
        } else if inner.pool.is_empty() {
            inner.set_state(SchedulerState::Closed);
            info!("command scheduler closed");
            break;
        }
    }
}

/// Match queued commands to free devices until no eligible pair remains.
///
/// The queue lock is never held while allocating: eligibility works on a
/// snapshot, and the queue is re-entered only to remove the chosen command.
fn dispatch_pass(inner: &Arc<SchedulerInner>) {
    loop {
        let Some(command) = inner.queue.peek_eligible(&inner.devices) else {
            break;
        };
        let Some(device) = inner.devices.allocate(command.requirements()) else {
            // The free set changed between the eligibility check and the
            // allocation; a pool notification will bring us back.
            break;
        };
        if !inner.queue.remove(&command) {
            // Drained concurrently by remove_all_commands.
            inner.devices.release(device);
            continue;
        }
        command.set_status(CommandStatus::Running);
        debug!(
            command = command.id(),
            device = device.serial(),
            total_ms = command.total_exec_time_ms(),
            "dispatching"
        );
        worker::spawn(inner.clone(), command, device);
    }
}
