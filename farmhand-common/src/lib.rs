// SPDX-License-Identifier: GPL-2.0-only

//! # farmhand-common
//!
//! Shared types for the Farmhand command scheduler.
//!
//! This crate defines the interrupt control block shared between a worker and
//! the scheduler's termination machinery, plus the small state enums that both
//! sides agree on.
//!
//! ## Design Principles
//!
//! - **Lock-free**: the control block contains only atomics; it is read at
//!   every suspension point and must never block
//! - **Sticky force**: once a stop is requested it stays requested until the
//!   worker terminates, even across interruptible-region toggles
//! - **Cause preserved**: the first stop request wins and records why

#![no_std]

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Per-worker interrupt control block.
///
/// One instance is shared between a worker, the shutdown coordinator, and the
/// per-worker watchdogs. The worker writes `allowed`; everyone else writes
/// `forced` and `escalated`.
///
/// # Thread Safety
///
/// All fields are atomics. No locks are taken on any access path.
#[derive(Debug)]
pub struct InterruptFlags {
    /// 1 if the worker is currently in an interruptible region.
    allowed: AtomicBool,

    /// 1 once any termination source requested a stop. Sticky.
    forced: AtomicBool,

    /// 1 once the grace window expired and cooperation is no longer waited
    /// for. Overrides `allowed` at suspension points.
    escalated: AtomicBool,

    /// First stop cause recorded, 0 if none. See [`StopCause`].
    cause: AtomicU32,
}

impl InterruptFlags {
    /// Create a control block for a fresh worker: interruptible regions off,
    /// no stop requested.
    pub const fn new() -> Self {
        Self {
            allowed: AtomicBool::new(false),
            forced: AtomicBool::new(false),
            escalated: AtomicBool::new(false),
            cause: AtomicU32::new(0),
        }
    }

    /// Mark the current region interruptible or not. Worker-only.
    #[inline]
    pub fn set_allowed(&self, allowed: bool) {
        self.allowed.store(allowed, Ordering::Release);
    }

    #[inline]
    pub fn is_allowed(&self) -> bool {
        self.allowed.load(Ordering::Acquire)
    }

    /// Request a cooperative stop. The first caller's cause is kept; later
    /// calls are no-ops. Returns `true` if this call set the flag.
    #[inline]
    pub fn force(&self, cause: StopCause) -> bool {
        let first = self
            .cause
            .compare_exchange(0, cause as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.forced.store(true, Ordering::Release);
        first
    }

    #[inline]
    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }

    /// Stop waiting for cooperation: suspension points abort regardless of
    /// `allowed` from now on. Implies `forced`.
    #[inline]
    pub fn escalate(&self, cause: StopCause) {
        self.force(cause);
        self.escalated.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_escalated(&self) -> bool {
        self.escalated.load(Ordering::Acquire)
    }

    /// Whether a suspension point reached now must abort instead of waiting.
    #[inline]
    pub fn should_abort(&self) -> bool {
        if self.is_escalated() {
            return true;
        }
        self.is_forced() && self.is_allowed()
    }

    /// The first stop cause recorded, if any stop was requested.
    #[inline]
    pub fn cause(&self) -> Option<StopCause> {
        StopCause::try_from(self.cause.load(Ordering::Acquire)).ok()
    }
}

impl Default for InterruptFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a worker was asked to stop.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// Device battery dropped below the configured cutoff.
    Battery = 1,
    /// Hard shutdown of the whole scheduler.
    Shutdown = 2,
    /// The invocation outlived its configured timeout.
    InvocationTimeout = 3,
}

impl TryFrom<u32> for StopCause {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StopCause::Battery),
            2 => Ok(StopCause::Shutdown),
            3 => Ok(StopCause::InvocationTimeout),
            _ => Err(()),
        }
    }
}

/// Lifecycle of a queued command.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Waiting in the queue for a matching device.
    Queued = 0,
    /// Owned by a worker, invocation in flight.
    Running = 1,
    /// Loop-mode pause between invocations.
    Sleeping = 2,
    /// Finished for good; will not be dispatched again.
    Terminated = 3,
}

impl CommandStatus {
    /// Whether the command may still produce an invocation.
    pub fn is_live(self) -> bool {
        !matches!(self, CommandStatus::Terminated)
    }
}

impl TryFrom<u32> for CommandStatus {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CommandStatus::Queued),
            1 => Ok(CommandStatus::Running),
            2 => Ok(CommandStatus::Sleeping),
            3 => Ok(CommandStatus::Terminated),
            _ => Err(()),
        }
    }
}

/// Lifecycle of a worker activity.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle = 0,
    /// Loading configuration; may still fail without an invocation.
    Starting = 1,
    /// Invocation in flight; timeout and battery watchdogs apply.
    Running = 2,
    /// Invocation over; accounting, device release, loop sleep.
    Stopping = 3,
    Done = 4,
}

impl WorkerState {
    /// Whether the invocation-timeout watchdog still applies.
    pub fn is_invoking(self) -> bool {
        matches!(self, WorkerState::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Done)
    }
}

impl TryFrom<u32> for WorkerState {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(WorkerState::Idle),
            1 => Ok(WorkerState::Starting),
            2 => Ok(WorkerState::Running),
            3 => Ok(WorkerState::Stopping),
            4 => Ok(WorkerState::Done),
            _ => Err(()),
        }
    }
}

/// Shutdown coordinator state.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Accepting commands and dispatching.
    Open = 0,
    /// No new commands, no new dispatches; draining workers.
    Closing = 1,
    /// All workers finished; the coordinator has exited.
    Closed = 2,
}

impl SchedulerState {
    pub fn accepts_commands(self) -> bool {
        matches!(self, SchedulerState::Open)
    }
}

impl TryFrom<u32> for SchedulerState {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SchedulerState::Open),
            1 => Ok(SchedulerState::Closing),
            2 => Ok(SchedulerState::Closed),
            _ => Err(()),
        }
    }
}

/// Tuning constants.
pub mod consts {
    /// Grace window after a hard shutdown before escalation (30s).
    pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

    /// Upper bound on the coordinator's wait between dispatch passes.
    pub const DISPATCH_POLL_MS: u64 = 250;

    /// Secondary grace after an invocation-timeout stop request before the
    /// watchdog escalates.
    pub const TIMEOUT_ESCALATE_GRACE_MS: u64 = 2_000;

    /// Battery watchdog sampling interval.
    pub const BATTERY_POLL_MS: u64 = 200;

    /// Minimum number of queue entries a dispatch pass examines, regardless
    /// of how few devices are free.
    pub const QUEUE_SCAN_MIN: usize = 16;
}
