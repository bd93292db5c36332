//! Invocation seam
//!
//! The scheduler treats the actual test run as opaque work behind
//! [`InvocationRunner`]. The runner gets an [`InvocationContext`] carrying the
//! device, the configuration, and the suspension helpers it must use for all
//! sleeps and waits; those helpers are where cooperative interruption happens.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use farmhand_common::StopCause;
use tracing::warn;

use crate::command::Command;
use crate::config::Configuration;
use crate::device::DeviceHandle;
use crate::error::{InvocationError, SchedulerError};
use crate::interrupt::{InterruptToken, ShieldGuard};

/// Runs one invocation of a command on one device.
///
/// May take seconds to hours. Implementations must route every sleep or wait
/// through the context so stop requests are observed; `Err(Interrupted)` is
/// the expected way out when one is.
pub trait InvocationRunner: Send + Sync {
    fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<(), InvocationError>;
}

/// Lets an invocation split itself by enqueueing derived commands.
///
/// Scheduling fails once the scheduler has begun shutting down.
pub trait Rescheduler: Send + Sync {
    fn schedule(&self, args: &[String]) -> Result<(), SchedulerError>;
}

/// Observes invocation boundaries. All hooks default to no-ops.
pub trait InvocationListener: Send + Sync {
    fn on_invocation_started(&self, _command: &Command, _device: &DeviceHandle) {}
    fn on_invocation_ended(&self, _command: &Command, _outcome: &InvocationOutcome) {}
}

/// How an invocation ended.
#[derive(Debug, Clone)]
pub enum InvocationOutcome {
    Completed,
    /// Stopped cooperatively (or by escalation); carries the recorded cause.
    Interrupted(Option<StopCause>),
    DeviceNotAvailable,
    Failed(String),
}

/// Everything handed to an [`InvocationRunner`] for one run.
pub struct InvocationContext<'a> {
    command: &'a Command,
    device: &'a DeviceHandle,
    configuration: &'a Configuration,
    token: &'a InterruptToken,
    rescheduler: &'a dyn Rescheduler,
}

impl<'a> InvocationContext<'a> {
    pub(crate) fn new(
        command: &'a Command,
        device: &'a DeviceHandle,
        configuration: &'a Configuration,
        token: &'a InterruptToken,
        rescheduler: &'a dyn Rescheduler,
    ) -> Self {
        Self {
            command,
            device,
            configuration,
            token,
            rescheduler,
        }
    }

    pub fn command(&self) -> &Command {
        self.command
    }

    pub fn device(&self) -> &DeviceHandle {
        self.device
    }

    pub fn configuration(&self) -> &Configuration {
        self.configuration
    }

    /// Mark the code that follows interruptible or protected.
    pub fn set_interruptible(&self, allowed: bool) {
        self.token.set_interruptible(allowed);
    }

    /// Protect a region for the lifetime of the guard (nests; restores the
    /// previous state on drop).
    pub fn shield(&self) -> ShieldGuard<'_> {
        self.token.shield()
    }

    /// Interruptible sleep; raises `Interrupted` when a stop is due.
    pub fn sleep(&self, duration: Duration) -> Result<(), InvocationError> {
        self.token.sleep(duration)
    }

    /// Suspension point without a wait.
    pub fn checkpoint(&self) -> Result<(), InvocationError> {
        self.token.checkpoint()
    }

    /// Enqueue a derived command.
    pub fn reschedule(&self, args: &[String]) -> Result<(), SchedulerError> {
        self.rescheduler.schedule(args)
    }
}

/// Listener plumbing shared by the worker. A panicking listener is logged
/// and skipped; it must not take the worker down with it.
pub(crate) fn notify_started(
    listeners: &[Arc<dyn InvocationListener>],
    command: &Command,
    device: &DeviceHandle,
) {
    for listener in listeners {
        let called = catch_unwind(AssertUnwindSafe(|| {
            listener.on_invocation_started(command, device)
        }));
        if called.is_err() {
            warn!(command = command.id(), "invocation listener panicked in on_invocation_started");
        }
    }
}

pub(crate) fn notify_ended(
    listeners: &[Arc<dyn InvocationListener>],
    command: &Command,
    outcome: &InvocationOutcome,
) {
    for listener in listeners {
        let called = catch_unwind(AssertUnwindSafe(|| {
            listener.on_invocation_ended(command, outcome)
        }));
        if called.is_err() {
            warn!(command = command.id(), "invocation listener panicked in on_invocation_ended");
        }
    }
}
