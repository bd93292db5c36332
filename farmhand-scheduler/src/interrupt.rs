//! Cooperative interruption
//!
//! Every worker owns one [`InterruptToken`]. The worker marks interruptible
//! regions on it; the shutdown coordinator and the watchdogs request stops on
//! it. All wait/sleep helpers handed to the invocation runner go through the
//! token, so a stop request set at any moment is observed at the next
//! suspension point:
//!
//! - `forced && allowed` at a suspension point raises `Interrupted`
//! - `escalated` raises `Interrupted` regardless of `allowed`
//! - otherwise the suspension waits as requested
//!
//! A stop request is sticky: set before the worker ever enters an
//! interruptible region, it still aborts the first region entered.

use std::marker::PhantomData;
use std::time::{Duration, Instant};

use farmhand_common::{InterruptFlags, StopCause};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::InvocationError;

/// Shared stop channel between one worker and the termination sources.
///
/// The worker writes the interruptible flag; the shutdown coordinator, the
/// invocation-timeout watchdog, and the battery watchdog write stop requests.
/// Forcing or escalating wakes a worker blocked in [`InterruptToken::sleep`].
#[derive(Debug, Default)]
pub struct InterruptToken {
    flags: InterruptFlags,
    lock: Mutex<()>,
    signal: Condvar,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the code that follows interruptible (`true`) or protected
    /// (`false`). Worker-only.
    pub fn set_interruptible(&self, allowed: bool) {
        self.flags.set_allowed(allowed);
    }

    pub fn is_interruptible(&self) -> bool {
        self.flags.is_allowed()
    }

    /// Enter a protected region for the duration of the returned guard.
    ///
    /// Restores the previous interruptible state on drop, so shields nest.
    /// The guard is `!Send`: it must be dropped on the worker thread that
    /// created it, since `allowed` belongs to that worker.
    pub fn shield(&self) -> ShieldGuard<'_> {
        let was_interruptible = self.flags.is_allowed();
        self.flags.set_allowed(false);
        ShieldGuard {
            token: self,
            was_interruptible,
            _marker: PhantomData,
        }
    }

    /// Request a cooperative stop and wake any blocked suspension point.
    pub fn force(&self, cause: StopCause) {
        if self.flags.force(cause) {
            trace!(?cause, "stop requested");
        }
        let _guard = self.lock.lock();
        self.signal.notify_all();
    }

    /// Stop waiting for cooperation: every suspension point aborts from now
    /// on, protected regions included.
    pub fn escalate(&self, cause: StopCause) {
        self.flags.escalate(cause);
        let _guard = self.lock.lock();
        self.signal.notify_all();
    }

    /// Wake blocked suspension points without requesting a stop. Used by the
    /// worker lifecycle to let watchdogs re-check their liveness condition.
    pub fn wake(&self) {
        let _guard = self.lock.lock();
        self.signal.notify_all();
    }

    pub fn is_forced(&self) -> bool {
        self.flags.is_forced()
    }

    pub fn is_escalated(&self) -> bool {
        self.flags.is_escalated()
    }

    pub fn cause(&self) -> Option<StopCause> {
        self.flags.cause()
    }

    /// Suspension point without a wait: raises `Interrupted` if a stop is due.
    pub fn checkpoint(&self) -> Result<(), InvocationError> {
        if self.flags.should_abort() {
            return Err(InvocationError::Interrupted);
        }
        Ok(())
    }

    /// Interruptible sleep. Returns `Ok(())` after the full duration, or
    /// `Interrupted` as soon as a stop is due, including one that was
    /// pending before the call.
    pub fn sleep(&self, duration: Duration) -> Result<(), InvocationError> {
        let deadline = Instant::now() + duration;
        let mut guard = self.lock.lock();
        loop {
            if self.flags.should_abort() {
                return Err(InvocationError::Interrupted);
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            let _ = self.signal.wait_until(&mut guard, deadline);
        }
    }

    /// Block until `deadline` or until `done()` holds; returns whether it
    /// held. Watchdog-side helper: does not raise `Interrupted`.
    pub(crate) fn wait_until(&self, deadline: Instant, done: impl Fn() -> bool) -> bool {
        let mut guard = self.lock.lock();
        loop {
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            let _ = self.signal.wait_until(&mut guard, deadline);
        }
    }
}

/// RAII marker for a protected (non-interruptible) region.
///
/// While any shield is live, cooperative stop requests are deferred; only
/// escalation gets through. Dropping the guard restores the state the region
/// was entered with.
pub struct ShieldGuard<'a> {
    token: &'a InterruptToken,
    was_interruptible: bool,
    // *const () keeps the guard off other threads
    _marker: PhantomData<*const ()>,
}

impl Drop for ShieldGuard<'_> {
    fn drop(&mut self) {
        self.token.flags.set_allowed(self.was_interruptible);
    }
}
