//! Scheduler counters
//!
//! Cheap atomic counters incremented on the hot paths and snapshotted for
//! logging or assertions. Relaxed ordering throughout; the numbers are
//! advisory.

use std::sync::atomic::{AtomicU64, Ordering};

/// Scheduler statistics
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Commands accepted by `add_command`
    pub commands_added: AtomicU64,
    /// Commands rejected by the configuration factory
    pub commands_rejected: AtomicU64,
    /// Workers dispatched onto a device
    pub invocations_started: AtomicU64,
    /// Invocations that ran to completion
    pub invocations_completed: AtomicU64,
    /// Invocations that ended via a cooperative stop
    pub invocations_interrupted: AtomicU64,
    /// Invocations that ended in a failure
    pub invocations_failed: AtomicU64,
    /// Loop-mode commands returned to the queue
    pub commands_requeued: AtomicU64,
    /// Grace windows that expired into forced termination
    pub escalations: AtomicU64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            commands_added: self.commands_added.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            invocations_started: self.invocations_started.load(Ordering::Relaxed),
            invocations_completed: self.invocations_completed.load(Ordering::Relaxed),
            invocations_interrupted: self.invocations_interrupted.load(Ordering::Relaxed),
            invocations_failed: self.invocations_failed.load(Ordering::Relaxed),
            commands_requeued: self.commands_requeued.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`SchedulerStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub commands_added: u64,
    pub commands_rejected: u64,
    pub invocations_started: u64,
    pub invocations_completed: u64,
    pub invocations_interrupted: u64,
    pub invocations_failed: u64,
    pub commands_requeued: u64,
    pub escalations: u64,
}
