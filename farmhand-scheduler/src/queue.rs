//! Command queue
//!
//! Ordered structure over pending commands, keyed by accumulated runtime and
//! tie-broken by insertion sequence (FIFO among equal keys). New commands
//! enter with key 0 and are therefore preferred over long-running loop
//! commands; that bootstrapping bias is deliberate.
//!
//! Keys are sampled at insert time only. A command's runtime changes only
//! while it is out of the queue, so no in-place reordering is ever needed:
//! remove on dispatch, reinsert with a fresh key on requeue.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use farmhand_common::consts::QUEUE_SCAN_MIN;
use parking_lot::Mutex;

use crate::command::Command;
use crate::device::DeviceManager;

#[derive(Default)]
struct QueueInner {
    /// (accumulated runtime, insertion seq) -> command
    entries: BTreeMap<(u64, u64), Arc<Command>>,
    /// command id -> current key, for removal by identity
    index: HashMap<u64, (u64, u64)>,
    next_seq: u64,
}

/// Thread-safe priority queue of pending commands.
#[derive(Default)]
pub struct CommandQueue {
    inner: Mutex<QueueInner>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a command keyed by its accumulated runtime as of now.
    pub fn add(&self, command: Arc<Command>) {
        let mut inner = self.inner.lock();
        let key = (command.total_exec_time_ms(), inner.next_seq);
        inner.next_seq += 1;
        inner.index.insert(command.id(), key);
        inner.entries.insert(key, command);
    }

    /// Reinsert a finished loop-mode command. The sort key is freshly
    /// sampled, never a stale value.
    pub fn requeue(&self, command: Arc<Command>) {
        self.add(command);
    }

    /// Remove a command by identity. Returns `false` if it was not queued
    /// (e.g. drained concurrently).
    pub fn remove(&self, command: &Command) -> bool {
        let mut inner = self.inner.lock();
        match inner.index.remove(&command.id()) {
            Some(key) => inner.entries.remove(&key).is_some(),
            None => false,
        }
    }

    /// Smallest-key command that some currently-free device can satisfy.
    ///
    /// Takes a bounded snapshot under the queue lock, then evaluates device
    /// eligibility against the pool without holding it. Never blocks; returns
    /// `None` when nothing in the scanned window matches.
    pub fn peek_eligible(&self, devices: &DeviceManager) -> Option<Arc<Command>> {
        let scan = QUEUE_SCAN_MIN.max(devices.device_count());
        let candidates = self.snapshot(scan);
        candidates
            .into_iter()
            .find(|cmd| devices.matches_free(cmd.requirements()))
    }

    /// First `k` commands in dispatch order.
    pub fn snapshot(&self, k: usize) -> Vec<Arc<Command>> {
        self.inner
            .lock()
            .entries
            .values()
            .take(k)
            .cloned()
            .collect()
    }

    /// Empty the queue, returning what was pending. Running workers are
    /// unaffected.
    pub fn drain(&self) -> Vec<Arc<Command>> {
        let mut inner = self.inner.lock();
        inner.index.clear();
        let drained = std::mem::take(&mut inner.entries);
        drained.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}
