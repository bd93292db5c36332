//! Device inventory facade
//!
//! A thin, thread-safe mediator over the device inventory. The scheduler asks
//! it for a free device matching a command's requirements; workers hold the
//! resulting [`DeviceHandle`] exclusively until they release it.
//!
//! Allocation state lives under one mutex. Battery and device state are
//! atomics on the shared [`DeviceInfo`] so the battery watchdog and external
//! health probes can update them without touching the pool lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Battery level sentinel for devices that do not report one.
pub const BATTERY_UNKNOWN: u8 = u8::MAX;

/// Connectivity state of a device.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Online = 0,
    Offline = 1,
    /// Present but unusable (e.g. mid-recovery).
    Unavailable = 2,
}

impl TryFrom<u32> for DeviceState {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DeviceState::Online),
            1 => Ok(DeviceState::Offline),
            2 => Ok(DeviceState::Unavailable),
            _ => Err(()),
        }
    }
}

/// Emulator/physical selector in a requirement set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceKind {
    #[default]
    Any,
    EmulatorOnly,
    PhysicalOnly,
}

/// Immutable identity plus mutable probes for one device.
#[derive(Debug)]
pub struct DeviceInfo {
    serial: String,
    product_type: String,
    is_emulator: bool,
    state: AtomicU32,
    battery: AtomicU8,
}

impl DeviceInfo {
    pub fn new(serial: impl Into<String>, product_type: impl Into<String>, is_emulator: bool) -> Self {
        Self {
            serial: serial.into(),
            product_type: product_type.into(),
            is_emulator,
            state: AtomicU32::new(DeviceState::Online as u32),
            battery: AtomicU8::new(BATTERY_UNKNOWN),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn product_type(&self) -> &str {
        &self.product_type
    }

    pub fn is_emulator(&self) -> bool {
        self.is_emulator
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(DeviceState::Unavailable)
    }

    pub fn set_state(&self, state: DeviceState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Last reported battery level, if the device reports one.
    pub fn battery_level(&self) -> Option<u8> {
        match self.battery.load(Ordering::Acquire) {
            BATTERY_UNKNOWN => None,
            level => Some(level),
        }
    }

    pub fn set_battery(&self, level: u8) {
        self.battery.store(level.min(100), Ordering::Release);
    }
}

/// Exclusive lease on one device, held by exactly one worker at a time.
///
/// Handles are only created by [`DeviceManager::allocate`] and given back via
/// [`DeviceManager::release`] or [`DeviceManager::mark_unhealthy`].
#[derive(Debug)]
pub struct DeviceHandle {
    info: Arc<DeviceInfo>,
}

impl DeviceHandle {
    pub fn serial(&self) -> &str {
        self.info.serial()
    }

    pub fn product_type(&self) -> &str {
        self.info.product_type()
    }

    pub fn is_emulator(&self) -> bool {
        self.info.is_emulator()
    }

    pub fn state(&self) -> DeviceState {
        self.info.state()
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.info.battery_level()
    }
}

/// Capability predicate a device must satisfy to run a command.
#[derive(Debug, Clone, Default)]
pub struct DeviceRequirements {
    /// Allowed serials; empty means any.
    pub serials: Vec<String>,
    /// Required product type, if any.
    pub product_type: Option<String>,
    /// Required connectivity state.
    pub require_state: DeviceState,
    /// Emulator/physical filter.
    pub kind: DeviceKind,
    /// Minimum reported battery level. Devices that report no level pass.
    pub min_battery: Option<u8>,
}

impl DeviceRequirements {
    /// Whether `info` satisfies every predicate. The battery probe is only
    /// read when a minimum is actually required.
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        if info.state() != self.require_state {
            return false;
        }
        if !self.serials.is_empty() && !self.serials.iter().any(|s| s == info.serial()) {
            return false;
        }
        if let Some(ref product) = self.product_type {
            if product != info.product_type() {
                return false;
            }
        }
        match self.kind {
            DeviceKind::Any => {}
            DeviceKind::EmulatorOnly if !info.is_emulator() => return false,
            DeviceKind::PhysicalOnly if info.is_emulator() => return false,
            _ => {}
        }
        if let Some(min) = self.min_battery {
            if let Some(level) = info.battery_level() {
                if level < min {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Allocated,
    /// Pulled out of rotation after a terminal device error.
    Unhealthy,
}

struct Entry {
    info: Arc<DeviceInfo>,
    slot: Slot,
}

/// Thread-safe device pool.
pub struct DeviceManager {
    inventory: Mutex<HashMap<String, Entry>>,
    watchers: Mutex<Vec<Sender<()>>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            inventory: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Add a device to the free pool.
    pub fn register(&self, info: DeviceInfo) -> Arc<DeviceInfo> {
        let info = Arc::new(info);
        let serial = info.serial().to_string();
        self.inventory.lock().insert(
            serial,
            Entry {
                info: info.clone(),
                slot: Slot::Free,
            },
        );
        debug!(serial = info.serial(), "device registered");
        self.notify();
        info
    }

    /// Drop a device from the inventory. An outstanding handle stays valid
    /// but its eventual release is a no-op.
    pub fn unregister(&self, serial: &str) {
        self.inventory.lock().remove(serial);
        self.notify();
    }

    /// Atomically lease the first free device satisfying `requirements`.
    pub fn allocate(&self, requirements: &DeviceRequirements) -> Option<DeviceHandle> {
        let mut inventory = self.inventory.lock();
        let entry = inventory
            .values_mut()
            .find(|e| e.slot == Slot::Free && requirements.matches(&e.info))?;
        entry.slot = Slot::Allocated;
        debug!(serial = entry.info.serial(), "device allocated");
        Some(DeviceHandle {
            info: entry.info.clone(),
        })
    }

    /// Whether any currently-free device satisfies `requirements`.
    pub fn matches_free(&self, requirements: &DeviceRequirements) -> bool {
        self.inventory
            .lock()
            .values()
            .any(|e| e.slot == Slot::Free && requirements.matches(&e.info))
    }

    /// Return a leased device to the free pool.
    pub fn release(&self, handle: DeviceHandle) {
        let mut inventory = self.inventory.lock();
        if let Some(entry) = inventory.get_mut(handle.serial()) {
            if entry.slot == Slot::Allocated {
                entry.slot = Slot::Free;
                debug!(serial = handle.serial(), "device released");
            }
        }
        drop(inventory);
        self.notify();
    }

    /// Return a leased device but keep it out of rotation.
    pub fn mark_unhealthy(&self, handle: DeviceHandle) {
        let mut inventory = self.inventory.lock();
        if let Some(entry) = inventory.get_mut(handle.serial()) {
            entry.slot = Slot::Unhealthy;
            warn!(serial = handle.serial(), "device marked unhealthy");
        }
        drop(inventory);
        self.notify();
    }

    pub fn free_count(&self) -> usize {
        self.inventory
            .lock()
            .values()
            .filter(|e| e.slot == Slot::Free)
            .count()
    }

    pub fn device_count(&self) -> usize {
        self.inventory.lock().len()
    }

    /// Look up a registered device by serial.
    pub fn device(&self, serial: &str) -> Option<Arc<DeviceInfo>> {
        self.inventory.lock().get(serial).map(|e| e.info.clone())
    }

    /// Notification channel that fires whenever pool availability may have
    /// changed (register, release, health, battery).
    pub fn subscribe_state(&self) -> Receiver<()> {
        let (tx, rx) = unbounded();
        self.watchers.lock().push(tx);
        rx
    }

    /// Update a device's battery probe and wake subscribers.
    pub fn set_battery(&self, serial: &str, level: u8) {
        if let Some(info) = self.device(serial) {
            info.set_battery(level);
            self.notify();
        }
    }

    fn notify(&self) {
        self.watchers.lock().retain(|tx| tx.send(()).is_ok());
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(devices: &[DeviceInfo]) -> DeviceManager {
        let manager = DeviceManager::new();
        for info in devices {
            manager.register(DeviceInfo::new(
                info.serial(),
                info.product_type(),
                info.is_emulator(),
            ));
        }
        manager
    }

    #[test]
    fn test_allocation_is_exclusive() {
        let manager = manager_with(&[DeviceInfo::new("SN1", "widget", false)]);
        let req = DeviceRequirements::default();

        let first = manager.allocate(&req).expect("device free");
        assert!(manager.allocate(&req).is_none(), "second lease must fail");

        manager.release(first);
        assert!(manager.allocate(&req).is_some());
    }

    #[test]
    fn test_serial_allowlist_and_product_filter() {
        let manager = manager_with(&[
            DeviceInfo::new("SN1", "widget", false),
            DeviceInfo::new("SN2", "gadget", false),
        ]);

        let req = DeviceRequirements {
            serials: vec!["SN2".into()],
            ..Default::default()
        };
        let handle = manager.allocate(&req).expect("SN2 free");
        assert_eq!(handle.serial(), "SN2");

        let req = DeviceRequirements {
            product_type: Some("gadget".into()),
            ..Default::default()
        };
        assert!(!manager.matches_free(&req), "gadget device already leased");
    }

    #[test]
    fn test_emulator_filter() {
        let manager = manager_with(&[
            DeviceInfo::new("emu-1", "virt", true),
            DeviceInfo::new("SN1", "widget", false),
        ]);

        let req = DeviceRequirements {
            kind: DeviceKind::EmulatorOnly,
            ..Default::default()
        };
        assert_eq!(manager.allocate(&req).unwrap().serial(), "emu-1");

        let req = DeviceRequirements {
            kind: DeviceKind::PhysicalOnly,
            ..Default::default()
        };
        assert_eq!(manager.allocate(&req).unwrap().serial(), "SN1");
    }

    #[test]
    fn test_min_battery_is_lazy_and_unknown_passes() {
        let manager = DeviceManager::new();
        manager.register(DeviceInfo::new("SN1", "widget", false));

        let req = DeviceRequirements {
            min_battery: Some(50),
            ..Default::default()
        };
        // No battery reported yet: still eligible.
        assert!(manager.matches_free(&req));

        manager.set_battery("SN1", 20);
        assert!(!manager.matches_free(&req));

        manager.set_battery("SN1", 80);
        assert!(manager.matches_free(&req));
    }

    #[test]
    fn test_offline_device_does_not_match() {
        let manager = DeviceManager::new();
        let info = manager.register(DeviceInfo::new("SN1", "widget", false));

        let req = DeviceRequirements::default();
        assert!(manager.matches_free(&req));

        info.set_state(DeviceState::Offline);
        assert!(!manager.matches_free(&req));
    }

    #[test]
    fn test_unhealthy_device_leaves_rotation() {
        let manager = manager_with(&[DeviceInfo::new("SN1", "widget", false)]);
        let req = DeviceRequirements::default();

        let handle = manager.allocate(&req).unwrap();
        manager.mark_unhealthy(handle);

        assert_eq!(manager.free_count(), 0);
        assert!(manager.allocate(&req).is_none());
        assert_eq!(manager.device_count(), 1, "still inventoried");
    }

    #[test]
    fn test_state_subscription_fires_on_release() {
        let manager = manager_with(&[DeviceInfo::new("SN1", "widget", false)]);
        let handle = manager.allocate(&DeviceRequirements::default()).unwrap();

        let rx = manager.subscribe_state();
        manager.release(handle);
        assert!(rx.try_recv().is_ok(), "release must wake subscribers");
    }
}
