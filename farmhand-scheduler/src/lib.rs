//! # Farmhand Scheduler
//!
//! Fair, interruptible dispatch of test commands onto a pool of managed
//! devices.
//!
//! Commands are argument vectors. The scheduler keeps them in a queue ordered
//! by accumulated runtime, so the command that has run the least goes next
//! whenever a matching device frees up. Loop-mode commands re-enter the queue
//! after every invocation with their runtime updated, which is what keeps a
//! fast configuration running roughly twice as often as one that takes twice
//! as long.
//!
//! ## Key Components
//!
//! - **Command Queue**: runtime-keyed priority order, FIFO among equal keys
//! - **Device Manager**: capability-matched exclusive device leases
//! - **Worker Pool**: one activity per (command, device) pair
//! - **Interrupt Token**: cooperative stop flags consulted at every
//!   suspension point, with bounded escalation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use farmhand_scheduler::{
//!     DeviceInfo, DeviceManager, InvocationContext, InvocationError, InvocationRunner, Scheduler,
//! };
//!
//! struct MyRunner;
//!
//! impl InvocationRunner for MyRunner {
//!     fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<(), InvocationError> {
//!         // Flash, run tests, report... every wait goes through the context.
//!         ctx.set_interruptible(true);
//!         ctx.sleep(Duration::from_secs(5))?;
//!         Ok(())
//!     }
//! }
//!
//! let devices = Arc::new(DeviceManager::new());
//! devices.register(DeviceInfo::new("SN-001", "widget", false));
//!
//! let scheduler = Scheduler::builder(Arc::new(MyRunner)).devices(devices).build();
//! scheduler.start();
//! scheduler
//!     .add_command(&["smoke".into(), "--loop".into()])
//!     .unwrap();
//!
//! scheduler.shutdown();
//! scheduler.join(None);
//! ```
//!
//! ## Interruption
//!
//! Stops are cooperative. A worker marks interruptible regions on its token;
//! stop requests only take effect at suspension points inside such regions.
//! Device flashing and similar critical phases run under a
//! [`ShieldGuard`](interrupt::ShieldGuard):
//!
//! ```rust,ignore
//! let _shield = ctx.shield();
//! flash_device(ctx.device())?;
//! // Guard dropped: stop requests are honored again.
//! ```
//!
//! Hard shutdown grants every worker a grace window; only when that expires
//! is the worker torn down regardless of shields.

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod interrupt;
pub mod invocation;
pub mod queue;
pub mod scheduler;
pub mod stats;

mod worker;

pub use command::Command;
pub use config::{
    argv, ArgvConfigurationFactory, CommandOptions, Configuration, ConfigurationFactory,
    DeviceOptions,
};
pub use device::{
    DeviceHandle, DeviceInfo, DeviceKind, DeviceManager, DeviceRequirements, DeviceState,
    BATTERY_UNKNOWN,
};
pub use error::{ConfigError, InvocationError, Result, SchedulerError};
pub use interrupt::{InterruptToken, ShieldGuard};
pub use invocation::{
    InvocationContext, InvocationListener, InvocationOutcome, InvocationRunner, Rescheduler,
};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use stats::{SchedulerStats, StatsSnapshot};

/// Re-export common types
pub use farmhand_common::{consts, CommandStatus, SchedulerState, StopCause, WorkerState};
