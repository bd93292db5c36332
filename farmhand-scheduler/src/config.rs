//! Configuration factory
//!
//! Turns a user-supplied argument vector into a [`Configuration`]: command
//! options (loop policy, timeouts), device requirements, and device options.
//! Parsing is clap-based so rejection messages read like any other CLI error.

use std::sync::Arc;

use clap::Parser;

use crate::device::{DeviceKind, DeviceRequirements};
use crate::error::ConfigError;
use crate::invocation::InvocationListener;

/// Parsed command line of one scheduled command.
#[derive(Parser, Debug, Clone)]
#[command(name = "command", no_binary_name = true, disable_help_flag = true)]
struct CommandLine {
    /// Test to run
    test: String,

    /// Re-enqueue the command after each invocation
    #[arg(long = "loop")]
    loop_mode: bool,

    /// Lower bound on the time between loop-mode invocations
    #[arg(long, default_value_t = 0)]
    min_loop_time_ms: u64,

    /// Abort an invocation running longer than this; 0 disables
    #[arg(long, default_value_t = 0)]
    invocation_timeout_ms: u64,

    /// Grace window granted to this command's worker on hard shutdown
    #[arg(long)]
    shutdown_timeout_ms: Option<u64>,

    /// Stop the invocation when device battery drops below this level
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    cutoff_battery: Option<u8>,

    /// Restrict to these device serials (repeatable)
    #[arg(long = "serial")]
    serials: Vec<String>,

    /// Require this device product type
    #[arg(long)]
    product: Option<String>,

    /// Only run on emulators
    #[arg(long, conflicts_with = "physical_only")]
    emulator_only: bool,

    /// Only run on physical devices
    #[arg(long)]
    physical_only: bool,

    /// Only allocate devices at or above this battery level
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    min_battery: Option<u8>,
}

/// Scheduling-relevant options of a command.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub test: String,
    pub loop_mode: bool,
    pub min_loop_time_ms: u64,
    /// 0 means no invocation timeout.
    pub invocation_timeout_ms: u64,
    /// `None` falls back to the scheduler-wide default.
    pub shutdown_timeout_ms: Option<u64>,
}

impl CommandOptions {
    /// Grace window for this command's worker, with the scheduler default
    /// applied.
    pub fn effective_shutdown_timeout_ms(&self, default_ms: u64) -> u64 {
        self.shutdown_timeout_ms.unwrap_or(default_ms)
    }
}

/// Options applied to the device while the command runs on it.
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    /// Battery level below which the invocation is asked to stop.
    pub cutoff_battery: Option<u8>,
}

/// Everything a worker needs to run one command.
pub struct Configuration {
    command_options: CommandOptions,
    device_requirements: DeviceRequirements,
    device_options: DeviceOptions,
    listeners: Vec<Arc<dyn InvocationListener>>,
}

impl Configuration {
    pub fn command_options(&self) -> &CommandOptions {
        &self.command_options
    }

    pub fn device_requirements(&self) -> &DeviceRequirements {
        &self.device_requirements
    }

    pub fn device_options(&self) -> &DeviceOptions {
        &self.device_options
    }

    pub fn test_invocation_listeners(&self) -> &[Arc<dyn InvocationListener>] {
        &self.listeners
    }
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("command_options", &self.command_options)
            .field("device_requirements", &self.device_requirements)
            .field("device_options", &self.device_options)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Builds configurations from raw argument vectors.
///
/// Called once at `add_command` time to validate, and again by the worker
/// when it starts, so listener wiring can differ per factory.
pub trait ConfigurationFactory: Send + Sync {
    fn create_configuration_from_args(&self, args: &[String]) -> Result<Configuration, ConfigError>;
}

/// Default factory: parses the recognized keys, attaches the listeners it was
/// built with.
#[derive(Default)]
pub struct ArgvConfigurationFactory {
    listeners: Vec<Arc<dyn InvocationListener>>,
}

impl ArgvConfigurationFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener to every configuration this factory produces.
    pub fn with_listener(mut self, listener: Arc<dyn InvocationListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

impl ConfigurationFactory for ArgvConfigurationFactory {
    fn create_configuration_from_args(&self, args: &[String]) -> Result<Configuration, ConfigError> {
        if args.is_empty() {
            return Err(ConfigError::Empty);
        }
        let line = CommandLine::try_parse_from(args)
            .map_err(|e| ConfigError::InvalidArgs(e.to_string()))?;

        let kind = if line.emulator_only {
            DeviceKind::EmulatorOnly
        } else if line.physical_only {
            DeviceKind::PhysicalOnly
        } else {
            DeviceKind::Any
        };

        Ok(Configuration {
            command_options: CommandOptions {
                test: line.test,
                loop_mode: line.loop_mode,
                min_loop_time_ms: line.min_loop_time_ms,
                invocation_timeout_ms: line.invocation_timeout_ms,
                shutdown_timeout_ms: line.shutdown_timeout_ms,
            },
            device_requirements: DeviceRequirements {
                serials: line.serials,
                product_type: line.product,
                require_state: Default::default(),
                kind,
                min_battery: line.min_battery,
            },
            device_options: DeviceOptions {
                cutoff_battery: line.cutoff_battery,
            },
            listeners: self.listeners.clone(),
        })
    }
}

/// Convenience for building argv vectors in tests and demos.
pub fn argv<S: AsRef<str>>(tokens: &[S]) -> Vec<String> {
    tokens.iter().map(|s| s.as_ref().to_string()).collect()
}
