//! Scheduled commands
//!
//! A [`Command`] is a user-supplied argument vector plus the derived
//! attributes the scheduler needs: loop policy, timeouts, device
//! requirements, accumulated runtime, and status.
//!
//! `total_exec_time_ms` is monotonically non-decreasing and written only by
//! the worker that currently owns the command; the queue reads it only while
//! the command is out of the queue (at insert and requeue).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use farmhand_common::CommandStatus;

use crate::config::{CommandOptions, Configuration};
use crate::device::DeviceRequirements;

#[derive(Debug)]
pub struct Command {
    id: u64,
    args: Vec<String>,
    options: CommandOptions,
    requirements: DeviceRequirements,
    total_exec_time_ms: AtomicU64,
    status: AtomicU32,
}

impl Command {
    pub(crate) fn new(id: u64, args: Vec<String>, configuration: &Configuration) -> Self {
        Self {
            id,
            args,
            options: configuration.command_options().clone(),
            requirements: configuration.device_requirements().clone(),
            total_exec_time_ms: AtomicU64::new(0),
            status: AtomicU32::new(CommandStatus::Queued as u32),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn options(&self) -> &CommandOptions {
        &self.options
    }

    pub fn requirements(&self) -> &DeviceRequirements {
        &self.requirements
    }

    pub fn loop_mode(&self) -> bool {
        self.options.loop_mode
    }

    /// Accumulated invocation runtime across all runs so far.
    pub fn total_exec_time_ms(&self) -> u64 {
        self.total_exec_time_ms.load(Ordering::Acquire)
    }

    /// Add one invocation's elapsed time. Owner-worker only.
    pub(crate) fn add_exec_time_ms(&self, delta_ms: u64) {
        self.total_exec_time_ms.fetch_add(delta_ms, Ordering::AcqRel);
    }

    pub fn status(&self) -> CommandStatus {
        CommandStatus::try_from(self.status.load(Ordering::Acquire))
            .unwrap_or(CommandStatus::Terminated)
    }

    pub(crate) fn set_status(&self, status: CommandStatus) {
        self.status.store(status as u32, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{argv, ArgvConfigurationFactory, ConfigurationFactory};

    fn command(tokens: &[&str]) -> Command {
        let args = argv(tokens);
        let configuration = ArgvConfigurationFactory::new()
            .create_configuration_from_args(&args)
            .unwrap();
        Command::new(1, args, &configuration)
    }

    #[test]
    fn test_new_command_starts_queued_with_zero_runtime() {
        let cmd = command(&["smoke"]);
        assert_eq!(cmd.status(), CommandStatus::Queued);
        assert_eq!(cmd.total_exec_time_ms(), 0);
        assert!(!cmd.loop_mode());
    }

    #[test]
    fn test_exec_time_accumulates_monotonically() {
        let cmd = command(&["smoke", "--loop"]);
        cmd.add_exec_time_ms(100);
        cmd.add_exec_time_ms(250);
        assert_eq!(cmd.total_exec_time_ms(), 350);
    }

    #[test]
    fn test_status_transitions() {
        let cmd = command(&["smoke"]);
        cmd.set_status(CommandStatus::Running);
        assert_eq!(cmd.status(), CommandStatus::Running);
        cmd.set_status(CommandStatus::Terminated);
        assert!(!cmd.status().is_live());
    }
}
