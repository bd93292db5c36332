//! Error types for the Farmhand scheduler

use thiserror::Error;

/// Alias for `Result<T, SchedulerError>`
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors surfaced by the scheduler control API.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The scheduler has been shut down and accepts no new commands
    #[error("scheduler is shut down")]
    Closed,

    /// The command line was rejected by the configuration factory
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors produced while turning an argument vector into a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No argument tokens were supplied
    #[error("empty command line")]
    Empty,

    /// The argument tokens did not parse
    #[error("invalid command arguments: {0}")]
    InvalidArgs(String),
}

/// Errors an invocation run can end with.
///
/// `Interrupted` is the cooperative-stop signal raised by the suspension
/// helpers; the other variants are terminal failures of the run itself.
#[derive(Error, Debug)]
pub enum InvocationError {
    /// A suspension point observed a stop request
    #[error("invocation interrupted")]
    Interrupted,

    /// The device dropped out mid-run; terminal for this worker
    #[error("device not available: {0}")]
    DeviceNotAvailable(String),

    /// Any other failure inside the invocation
    #[error("invocation failed: {0}")]
    Failed(String),
}
