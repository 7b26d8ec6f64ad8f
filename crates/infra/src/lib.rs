//! Store-facing layer of the job engine: job persistence, leases, execution,
//! variable scopes and unit-of-work commands.

pub mod command;
pub mod config;
pub mod jobs;
pub mod scope;

pub use command::{Command, CommandContext, CommandExecutor};
pub use config::{JobServiceConfig, LengthUnit, MessageLimit};
