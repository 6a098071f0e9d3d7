//! Command executor for the session broker.
//!
//! Provides:
//! - `cd`, `read`, `write` and `run` against an explicit working directory
//! - Shell selection and invocation building
//! - Process-group timeouts for shell commands

pub mod command;
pub mod error;
pub mod executor;
pub mod paths;
pub mod shell;

pub use command::{CommandBuilder, CommandParts};
pub use error::ExecError;
pub use executor::{CommandExecutor, ReadOutcome, RunOutcome, RunRequest, WriteOutcome};
