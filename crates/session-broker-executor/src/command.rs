//! Shell invocation building.

use std::path::PathBuf;

use thiserror::Error;

use crate::shell::{Shell, resolve_executable_path};

/// Environment variable naming the file that receives the shell's final
/// working directory.
pub const CWD_FILE_ENV: &str = "SESSION_BROKER_CWD_FILE";

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::ExecutableNotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for shell invocations.
///
/// The base is a shell command line such as `/bin/bash` or
/// `bash -o pipefail`; the user's command is passed as the final argument
/// after the shell's "run this string" flag.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base shell command.
    pub base: String,
    /// Parameters placed between the base and the script.
    pub params: Option<Vec<String>>,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::for_shell(&Shell::detect())
    }
}

impl CommandBuilder {
    /// Create a new command builder.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: None,
        }
    }

    /// Invocation of `shell` with its script flag.
    #[must_use]
    pub fn for_shell(shell: &Shell) -> Self {
        let program = shell.program.to_string_lossy();
        let base = shlex::try_quote(&program).map_or_else(|_| program.to_string(), |q| q.into_owned());
        Self::new(base).params([shell.flag])
    }

    /// Set parameters.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params = Some(params.into_iter().map(Into::into).collect());
        self
    }

    /// Build the invocation for a script.
    ///
    /// # Errors
    /// Returns error if the base command is invalid.
    pub fn build(&self, script: &str) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;
        if let Some(ref params) = self.params {
            parts.extend(params.iter().cloned());
        }
        parts.push(script.to_string());

        if parts.len() < 2 {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

/// Wrap a POSIX shell script so its final working directory is written to
/// the file named by [`CWD_FILE_ENV`] when the shell exits, including via
/// `exit`. The script's own exit status is preserved.
#[must_use]
pub fn with_directory_tracking(script: &str) -> String {
    format!("trap 'pwd -P > \"${CWD_FILE_ENV}\"' EXIT\n{script}")
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    #[cfg(windows)]
    {
        let parts = winsplit::split(input);
        if parts.is_empty() {
            Err(CommandBuildError::EmptyCommand)
        } else {
            Ok(parts)
        }
    }

    #[cfg(not(windows))]
    {
        let parts =
            shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))?;
        if parts.is_empty() {
            Err(CommandBuildError::EmptyCommand)
        } else {
            Ok(parts)
        }
    }
}
