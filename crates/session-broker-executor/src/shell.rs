//! Shell selection for `run`.

use std::path::{Path, PathBuf};

/// Shells known to understand `trap ... EXIT`.
const POSIX_SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh"];

/// The shell that executes command strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shell {
    /// Shell executable.
    pub program: PathBuf,
    /// Flag that makes the shell run its next argument as a script.
    pub flag: &'static str,
    /// Whether the shell accepts POSIX syntax, needed for directory tracking.
    pub posix: bool,
}

impl Shell {
    /// The platform shell: `cmd /C` on Windows, otherwise `$SHELL` when it
    /// is a known POSIX shell and `/bin/sh` when it is not.
    #[must_use]
    pub fn detect() -> Self {
        if cfg!(windows) {
            return Self {
                program: PathBuf::from("cmd"),
                flag: "/C",
                posix: false,
            };
        }
        Self::from_env_value(std::env::var("SHELL").ok().as_deref())
    }

    fn from_env_value(value: Option<&str>) -> Self {
        value
            .and_then(|v| Self::posix_at(Path::new(v)))
            .unwrap_or_else(|| Self::posix_unchecked(PathBuf::from("/bin/sh")))
    }

    /// A POSIX shell at `path`, if `path` is an existing absolute file whose
    /// name is a known POSIX shell.
    #[must_use]
    pub fn posix_at(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        (path.is_absolute() && path.is_file() && POSIX_SHELLS.contains(&name))
            .then(|| Self::posix_unchecked(path.to_path_buf()))
    }

    const fn posix_unchecked(program: PathBuf) -> Self {
        Self {
            program,
            flag: "-c",
            posix: true,
        }
    }
}

/// Resolve an executable by name. Absolute paths are taken as-is when they
/// exist; anything else is searched on `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() && path.is_file() {
        return Some(path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}
