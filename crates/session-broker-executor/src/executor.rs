//! The four primitive operations: cd, read, write, run.
//!
//! Every operation takes the session's current directory explicitly and
//! returns a structured outcome; none of them touch session state. Only `cd`
//! and `run` can yield a new working directory, and it is up to the caller
//! to apply it.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use command_group::AsyncCommandGroup;
use serde::Serialize;
use session_broker_core::fs::atomic_write;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::Mutex,
    task::JoinHandle,
};

use crate::{
    ExecError,
    command::{CWD_FILE_ENV, CommandBuilder, with_directory_tracking},
    paths,
    shell::Shell,
};

/// How long to keep draining pipes after the shell itself has exited.
/// Background jobs that inherited the pipes would otherwise block forever.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// A shell command to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Shell command line.
    pub command: String,
    /// Hard limit on wall time.
    pub timeout: Duration,
    /// Directory to run in instead of the session's directory. When set,
    /// the session's directory is never changed by the command.
    pub working_directory: Option<String>,
}

impl RunRequest {
    /// Create a request that runs in the session's directory.
    #[must_use]
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            working_directory: None,
        }
    }

    /// Run in an explicit directory instead.
    #[must_use]
    pub fn in_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

/// Result of reading a file.
#[derive(Debug, Clone, Serialize)]
pub struct ReadOutcome {
    pub path: PathBuf,
    pub content: String,
    pub bytes: usize,
}

/// Result of writing a file.
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub path: PathBuf,
    pub bytes_written: usize,
    pub created_dirs: bool,
}

/// Result of a command that ran to completion.
///
/// A non-zero exit code is a normal outcome, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub command: String,
    pub working_directory: PathBuf,
    pub stdout: String,
    pub stderr: String,
    /// `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub duration: f64,
    /// The shell's final directory, when it differs from where it started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_directory: Option<PathBuf>,
}

impl RunOutcome {
    /// Whether the command exited with status zero.
    #[must_use]
    pub const fn exited_successfully(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// Executes operations against the real filesystem and OS.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: CommandBuilder,
    track_directory: bool,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor {
    /// Create an executor using the platform shell.
    #[must_use]
    pub fn new() -> Self {
        let shell = Shell::detect();
        Self {
            shell: CommandBuilder::for_shell(&shell),
            track_directory: shell.posix,
        }
    }

    /// Resolve a directory change.
    ///
    /// # Errors
    /// Returns `NotFound` or `NotADirectory` if the target is invalid.
    pub async fn cd(&self, cwd: &Path, target: &str) -> Result<PathBuf, ExecError> {
        if target.trim().is_empty() {
            return Err(ExecError::InvalidRequest("directory must not be empty".into()));
        }
        let candidate = paths::join(cwd, target);
        let resolved = tokio::fs::canonicalize(&candidate)
            .await
            .map_err(|e| ExecError::from_io("resolving directory", &candidate, e))?;
        ensure_directory(&resolved).await?;
        Ok(resolved)
    }

    /// Read a UTF-8 text file.
    ///
    /// # Errors
    /// Returns `NotFound`, `IsADirectory`, or `Decode` for non-text content.
    pub async fn read(&self, cwd: &Path, path: &str) -> Result<ReadOutcome, ExecError> {
        if path.trim().is_empty() {
            return Err(ExecError::InvalidRequest("file path must not be empty".into()));
        }
        let joined = paths::join(cwd, path);
        let path = tokio::fs::canonicalize(&joined)
            .await
            .map_err(|e| ExecError::from_io("reading file", &joined, e))?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ExecError::from_io("reading file", &path, e))?;
        if meta.is_dir() {
            return Err(ExecError::IsADirectory(path));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ExecError::from_io("reading file", &path, e))?;
        let len = bytes.len();
        let content = String::from_utf8(bytes).map_err(|_| ExecError::Decode(path.clone()))?;

        Ok(ReadOutcome {
            path,
            content,
            bytes: len,
        })
    }

    /// Atomically write a text file.
    ///
    /// # Errors
    /// Returns `NotFound` if the parent is missing and `create_dirs` is off,
    /// `PermissionDenied`, or `Io`.
    pub async fn write(
        &self,
        cwd: &Path,
        path: &str,
        content: &str,
        create_dirs: bool,
    ) -> Result<WriteOutcome, ExecError> {
        if path.trim().is_empty() {
            return Err(ExecError::InvalidRequest("file path must not be empty".into()));
        }
        let requested = paths::resolve(cwd, path);
        let path = paths::follow_links(&requested)
            .await
            .map_err(|e| ExecError::from_io("resolving symlink", &requested, e))?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ExecError::InvalidRequest(format!("{} has no parent", path.display())))?;

        let mut created_dirs = false;
        if !tokio::fs::try_exists(&parent).await.unwrap_or(false) {
            if !create_dirs {
                return Err(ExecError::NotFound(parent));
            }
            tokio::fs::create_dir_all(&parent)
                .await
                .map_err(|e| ExecError::from_io("creating directories", &parent, e))?;
            created_dirs = true;
        }

        let target = path.clone();
        let bytes = content.as_bytes().to_vec();
        let bytes_written = bytes.len();
        tokio::task::spawn_blocking(move || atomic_write(&target, &bytes))
            .await
            .map_err(|e| ExecError::Io {
                operation: "writing file",
                path: path.clone(),
                source: std::io::Error::other(e),
            })?
            .map_err(|e| ExecError::from_io("writing file", &path, e))?;

        Ok(WriteOutcome {
            path,
            bytes_written,
            created_dirs,
        })
    }

    /// Run a shell command in its own process group.
    ///
    /// # Errors
    /// Returns `Timeout` (after killing the whole group) if the command
    /// outlives `request.timeout`, or an error if it cannot be started.
    pub async fn run(&self, cwd: &Path, request: &RunRequest) -> Result<RunOutcome, ExecError> {
        if request.command.trim().is_empty() {
            return Err(ExecError::InvalidRequest("command must not be empty".into()));
        }
        if request.timeout.is_zero() {
            return Err(ExecError::InvalidRequest("timeout must be positive".into()));
        }

        let (dir, track) = match request.working_directory.as_deref() {
            Some(override_dir) => (self.cd(cwd, override_dir).await?, false),
            None => {
                ensure_directory(cwd).await?;
                (cwd.to_path_buf(), self.track_directory)
            }
        };

        let tracker = if track {
            Some(
                tempfile::NamedTempFile::new()
                    .map_err(|e| ExecError::from_io("creating directory tracker", &dir, e))?,
            )
        } else {
            None
        };

        let script = if tracker.is_some() {
            with_directory_tracking(&request.command)
        } else {
            request.command.clone()
        };
        let (program, args) = self.shell.build(&script)?.into_resolved().await?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref tracker) = tracker {
            cmd.env(CWD_FILE_ENV, tracker.path());
        }

        let started = Instant::now();
        let mut child = cmd.group_spawn().map_err(ExecError::SpawnFailed)?;
        let pid = child.id();
        tracing::debug!(?pid, dir = %dir.display(), "Spawned command");

        let stdout = OutputCapture::start(child.inner().stdout.take());
        let stderr = OutputCapture::start(child.inner().stderr.take());

        let waited = tokio::time::timeout(request.timeout, child.wait()).await;
        let status = match waited {
            Ok(status) => status.map_err(|e| ExecError::Io {
                operation: "waiting for command",
                path: dir.clone(),
                source: e,
            })?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(?pid, error = %e, "Failed to kill timed-out process group");
                }
                tracing::info!(?pid, timeout = ?request.timeout, "Command timed out");
                return Err(ExecError::Timeout {
                    timeout: request.timeout,
                    stdout: stdout.finish().await,
                    stderr: stderr.finish().await,
                });
            }
        };

        let stdout = stdout.finish().await;
        let stderr = stderr.finish().await;
        let duration = started.elapsed().as_secs_f64();

        let new_directory = match tracker {
            Some(tracker) => final_directory(tracker.path(), &dir).await,
            None => None,
        };

        Ok(RunOutcome {
            command: request.command.clone(),
            working_directory: dir,
            stdout,
            stderr,
            exit_code: status.code(),
            duration,
            new_directory,
        })
    }
}

async fn ensure_directory(path: &Path) -> Result<(), ExecError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| ExecError::from_io("inspecting directory", path, e))?;
    if meta.is_dir() {
        Ok(())
    } else {
        Err(ExecError::NotADirectory(path.to_path_buf()))
    }
}

async fn final_directory(tracker: &Path, started_in: &Path) -> Option<PathBuf> {
    let recorded = tokio::fs::read_to_string(tracker).await.ok()?;
    let recorded = recorded.trim();
    if recorded.is_empty() {
        return None;
    }
    let recorded = PathBuf::from(recorded);
    let started_in = tokio::fs::canonicalize(started_in)
        .await
        .unwrap_or_else(|_| started_in.to_path_buf());
    (recorded.is_absolute() && recorded != started_in).then_some(recorded)
}

/// Drains a child pipe into a shared buffer so partial output survives
/// even if the reader has to be abandoned.
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl OutputCapture {
    fn start<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let task = reader.map(|mut reader| {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => buffer.lock().await.extend_from_slice(&chunk[..n]),
                        Err(e) => {
                            tracing::debug!(error = %e, "Output pipe read failed");
                            break;
                        }
                    }
                }
            })
        });
        Self { buffer, task }
    }

    async fn finish(mut self) -> String {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(OUTPUT_GRACE, &mut task).await.is_err() {
                tracing::debug!("Output pipe still open after exit, abandoning reader");
                task.abort();
            }
        }
        String::from_utf8_lossy(&self.buffer.lock().await).into_owned()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn canonical_tempdir() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().canonicalize().unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn cd_resolves_relative_directories() {
        let (_dir, root) = canonical_tempdir();
        std::fs::create_dir(root.join("sub")).unwrap();

        let resolved = CommandExecutor::new().cd(&root, "sub/../sub").await.unwrap();
        assert_eq!(resolved, root.join("sub"));
    }

    #[tokio::test]
    async fn cd_rejects_missing_and_non_directories() {
        let (_dir, root) = canonical_tempdir();
        std::fs::write(root.join("file.txt"), "x").unwrap();
        let executor = CommandExecutor::new();

        let missing = executor.cd(&root, "nope").await.unwrap_err();
        assert!(matches!(missing, ExecError::NotFound(_)));

        let file = executor.cd(&root, "file.txt").await.unwrap_err();
        assert!(matches!(file, ExecError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn read_reports_content_and_length() {
        let (_dir, root) = canonical_tempdir();
        std::fs::write(root.join("hello.txt"), "héllo").unwrap();

        let outcome = CommandExecutor::new().read(&root, "hello.txt").await.unwrap();
        assert_eq!(outcome.content, "héllo");
        assert_eq!(outcome.bytes, 6);
    }

    #[tokio::test]
    async fn read_rejects_binary_content() {
        let (_dir, root) = canonical_tempdir();
        std::fs::write(root.join("blob.bin"), [0xff, 0xfe, 0x00, 0x80]).unwrap();

        let err = CommandExecutor::new().read(&root, "blob.bin").await.unwrap_err();
        assert!(matches!(err, ExecError::Decode(_)));
    }

    #[tokio::test]
    async fn write_creates_parents_only_when_asked() {
        let (_dir, root) = canonical_tempdir();
        let executor = CommandExecutor::new();

        let err = executor
            .write(&root, "a/b/c.txt", "data", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::NotFound(_)));

        let outcome = executor.write(&root, "a/b/c.txt", "data", true).await.unwrap();
        assert!(outcome.created_dirs);
        assert_eq!(outcome.bytes_written, 4);
        assert_eq!(std::fs::read_to_string(root.join("a/b/c.txt")).unwrap(), "data");
    }

    #[tokio::test]
    async fn write_then_read_returns_written_content() {
        let (_dir, root) = canonical_tempdir();
        let executor = CommandExecutor::new();
        executor.write(&root, "notes.md", "first", true).await.unwrap();
        executor.write(&root, "notes.md", "second version", true).await.unwrap();

        let outcome = executor.read(&root, "notes.md").await.unwrap();
        assert_eq!(outcome.content, "second version");
    }

    #[tokio::test]
    async fn cd_resolves_parent_of_symlink_target() {
        let (_dir, root) = canonical_tempdir();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::os::unix::fs::symlink(root.join("a/b"), root.join("link")).unwrap();

        let resolved = CommandExecutor::new().cd(&root, "link/..").await.unwrap();
        assert_eq!(resolved, root.join("a"));
    }

    #[tokio::test]
    async fn write_through_symlink_updates_the_target() {
        let (_dir, root) = canonical_tempdir();
        std::fs::create_dir(root.join("real")).unwrap();
        std::fs::write(root.join("real/config.txt"), "old").unwrap();
        std::os::unix::fs::symlink("real/config.txt", root.join("link.txt")).unwrap();

        let outcome = CommandExecutor::new()
            .write(&root, "link.txt", "new", false)
            .await
            .unwrap();

        assert_eq!(outcome.path, root.join("real/config.txt"));
        assert!(std::fs::symlink_metadata(root.join("link.txt")).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_to_string(root.join("real/config.txt")).unwrap(), "new");
    }

    #[tokio::test]
    async fn write_through_dangling_symlink_creates_the_target() {
        let (_dir, root) = canonical_tempdir();
        std::fs::create_dir(root.join("real")).unwrap();
        std::os::unix::fs::symlink("real/fresh.txt", root.join("link.txt")).unwrap();

        CommandExecutor::new()
            .write(&root, "link.txt", "hello", false)
            .await
            .unwrap();

        assert!(std::fs::symlink_metadata(root.join("link.txt")).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_to_string(root.join("real/fresh.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn interrupted_write_leaves_previous_content() {
        let (_dir, root) = canonical_tempdir();
        let executor = CommandExecutor::new();
        executor.write(&root, "config.toml", "old = true", true).await.unwrap();

        // A crash between the temp write and the rename leaves a stray temp
        // file behind and the target untouched.
        let mut stray = tempfile::Builder::new()
            .prefix(".broker-")
            .suffix(".tmp")
            .tempfile_in(&root)
            .unwrap();
        std::io::Write::write_all(&mut stray, b"new = tr").unwrap();
        let (_file, _stray_path) = stray.keep().unwrap();

        let outcome = executor.read(&root, "config.toml").await.unwrap();
        assert_eq!(outcome.content, "old = true");
    }

    #[tokio::test]
    async fn run_captures_output_streams() {
        let (_dir, root) = canonical_tempdir();
        let request = RunRequest::new("echo out; echo err >&2", Duration::from_secs(10));

        let outcome = CommandExecutor::new().run(&root, &request).await.unwrap();
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert!(outcome.exited_successfully());
        assert_eq!(outcome.new_directory, None);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_normal_outcome() {
        let (_dir, root) = canonical_tempdir();
        let request = RunRequest::new("exit 1", Duration::from_secs(10));

        let outcome = CommandExecutor::new().run(&root, &request).await.unwrap();
        assert_eq!(outcome.exit_code, Some(1));
        assert!(!outcome.exited_successfully());
    }

    #[tokio::test]
    async fn timeout_kills_the_process_group() {
        let (_dir, root) = canonical_tempdir();
        let request = RunRequest::new("sleep 1 && touch finished", Duration::from_millis(100));

        let started = Instant::now();
        let err = CommandExecutor::new().run(&root, &request).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(900));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!root.join("finished").exists());
    }

    #[tokio::test]
    async fn cd_inside_run_moves_the_session_directory() {
        let (_dir, root) = canonical_tempdir();
        std::fs::create_dir(root.join("build")).unwrap();
        let request = RunRequest::new("cd build && exit 3", Duration::from_secs(10));

        let outcome = CommandExecutor::new().run(&root, &request).await.unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.new_directory, Some(root.join("build")));
    }

    #[tokio::test]
    async fn override_directory_is_not_tracked() {
        let (_dir, root) = canonical_tempdir();
        std::fs::create_dir(root.join("elsewhere")).unwrap();
        let request = RunRequest::new("pwd; cd /", Duration::from_secs(10)).in_directory("elsewhere");

        let outcome = CommandExecutor::new().run(&root, &request).await.unwrap();
        assert_eq!(outcome.working_directory, root.join("elsewhere"));
        assert_eq!(outcome.new_directory, None);
    }

    #[tokio::test]
    async fn empty_command_is_invalid() {
        let (_dir, root) = canonical_tempdir();
        let request = RunRequest::new("  ", Duration::from_secs(1));
        let err = CommandExecutor::new().run(&root, &request).await.unwrap_err();
        assert!(matches!(err, ExecError::InvalidRequest(_)));
    }
}
