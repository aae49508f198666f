//! Command executor
//!
//! Runs one command to completion with a working directory and a timeout.
//! A non-zero exit is data, not an error. On timeout, or when the returned
//! future is dropped, the whole process group is killed so shell pipelines
//! and their children never outlive the call.

use crate::error::SandboxError;
use crate::types::ExecutionResult;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// How long to keep draining pipes once the direct child has exited
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// One command invocation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program to execute
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory (must exist)
    pub cwd: PathBuf,
    /// Extra environment
    pub env: Vec<(String, String)>,
    /// Hard timeout
    pub timeout: Duration,
}

impl CommandSpec {
    /// Create an argv command
    #[must_use]
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
            timeout,
        }
    }

    /// Create a `sh -c` command
    #[must_use]
    pub fn shell(command: &str, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::new("sh", cwd, timeout).args(["-c", command])
    }

    /// Append one argument
    #[inline]
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable
    #[inline]
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Human-readable command line
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runs commands as child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    /// Create new executor
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Run a shell command line
    ///
    /// # Errors
    /// - `SandboxError::WorkingDirMissing` if `working_dir` does not exist
    /// - `SandboxError::Spawn` if the shell cannot be started
    pub async fn run(
        &self,
        command: &str,
        working_dir: &Path,
        timeout: Duration,
    ) -> Result<ExecutionResult, SandboxError> {
        self.run_spec(&CommandSpec::shell(command, working_dir, timeout))
            .await
    }

    /// Run an argv command
    ///
    /// # Errors
    /// Same as [`CommandExecutor::run`]; a non-zero exit or timeout is
    /// reported in the returned [`ExecutionResult`].
    pub async fn run_spec(&self, spec: &CommandSpec) -> Result<ExecutionResult, SandboxError> {
        if !spec.cwd.is_dir() {
            return Err(SandboxError::WorkingDirMissing(spec.cwd.clone()));
        }

        let command_line = spec.display();
        tracing::debug!(command = %command_line, cwd = %spec.cwd.display(), "running command");

        let started = Instant::now();
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        let pid = child.id();
        let mut group = GroupGuard(pid);

        let stdout_capture = Capture::start(child.stdout.take());
        let stderr_capture = Capture::start(child.stderr.take());

        let (exit_code, timed_out) = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(status) => (status?.code().unwrap_or(-1), false),
            Err(_) => {
                tracing::warn!(
                    command = %command_line,
                    timeout_secs = spec.timeout.as_secs(),
                    "command timed out, killing process group"
                );
                kill_tree(&mut child, pid).await;
                (-1, true)
            }
        };

        let ((stdout, stdout_drained), (stderr, stderr_drained)) =
            tokio::join!(stdout_capture.finish(), stderr_capture.finish());
        if stdout_drained && stderr_drained {
            group.disarm();
        } else {
            tracing::debug!(
                command = %command_line,
                "pipes still held after exit, killing process group"
            );
        }
        drop(group);

        let mut stderr = String::from_utf8_lossy(&stderr).into_owned();
        if timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "command timed out after {}s",
                spec.timeout.as_secs()
            ));
        }

        let result = ExecutionResult {
            success: !timed_out && exit_code == 0,
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            timed_out,
        };

        tracing::debug!(
            command = %command_line,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            duration_ms = result.duration_ms,
            "command finished"
        );

        Ok(result)
    }
}

/// Kills the child's process group when dropped unless disarmed
///
/// Held across `run_spec` so a cancelled run takes its descendants with it.
struct GroupGuard(Option<u32>);

impl GroupGuard {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.0.take() {
            if let Err(e) = kill_process_group(pid) {
                tracing::debug!(pid, error = %e, "process group already gone");
            }
        }
    }
}

/// Pipe reader that keeps what it has read so far
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl Capture {
    fn start<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let task = tokio::spawn(async move {
            let Some(mut reader) = reader else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { buf, task }
    }

    /// Wait up to [`DRAIN_GRACE`] for EOF; returns the bytes read and
    /// whether the pipe was fully drained
    async fn finish(mut self) -> (Vec<u8>, bool) {
        let drained = tokio::time::timeout(DRAIN_GRACE, &mut self.task)
            .await
            .is_ok();
        if !drained {
            self.task.abort();
        }
        let bytes = std::mem::take(&mut *self.buf.lock());
        (bytes, drained)
    }
}

async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        if let Err(e) = kill_process_group(pid) {
            tracing::debug!(pid, error = %e, "process group already gone");
        }
    }
    let _ = child.kill().await;
}

/// SIGKILL every process in the group led by `pid`
///
/// # Errors
/// Returns the OS error, e.g. `ESRCH` when the group has already exited.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) -> Result<(), std::io::Error> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    killpg(Pid::from_raw(raw), Signal::SIGKILL).map_err(std::io::Error::from)
}

/// Process groups are unix-only; nothing to signal elsewhere
#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) -> Result<(), std::io::Error> {
    Ok(())
}

/// Last `max_bytes` of `text`, cut on a char boundary
#[must_use]
pub fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Whether `pid` is gone (or a zombie) within `within`
#[cfg(all(test, target_os = "linux"))]
pub(crate) async fn exited_within(pid: u32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        let exited = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        };
        if exited {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cwd() -> PathBuf {
        std::env::temp_dir()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let result = CommandExecutor::new()
            .run("echo hello", &cwd(), Duration::from_secs(10))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_is_data() {
        let result = CommandExecutor::new()
            .run("echo boom >&2; exit 3", &cwd(), Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr.trim(), "boom");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let started = Instant::now();
        let result = CommandExecutor::new()
            .run("sleep 30", &cwd(), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.timed_out);
        assert!(result.stderr.contains("timed out after 1s"));
        assert!(started.elapsed() < Duration::from_secs(1) + DRAIN_GRACE + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn timeout_kills_whole_tree() {
        let started = Instant::now();
        let result = CommandExecutor::new()
            .run("sleep 30 & sleep 30; wait", &cwd(), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(result.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn output_survives_a_background_child_holding_the_pipe() {
        let started = Instant::now();
        let result = CommandExecutor::new()
            .run("echo important; sleep 30 &", &cwd(), Duration::from_secs(10))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.stdout.trim(), "important");
        assert!(!result.timed_out);
        assert!(started.elapsed() < DRAIN_GRACE + Duration::from_secs(3));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropped_run_kills_the_process_group() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("background.pid");
        let executor = CommandExecutor::new();
        let run = executor.run(
            "sleep 30 & echo $! > background.pid; wait",
            dir.path(),
            Duration::from_secs(60),
        );

        assert!(tokio::time::timeout(Duration::from_millis(500), run).await.is_err());

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(exited_within(pid, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn missing_working_dir_is_an_error() {
        let err = CommandExecutor::new()
            .run("true", Path::new("/definitely/not/here"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::WorkingDirMissing(_)));
    }

    #[tokio::test]
    async fn spec_passes_environment() {
        let spec = CommandSpec::shell("printf %s \"$GREETING\"", cwd(), Duration::from_secs(5))
            .env("GREETING", "hi there");
        let result = CommandExecutor::new().run_spec(&spec).await.unwrap();
        assert_eq!(result.stdout, "hi there");
    }

    #[test]
    fn spec_display_joins_argv() {
        let spec = CommandSpec::new("docker", "/tmp", Duration::from_secs(1))
            .args(["rm", "-f"])
            .arg("vera-1234abcd");
        assert_eq!(spec.display(), "docker rm -f vera-1234abcd");
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("aé", 1), "");
    }
}
