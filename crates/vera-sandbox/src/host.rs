//! Host process backend
//!
//! Runs the native-runtime strategy directly on the host, without a
//! container: the install command runs to completion, then the start command
//! is spawned detached in its own process group. Teardown kills the group.
//! Only suitable for trusted projects and for environments without a
//! container engine.

use crate::backend::{IsolationBackend, Provision};
use crate::error::{SandboxError, TeardownWarning};
use crate::exec::{kill_process_group, tail, CommandExecutor, CommandSpec};
use crate::types::{ProjectId, Strategy};
use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::{Child, Command};

/// Bytes of log output returned by [`HostBackend::logs`]
const LOG_TAIL: usize = 16 * 1024;

struct HostProcess {
    child: Child,
    pid: Option<u32>,
    log: NamedTempFile,
}

impl Drop for HostProcess {
    fn drop(&mut self) {
        // Teardown takes the pid; anything left here was never torn down.
        if let Some(pid) = self.pid.take() {
            if let Err(e) = kill_process_group(pid) {
                tracing::debug!(pid, error = %e, "service process group already gone");
            }
        }
    }
}

/// Isolation backend that runs services as host process groups
pub struct HostBackend {
    executor: CommandExecutor,
    install_timeout: Duration,
    teardown_timeout: Duration,
    processes: DashMap<ProjectId, HostProcess>,
}

impl HostBackend {
    /// Create new backend
    #[must_use]
    pub fn new(install_timeout: Duration, teardown_timeout: Duration) -> Self {
        Self {
            executor: CommandExecutor::new(),
            install_timeout,
            teardown_timeout,
            processes: DashMap::new(),
        }
    }

    /// Number of service processes currently tracked
    #[inline]
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.processes.len()
    }

    async fn install(&self, provision: &Provision, command: &str) -> Result<(), SandboxError> {
        let mut spec = CommandSpec::shell(command, provision.command_dir(), self.install_timeout);
        for (key, value) in &provision.config.env_vars {
            spec = spec.env(key.clone(), value.clone());
        }
        let result = self.executor.run_spec(&spec).await?;
        if result.timed_out {
            return Err(SandboxError::StepTimedOut {
                step: "install",
                timeout_secs: self.install_timeout.as_secs(),
            });
        }
        if !result.success {
            return Err(SandboxError::StepFailed {
                step: "install",
                exit_code: result.exit_code,
                stderr: tail(result.stderr.trim(), 2000).to_string(),
            });
        }
        Ok(())
    }

    fn spawn_service(&self, provision: &Provision, command: &str) -> Result<(), SandboxError> {
        let log = NamedTempFile::new()?;
        let stdout = log.reopen()?;
        let stderr = log.reopen()?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(provision.command_dir())
            .envs(&provision.config.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if provision.host_port != provision.config.service_port {
            cmd.env("PORT", provision.host_port.to_string());
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let pid = child.id();
        tracing::info!(project_id = %provision.project_id, ?pid, "service process started");

        self.processes
            .insert(provision.project_id.clone(), HostProcess { child, pid, log });
        Ok(())
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(600), Duration::from_secs(30))
    }
}

impl std::fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBackend")
            .field("install_timeout", &self.install_timeout)
            .field("tracked", &self.processes.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IsolationBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn provision(&self, provision: &Provision) -> Result<(), SandboxError> {
        match provision.strategy {
            Strategy::NativeRuntime => {}
            strategy @ (Strategy::Compose | Strategy::ImageBuild) => {
                return Err(SandboxError::Unsupported {
                    strategy,
                    backend: self.name(),
                });
            }
        }

        let start = provision
            .config
            .start()
            .ok_or(SandboxError::MissingStartCommand)?;
        let dir = provision.command_dir();
        if !dir.is_dir() {
            return Err(SandboxError::WorkingDirMissing(dir));
        }

        if let Some(install) = provision.config.install() {
            tracing::info!(project_id = %provision.project_id, command = install, "installing");
            self.install(provision, install).await?;
        }

        self.spawn_service(provision, start)
    }

    async fn teardown(&self, provision: &Provision) -> Vec<TeardownWarning> {
        let Some((_, mut process)) = self.processes.remove(&provision.project_id) else {
            return Vec::new();
        };

        let mut warnings = Vec::new();
        if let Some(pid) = process.pid.take() {
            if let Err(e) = kill_process_group(pid) {
                if e.raw_os_error() != Some(nix::libc::ESRCH) {
                    warnings.push(TeardownWarning::new("kill process group", e.to_string()));
                }
            }
        }
        let _ = process.child.start_kill();
        match tokio::time::timeout(self.teardown_timeout, process.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(project_id = %provision.project_id, %status, "service process reaped");
            }
            Ok(Err(e)) => warnings.push(TeardownWarning::new("wait", e.to_string())),
            Err(_) => warnings.push(TeardownWarning::new(
                "wait",
                format!("not reaped after {}s", self.teardown_timeout.as_secs()),
            )),
        }
        warnings
    }

    async fn logs(&self, provision: &Provision) -> String {
        let path = match self.processes.get(&provision.project_id) {
            Some(entry) => entry.log.path().to_path_buf(),
            None => return String::new(),
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => tail(&String::from_utf8_lossy(&bytes), LOG_TAIL).to_string(),
            Err(e) => format!("Failed to get logs: {e}"),
        }
    }
}
