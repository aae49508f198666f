//! Error types for the sandbox layer
//!
//! Provisioning failures raise immediately; the caller owns teardown of
//! whatever partially exists. Teardown never raises and reports
//! [`TeardownWarning`] values instead.

use crate::types::Strategy;
use std::path::PathBuf;

/// Sandbox error
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Working directory does not exist
    #[error("working directory does not exist: {0}")]
    WorkingDirMissing(PathBuf),

    /// Process could not be spawned
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        /// Command line
        command: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Required manifest not found
    #[error("no {kind} manifest found in {dir}")]
    ManifestMissing {
        /// Manifest kind (compose, build)
        kind: &'static str,
        /// Directory searched
        dir: PathBuf,
    },

    /// Manifest exists but cannot be used
    #[error("invalid manifest {path}: {reason}")]
    InvalidManifest {
        /// Manifest path
        path: PathBuf,
        /// Why it was rejected
        reason: String,
    },

    /// Plan has no start command
    #[error("no start command provided")]
    MissingStartCommand,

    /// Provisioning step exited non-zero
    #[error("{step} failed (exit {exit_code}): {stderr}")]
    StepFailed {
        /// Step name
        step: &'static str,
        /// Exit code
        exit_code: i32,
        /// Captured stderr (tail)
        stderr: String,
    },

    /// Provisioning step exceeded its timeout
    #[error("{step} timed out after {timeout_secs}s")]
    StepTimedOut {
        /// Step name
        step: &'static str,
        /// Timeout in seconds
        timeout_secs: u64,
    },

    /// Backend cannot run this strategy
    #[error("{backend} backend does not support the {strategy} strategy")]
    Unsupported {
        /// Requested strategy
        strategy: Strategy,
        /// Backend name
        backend: &'static str,
    },
}

impl SandboxError {
    /// Check if the error was a timeout
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::StepTimedOut { .. })
    }
}

/// Health check deadline exhausted
#[derive(Debug, Clone, thiserror::Error)]
#[error("health check timeout after {waited_secs}s waiting for {url}")]
pub struct HealthCheckTimeout {
    /// Probed URL
    pub url: String,
    /// Seconds waited
    pub waited_secs: u64,
    /// Runtime logs captured for diagnosis
    pub logs: String,
}

impl HealthCheckTimeout {
    /// Attach captured logs
    #[inline]
    #[must_use]
    pub fn with_logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = logs.into();
        self
    }
}

/// Non-fatal problem found while releasing resources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownWarning {
    /// Step that misbehaved
    pub step: &'static str,
    /// Description
    pub message: String,
}

impl TeardownWarning {
    /// Create new warning
    #[inline]
    #[must_use]
    pub fn new(step: &'static str, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TeardownWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}
