//! Isolation backend contract
//!
//! A backend provisions the isolated runtime for one project according to
//! its [`Strategy`] and releases it again. Backends match the strategy
//! exhaustively; adding a strategy is a compile-time change everywhere.

use crate::error::{SandboxError, TeardownWarning};
use crate::types::{ProjectId, StartupConfig, Strategy};
use async_trait::async_trait;
use std::path::PathBuf;

/// Everything a backend needs to provision or release one project
#[derive(Debug, Clone)]
pub struct Provision {
    /// Namespacing identifier
    pub project_id: ProjectId,
    /// Project root on disk
    pub project_dir: PathBuf,
    /// Startup plan
    pub config: StartupConfig,
    /// Selected strategy
    pub strategy: Strategy,
    /// Port published on the host
    pub host_port: u16,
}

impl Provision {
    /// Directory where project commands execute
    #[inline]
    #[must_use]
    pub fn command_dir(&self) -> PathBuf {
        self.config.command_dir(&self.project_dir)
    }

    /// Environment for the service, as `KEY=VALUE` pairs
    pub fn env_pairs(&self) -> impl Iterator<Item = String> + '_ {
        self.config.env_vars.iter().map(|(k, v)| format!("{k}={v}"))
    }
}

/// Provisions and releases isolated runtimes
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Backend name for diagnostics
    fn name(&self) -> &'static str;

    /// Build and start the runtime
    ///
    /// Fails fast on the first step that fails; the caller tears down.
    async fn provision(&self, provision: &Provision) -> Result<(), SandboxError>;

    /// Release every resource in the project's namespace
    ///
    /// Idempotent: releasing absent resources yields warnings at most.
    async fn teardown(&self, provision: &Provision) -> Vec<TeardownWarning>;

    /// Recent runtime output, best effort
    async fn logs(&self, provision: &Provision) -> String;
}
