//! Running project handle

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vera_sandbox::{ProjectId, Provision, StartupConfig, Strategy};

/// Lifecycle state of a project instance
///
/// Moves strictly forward: Created → Started → Stopped, or Created → Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    /// Allocated, runtime not yet ready
    Created,
    /// Ready and registered
    Started,
    /// Torn down
    Stopped,
}

/// Handle to one isolated project instance
#[derive(Debug)]
pub struct RunningProject {
    id: ProjectId,
    project_dir: PathBuf,
    config: StartupConfig,
    strategy: Strategy,
    host_port: u16,
    health_url: Option<String>,
    created_at: DateTime<Utc>,
    state: Mutex<ProjectState>,
    /// Held for the whole backend teardown
    teardown: Arc<tokio::sync::Mutex<()>>,
}

impl RunningProject {
    pub(crate) fn new(
        id: ProjectId,
        project_dir: PathBuf,
        config: StartupConfig,
        strategy: Strategy,
        host_port: u16,
        health_url: Option<String>,
    ) -> Self {
        Self {
            id,
            project_dir,
            config,
            strategy,
            host_port,
            health_url,
            created_at: Utc::now(),
            state: Mutex::new(ProjectState::Created),
            teardown: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Project identifier
    #[inline]
    #[must_use]
    pub fn id(&self) -> &ProjectId {
        &self.id
    }

    /// Project root
    #[inline]
    #[must_use]
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Startup plan
    #[inline]
    #[must_use]
    pub fn config(&self) -> &StartupConfig {
        &self.config
    }

    /// Selected strategy
    #[inline]
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Port published on the host
    #[inline]
    #[must_use]
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// Creation time
    #[inline]
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Readiness endpoint as reachable from this host
    #[inline]
    #[must_use]
    pub fn health_url(&self) -> Option<&str> {
        self.health_url.as_deref()
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> ProjectState {
        *self.state.lock()
    }

    /// Check if the service is up and registered
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ProjectState::Started
    }

    /// Base address tests should target
    #[must_use]
    pub fn service_address(&self) -> String {
        format!("http://localhost:{}", self.host_port)
    }

    /// Backend request for this project
    #[must_use]
    pub fn provision(&self) -> Provision {
        Provision {
            project_id: self.id.clone(),
            project_dir: self.project_dir.clone(),
            config: self.config.clone(),
            strategy: self.strategy,
            host_port: self.host_port,
        }
    }

    /// Created → Started; false if the project was stopped meanwhile
    pub(crate) fn mark_started(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ProjectState::Created {
            *state = ProjectState::Started;
            true
        } else {
            false
        }
    }

    pub(crate) fn teardown_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.teardown)
    }

    /// Swap to Stopped, returning the previous state
    pub(crate) fn mark_stopped(&self) -> ProjectState {
        std::mem::replace(&mut *self.state.lock(), ProjectState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vera_sandbox::StartMethod;

    fn project() -> RunningProject {
        RunningProject::new(
            ProjectId::generate(),
            PathBuf::from("/tmp/project"),
            StartupConfig::new(StartMethod::NativeRuntime).with_port(8080),
            Strategy::NativeRuntime,
            8080,
            None,
        )
    }

    #[test]
    fn state_moves_forward_only() {
        let p = project();
        assert_eq!(p.state(), ProjectState::Created);
        assert!(!p.is_running());

        assert!(p.mark_started());
        assert!(p.is_running());
        assert!(!p.mark_started());

        assert_eq!(p.mark_stopped(), ProjectState::Started);
        assert_eq!(p.mark_stopped(), ProjectState::Stopped);
        assert!(!p.mark_started());
        assert!(!p.is_running());
    }

    #[test]
    fn service_address_uses_host_port() {
        let p = project();
        assert_eq!(p.service_address(), "http://localhost:8080");

        let provision = p.provision();
        assert_eq!(provision.project_id, *p.id());
        assert_eq!(provision.host_port, 8080);
        assert_eq!(provision.strategy, Strategy::NativeRuntime);
    }
}
