//! Project lifecycle manager
//!
//! Creates project instances, brings them up through an isolation backend,
//! waits for readiness and tears them down again. Creation is separate from
//! launch so a caller that is cancelled mid-launch still holds a handle it
//! can stop.

use crate::error::StartFailure;
use crate::progress::{emit, ProgressSink, Stage};
use crate::project::{ProjectState, RunningProject};
use crate::registry::ProjectRegistry;
use crate::settings::{PortAllocation, VeraSettings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use vera_sandbox::{
    tail, HealthProber, IsolationBackend, SandboxError, StartupConfig, Strategy,
};

/// Default provision-to-ready budget
pub const DEFAULT_STARTUP_DEADLINE: Duration = Duration::from_secs(180);

/// Default bytes of runtime logs attached to a health timeout
pub const DEFAULT_LOG_TAIL: usize = 2000;

/// Starts, supervises and stops project instances
pub struct LifecycleManager {
    backend: Arc<dyn IsolationBackend>,
    registry: Arc<ProjectRegistry>,
    prober: HealthProber,
    startup_deadline: Duration,
    port_allocation: PortAllocation,
    log_tail: usize,
}

impl LifecycleManager {
    /// Create new manager with default timing
    #[must_use]
    pub fn new(backend: Arc<dyn IsolationBackend>, registry: Arc<ProjectRegistry>) -> Self {
        Self {
            backend,
            registry,
            prober: HealthProber::default(),
            startup_deadline: DEFAULT_STARTUP_DEADLINE,
            port_allocation: PortAllocation::Declared,
            log_tail: DEFAULT_LOG_TAIL,
        }
    }

    /// Create new manager from settings
    #[must_use]
    pub fn from_settings(
        backend: Arc<dyn IsolationBackend>,
        registry: Arc<ProjectRegistry>,
        settings: &VeraSettings,
    ) -> Self {
        Self::new(backend, registry)
            .with_prober(HealthProber::new(
                settings.health.poll_interval(),
                settings.health.request_timeout(),
            ))
            .with_startup_deadline(settings.lifecycle.startup_deadline())
            .with_port_allocation(settings.lifecycle.port_allocation)
            .with_log_tail(settings.health.log_tail_bytes)
    }

    /// With health prober
    #[inline]
    #[must_use]
    pub fn with_prober(mut self, prober: HealthProber) -> Self {
        self.prober = prober;
        self
    }

    /// With startup deadline
    #[inline]
    #[must_use]
    pub fn with_startup_deadline(mut self, deadline: Duration) -> Self {
        self.startup_deadline = deadline;
        self
    }

    /// With port allocation policy
    #[inline]
    #[must_use]
    pub fn with_port_allocation(mut self, allocation: PortAllocation) -> Self {
        self.port_allocation = allocation;
        self
    }

    /// With log tail size
    #[inline]
    #[must_use]
    pub fn with_log_tail(mut self, bytes: usize) -> Self {
        self.log_tail = bytes;
        self
    }

    /// Live project registry
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<ProjectRegistry> {
        &self.registry
    }

    /// Backend name
    #[inline]
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Allocate a project instance without starting anything
    ///
    /// # Errors
    /// - `StartFailure::UnsupportedMethod` for an unknown start method
    /// - `StartFailure::Provisioning` if no host port can be allocated
    pub fn create(
        &self,
        project_dir: impl Into<PathBuf>,
        config: StartupConfig,
    ) -> Result<Arc<RunningProject>, StartFailure> {
        let strategy = Strategy::for_method(config.start_method)
            .ok_or(StartFailure::UnsupportedMethod(config.start_method))?;

        let host_port = match (strategy, self.port_allocation) {
            (Strategy::Compose, _) | (_, PortAllocation::Declared) => config.service_port,
            (Strategy::ImageBuild | Strategy::NativeRuntime, PortAllocation::Dynamic) => {
                free_port()?
            }
        };
        let health_url = config
            .health_url()
            .map(|url| rewrite_port(url, config.service_port, host_port));

        let id = self.registry.reserve();
        tracing::info!(
            project_id = %id,
            strategy = %strategy,
            host_port,
            reason = config.reason.as_deref().unwrap_or(""),
            "project created"
        );

        Ok(Arc::new(RunningProject::new(
            id,
            project_dir.into(),
            config,
            strategy,
            host_port,
            health_url,
        )))
    }

    /// Provision, wait for readiness, register
    ///
    /// On failure the project is stopped before the error is returned. A
    /// project that is no longer `Created` is never provisioned.
    ///
    /// # Errors
    /// - `StartFailure::Provisioning` if the backend fails
    /// - `StartFailure::HealthCheckTimeout` (with logs) if readiness never comes
    /// - `StartFailure::Aborted` if the project was stopped concurrently
    pub async fn launch(
        &self,
        project: &Arc<RunningProject>,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<(), StartFailure> {
        if project.state() != ProjectState::Created {
            return Err(StartFailure::Aborted);
        }

        if let Err(e) = self.backend.provision(&project.provision()).await {
            tracing::error!(project_id = %project.id(), error = %e, "provisioning failed");
            self.stop(project).await;
            return Err(e.into());
        }

        emit(progress, Stage::WaitingHealth, "Waiting for service to be ready...").await;

        let fallback = Duration::from_secs(project.config().estimated_startup_time_secs);
        if let Err(timeout) = self
            .prober
            .wait_until_healthy(project.health_url(), fallback, self.startup_deadline)
            .await
        {
            let logs = self.logs(project).await;
            tracing::error!(project_id = %project.id(), error = %timeout, "service never became ready");
            self.stop(project).await;
            return Err(timeout.with_logs(logs).into());
        }

        self.registry.insert(Arc::clone(project));
        if !project.mark_started() {
            // Stopped while provisioning; whatever came up after that
            // teardown still has to go.
            tracing::warn!(project_id = %project.id(), "project stopped during launch");
            self.registry.remove(project.id());
            let guard = project.teardown_lock().lock_owned().await;
            self.teardown(project, guard).await;
            return Err(StartFailure::Aborted);
        }

        tracing::info!(
            project_id = %project.id(),
            address = %project.service_address(),
            "project started"
        );
        Ok(())
    }

    /// Create and launch
    ///
    /// # Errors
    /// Any `StartFailure` from [`Self::create`] or [`Self::launch`].
    pub async fn start(
        &self,
        project_dir: impl Into<PathBuf>,
        config: StartupConfig,
    ) -> Result<Arc<RunningProject>, StartFailure> {
        let project = self.create(project_dir, config)?;
        self.launch(&project, None).await?;
        Ok(project)
    }

    /// Tear a project down; returns false if it was already stopped
    ///
    /// Never fails: teardown problems are logged as warnings. The backend
    /// teardown runs on its own task and finishes even if this future is
    /// dropped; a later call waits for it before returning.
    pub async fn stop(&self, project: &RunningProject) -> bool {
        let guard = project.teardown_lock().lock_owned().await;
        if project.mark_stopped() == ProjectState::Stopped {
            tracing::debug!(project_id = %project.id(), "project already stopped");
            return false;
        }
        self.registry.remove(project.id());
        self.teardown(project, guard).await;
        true
    }

    async fn teardown(&self, project: &RunningProject, guard: OwnedMutexGuard<()>) {
        let backend = Arc::clone(&self.backend);
        let provision = project.provision();
        let task = tokio::spawn(async move {
            let warnings = backend.teardown(&provision).await;
            for warning in &warnings {
                tracing::warn!(project_id = %provision.project_id, %warning, "teardown warning");
            }
            tracing::info!(
                project_id = %provision.project_id,
                warnings = warnings.len(),
                "project stopped"
            );
            drop(guard);
        });
        if let Err(e) = task.await {
            tracing::error!(project_id = %project.id(), error = %e, "teardown task failed");
        }
    }

    /// Stop every registered project; returns how many were stopped
    pub async fn stop_all(&self) -> usize {
        let projects = self.registry.snapshot();
        if !projects.is_empty() {
            tracing::info!(count = projects.len(), "stopping all projects");
        }
        let mut stopped = 0;
        for project in projects {
            if self.stop(&project).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Captured runtime logs, truncated to the configured tail
    pub async fn logs(&self, project: &RunningProject) -> String {
        let logs = self.backend.logs(&project.provision()).await;
        tail(&logs, self.log_tail).to_string()
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("backend", &self.backend.name())
            .field("live", &self.registry.len())
            .field("startup_deadline", &self.startup_deadline)
            .field("port_allocation", &self.port_allocation)
            .finish_non_exhaustive()
    }
}

/// Free ephemeral port on the loopback interface
fn free_port() -> Result<u16, StartFailure> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(SandboxError::from)?;
    let port = listener.local_addr().map_err(SandboxError::from)?.port();
    Ok(port)
}

/// Point `url` at `host_port` when it targets the service port
fn rewrite_port(url: &str, service_port: u16, host_port: u16) -> String {
    if service_port == host_port {
        return url.to_string();
    }
    match reqwest::Url::parse(url) {
        Ok(mut parsed) if parsed.port_or_known_default() == Some(service_port) => {
            if parsed.set_port(Some(host_port)).is_ok() {
                parsed.to_string()
            } else {
                url.to_string()
            }
        }
        _ => url.to_string(),
    }
}
