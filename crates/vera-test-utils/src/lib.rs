//! Testing utilities for the Vera workspace
//!
//! Scripted collaborators, a fault-injecting backend, a recording progress
//! sink and small fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use vera_core::{
    CollaboratorError, GeneratedTests, LifecycleManager, ProgressEvent, ProgressSink,
    ProjectFiles, ProjectRegistry, Stage, StartupPlanner, TestGenerationRequest, TestGenerator,
};
use vera_sandbox::{
    IsolationBackend, ProjectId, Provision, SandboxError, StartMethod, StartupConfig,
    TeardownWarning,
};

/// Planner returning a fixed result
#[derive(Debug)]
pub struct ScriptedPlanner {
    result: Result<StartupConfig, String>,
    calls: AtomicUsize,
}

impl ScriptedPlanner {
    pub fn ok(config: StartupConfig) -> Self {
        Self {
            result: Ok(config),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StartupPlanner for ScriptedPlanner {
    async fn plan(&self, _files: &ProjectFiles) -> Result<StartupConfig, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result
            .clone()
            .map_err(CollaboratorError::Unavailable)
    }
}

/// Test generator returning fixed source, optionally after a delay
#[derive(Debug)]
pub struct ScriptedGenerator {
    result: Result<String, String>,
    delay: Duration,
    requests: Mutex<Vec<TestGenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn ok(source: &str) -> Self {
        Self {
            result: Ok(source.to_string()),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<TestGenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl TestGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        request: &TestGenerationRequest,
    ) -> Result<GeneratedTests, CollaboratorError> {
        self.requests.lock().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.result
            .clone()
            .map(GeneratedTests::javascript)
            .map_err(CollaboratorError::Unavailable)
    }
}

/// Where [`FakeBackend`] should fail
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Fault {
    #[default]
    None,
    /// Provisioning returns a step failure
    Provision,
    /// Teardown reports a warning
    Teardown,
}

/// In-memory backend recording every call
#[derive(Debug, Default)]
pub struct FakeBackend {
    fault: Fault,
    provision_delay: Duration,
    teardown_delay: Duration,
    logs: String,
    provisioned: Mutex<Vec<ProjectId>>,
    torn_down: Mutex<Vec<ProjectId>>,
    teardowns_finished: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }

    #[must_use]
    pub fn with_provision_delay(mut self, delay: Duration) -> Self {
        self.provision_delay = delay;
        self
    }

    #[must_use]
    pub fn with_teardown_delay(mut self, delay: Duration) -> Self {
        self.teardown_delay = delay;
        self
    }

    #[must_use]
    pub fn with_logs(mut self, logs: &str) -> Self {
        self.logs = logs.to_string();
        self
    }

    pub fn provisioned(&self) -> Vec<ProjectId> {
        self.provisioned.lock().clone()
    }

    /// Teardowns that were entered, in call order
    pub fn torn_down(&self) -> Vec<ProjectId> {
        self.torn_down.lock().clone()
    }

    /// Teardowns that ran to the end
    pub fn teardowns_finished(&self) -> usize {
        self.teardowns_finished.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` teardowns were recorded
    pub async fn wait_for_teardowns(&self, count: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if self.torn_down.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.torn_down.lock().len() >= count
    }
}

#[async_trait]
impl IsolationBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn provision(&self, provision: &Provision) -> Result<(), SandboxError> {
        self.provisioned.lock().push(provision.project_id.clone());
        if !self.provision_delay.is_zero() {
            tokio::time::sleep(self.provision_delay).await;
        }
        match self.fault {
            Fault::Provision => Err(SandboxError::StepFailed {
                step: "fake provision",
                exit_code: 1,
                stderr: "injected failure".to_string(),
            }),
            Fault::None | Fault::Teardown => Ok(()),
        }
    }

    async fn teardown(&self, provision: &Provision) -> Vec<TeardownWarning> {
        self.torn_down.lock().push(provision.project_id.clone());
        if !self.teardown_delay.is_zero() {
            tokio::time::sleep(self.teardown_delay).await;
        }
        self.teardowns_finished.fetch_add(1, Ordering::SeqCst);
        match self.fault {
            Fault::Teardown => vec![TeardownWarning::new("fake teardown", "injected warning")],
            Fault::None | Fault::Provision => Vec::new(),
        }
    }

    async fn logs(&self, _provision: &Provision) -> String {
        self.logs.clone()
    }
}

/// Progress sink keeping every event
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.events.lock().iter().map(|e| e.stage).collect()
    }
}

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn emit(&self, event: ProgressEvent) {
        self.events.lock().push(event);
    }
}

/// Native-runtime plan with no health URL and no startup wait
pub fn native_config(start: &str) -> StartupConfig {
    StartupConfig::new(StartMethod::NativeRuntime)
        .with_start(start)
        .with_estimated_startup(0)
}

/// Project directory containing one planner-visible file
pub fn project_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_file(dir.path(), "package.json", "{\"name\":\"fixture\"}");
    dir
}

pub fn write_file(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

/// Loopback port with nothing listening
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Serve `status_line` to every request; returns the port
pub async fn serve_status(status_line: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response =
                format!("HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });
    port
}

/// Lifecycle manager over `backend` with short health timing
pub fn fast_lifecycle(backend: Arc<dyn IsolationBackend>, deadline: Duration) -> LifecycleManager {
    LifecycleManager::new(backend, Arc::new(ProjectRegistry::new()))
        .with_prober(vera_sandbox::HealthProber::new(
            Duration::from_millis(100),
            Duration::from_millis(200),
        ))
        .with_startup_deadline(deadline)
}
