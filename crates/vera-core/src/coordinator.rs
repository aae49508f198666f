//! Verification coordinator
//!
//! Drives one verification through its stages:
//! ANALYZING_STARTUP → STARTING_PROJECT → WAITING_HEALTH → GENERATING_TESTS →
//! RUNNING_TESTS → CLEANUP → (COMPLETE | ERROR)
//!
//! Stages run strictly in sequence and nothing is retried. Cleanup runs on
//! every path out of the first five stages, including cancellation.

use crate::collaborators::{
    FeatureAnalysis, ProjectFiles, StartupPlanner, TestGenerationRequest, TestGenerator,
};
use crate::error::VerificationError;
use crate::lifecycle::LifecycleManager;
use crate::progress::{emit, ProgressSink, Stage};
use crate::project::RunningProject;
use crate::settings::{TestSettings, VeraSettings};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use vera_sandbox::{CommandExecutor, CommandSpec, StartMethod};

/// One verification request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRequest {
    /// Extracted project root
    pub project_dir: PathBuf,
    /// Feature requirements
    pub problem_description: String,
    /// Features located by analysis
    #[serde(default)]
    pub features: Vec<FeatureAnalysis>,
}

impl VerificationRequest {
    /// Create new request
    #[inline]
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>, problem_description: impl Into<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            problem_description: problem_description.into(),
            features: Vec::new(),
        }
    }

    /// With located features
    #[inline]
    #[must_use]
    pub fn with_features(mut self, features: Vec<FeatureAnalysis>) -> Self {
        self.features = features;
        self
    }
}

/// Result of one verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    /// Test source that was executed
    pub generated_test_code: String,
    /// Test process exited 0
    pub tests_passed: bool,
    /// Test output, or the failure description
    pub log: String,
    /// Wall time of the whole run
    pub duration_ms: u64,
}

impl VerificationOutcome {
    /// Outcome reported when verification itself failed
    #[must_use]
    pub fn degraded(error: &VerificationError, duration_ms: u64) -> Self {
        Self {
            generated_test_code: format!("# Verification failed: {error}"),
            tests_passed: false,
            log: format!("Error: {error}"),
            duration_ms,
        }
    }
}

/// Result of executing generated tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRun {
    /// Test process exited 0
    pub passed: bool,
    /// Combined output or failure description
    pub log: String,
}

/// Mutable state shared between the stages and cleanup
#[derive(Debug)]
struct RunState {
    stage: Stage,
    project: Option<Arc<RunningProject>>,
    started: Instant,
}

/// Coordinates planning, lifecycle, test generation and test execution
#[derive(Clone)]
pub struct VerificationCoordinator {
    lifecycle: Arc<LifecycleManager>,
    planner: Arc<dyn StartupPlanner>,
    generator: Arc<dyn TestGenerator>,
    executor: CommandExecutor,
    tests: TestSettings,
    stream_capacity: usize,
}

impl VerificationCoordinator {
    /// Create new coordinator with default test settings
    #[must_use]
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        planner: Arc<dyn StartupPlanner>,
        generator: Arc<dyn TestGenerator>,
    ) -> Self {
        let defaults = VeraSettings::default();
        Self {
            lifecycle,
            planner,
            generator,
            executor: CommandExecutor::new(),
            tests: defaults.tests,
            stream_capacity: defaults.stream.channel_capacity,
        }
    }

    /// Apply test and stream settings
    #[must_use]
    pub fn with_settings(mut self, settings: &VeraSettings) -> Self {
        self.tests = settings.tests.clone();
        self.stream_capacity = settings.stream.channel_capacity.max(1);
        self
    }

    /// With test settings
    #[inline]
    #[must_use]
    pub fn with_test_settings(mut self, tests: TestSettings) -> Self {
        self.tests = tests;
        self
    }

    /// Lifecycle manager
    #[inline]
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub(crate) fn stream_capacity(&self) -> usize {
        self.stream_capacity
    }

    /// Run a verification
    ///
    /// # Errors
    /// The first fatal stage error. Test failures and timeouts are part of
    /// the outcome, not errors. The project is stopped either way.
    pub async fn run(
        &self,
        request: &VerificationRequest,
        sink: Option<&dyn ProgressSink>,
    ) -> Result<VerificationOutcome, VerificationError> {
        self.run_until(request, sink, std::future::pending()).await
    }

    /// Run a verification, folding every error into the outcome
    pub async fn run_functional_verification(
        &self,
        request: &VerificationRequest,
        sink: Option<&dyn ProgressSink>,
    ) -> VerificationOutcome {
        let started = Instant::now();
        match self.run(request, sink).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, stage = %e.stage(), "functional verification failed");
                VerificationOutcome::degraded(&e, elapsed_ms(started))
            }
        }
    }

    /// Run until finished or until `cancelled` resolves
    ///
    /// Cancellation takes effect at the next await point of the stages;
    /// cleanup still runs to completion.
    pub(crate) async fn run_until<C>(
        &self,
        request: &VerificationRequest,
        sink: Option<&dyn ProgressSink>,
        cancelled: C,
    ) -> Result<VerificationOutcome, VerificationError>
    where
        C: Future<Output = ()> + Send,
    {
        let mut state = RunState {
            stage: Stage::AnalyzingStartup,
            project: None,
            started: Instant::now(),
        };

        let finished = tokio::select! {
            result = self.run_stages(request, sink, &mut state) => Some(result),
            () = cancelled => None,
        };
        let result = finished.unwrap_or_else(|| {
            tracing::warn!(stage = %state.stage, "verification cancelled");
            Err(VerificationError::Cancelled(state.stage))
        });

        emit(sink, Stage::Cleanup, "Cleaning up...").await;
        if let Some(project) = state.project.take() {
            self.lifecycle.stop(&project).await;
        }

        match &result {
            Ok(outcome) => {
                let verdict = if outcome.tests_passed { "passed" } else { "failed" };
                emit(
                    sink,
                    Stage::Complete,
                    format!("Verification complete: tests {verdict}"),
                )
                .await;
            }
            Err(e) => emit(sink, Stage::Error, format!("Verification failed: {e}")).await,
        }
        result
    }

    async fn run_stages(
        &self,
        request: &VerificationRequest,
        sink: Option<&dyn ProgressSink>,
        state: &mut RunState,
    ) -> Result<VerificationOutcome, VerificationError> {
        state.stage = Stage::AnalyzingStartup;
        emit(sink, Stage::AnalyzingStartup, "Analyzing how to start the project...").await;
        let files = ProjectFiles::collect(&request.project_dir).await;
        if files.is_empty() {
            return Err(VerificationError::Planning(format!(
                "no configuration files found in {}",
                request.project_dir.display()
            )));
        }
        let config = self
            .planner
            .plan(&files)
            .await
            .map_err(|e| VerificationError::Planning(e.to_string()))?;
        if config.start_method == StartMethod::Unknown {
            return Err(VerificationError::Planning(match config.reason.as_deref() {
                Some(reason) => format!("could not determine how to start the project: {reason}"),
                None => "could not determine how to start the project".to_string(),
            }));
        }

        state.stage = Stage::StartingProject;
        emit(
            sink,
            Stage::StartingProject,
            format!("Starting project ({})...", config.start_method),
        )
        .await;
        let project = self.lifecycle.create(&request.project_dir, config)?;
        state.project = Some(Arc::clone(&project));
        state.stage = Stage::WaitingHealth;
        self.lifecycle.launch(&project, sink).await?;

        state.stage = Stage::GeneratingTests;
        emit(sink, Stage::GeneratingTests, "Generating tests...").await;
        let generation = TestGenerationRequest {
            problem_description: request.problem_description.clone(),
            features: request.features.clone(),
            service_address: project.service_address(),
            service_port: project.host_port(),
        };
        let generated = self
            .generator
            .generate(&generation)
            .await
            .map_err(VerificationError::TestGeneration)?;

        state.stage = Stage::RunningTests;
        emit(sink, Stage::RunningTests, "Running tests...").await;
        let run = self
            .execute_tests(&generated.source, &project.service_address())
            .await;
        tracing::info!(project_id = %project.id(), passed = run.passed, "tests finished");

        Ok(VerificationOutcome {
            generated_test_code: generated.source,
            tests_passed: run.passed,
            log: run.log,
            duration_ms: elapsed_ms(state.started),
        })
    }

    /// Execute test source against a service
    ///
    /// Never fails: timeouts and execution problems are reported as a
    /// failed run with the reason in the log.
    pub async fn execute_tests(&self, source: &str, service_address: &str) -> TestRun {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return TestRun::failed(format!("Test execution error: {e}")),
        };
        let file = dir.path().join(&self.tests.file_name);
        if let Err(e) = tokio::fs::write(&file, source).await {
            return TestRun::failed(format!("Test execution error: {e}"));
        }

        let command = self.tests.command.replace("{file}", &shell_quote(&file));
        let timeout = self.tests.timeout();
        let spec = CommandSpec::shell(&command, dir.path(), timeout)
            .env("SERVICE_URL", service_address);

        match self.executor.run_spec(&spec).await {
            Ok(result) if result.timed_out => TestRun::failed(format!(
                "Test execution timeout ({}s)",
                timeout.as_secs()
            )),
            Ok(result) => {
                let log = result.combined_output();
                TestRun {
                    passed: result.success,
                    log: if log.is_empty() {
                        "(no output)".to_string()
                    } else {
                        log
                    },
                }
            }
            Err(e) => TestRun::failed(format!("Test execution error: {e}")),
        }
    }
}

impl std::fmt::Debug for VerificationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationCoordinator")
            .field("lifecycle", &self.lifecycle)
            .field("tests", &self.tests)
            .field("stream_capacity", &self.stream_capacity)
            .finish_non_exhaustive()
    }
}

impl TestRun {
    fn failed(log: String) -> Self {
        Self { passed: false, log }
    }
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
