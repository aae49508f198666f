//! Core sandbox types
//!
//! Defines the values that flow between the planner, the lifecycle manager
//! and the isolation backends:
//! - Startup plans and their start method
//! - Project identifiers used to namespace container resources
//! - Start strategies (closed set, matched exhaustively by every backend)
//! - Command execution results

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Prefix shared by every resource name Vera creates
pub const NAMESPACE_PREFIX: &str = "vera";

/// How a project should be started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StartMethod {
    /// Multi-service compose manifest
    Compose,
    /// Single image built from a build manifest
    ImageBuild,
    /// Generic runtime image with install/start commands
    NativeRuntime,
    /// Planner could not decide; terminal
    Unknown,
}

impl StartMethod {
    /// Canonical tag
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StartMethod::Compose => "compose",
            StartMethod::ImageBuild => "image-build",
            StartMethod::NativeRuntime => "native-runtime",
            StartMethod::Unknown => "unknown",
        }
    }

    /// Parse a tag, accepting the planner's legacy spellings
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "compose" | "docker-compose" | "docker_compose" => StartMethod::Compose,
            "image-build" | "image_build" | "dockerfile" | "docker" => StartMethod::ImageBuild,
            "native-runtime" | "native_runtime" | "native" | "npm" | "node" | "python" => {
                StartMethod::NativeRuntime
            }
            _ => StartMethod::Unknown,
        }
    }
}

impl From<String> for StartMethod {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<StartMethod> for String {
    fn from(value: StartMethod) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for StartMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable plan for launching one project instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Start method chosen by the planner
    pub start_method: StartMethod,
    /// Base execution image (native runtime only)
    #[serde(alias = "runtime")]
    pub runtime_image: Option<String>,
    /// Dependency installation command
    pub install_command: Option<String>,
    /// Service start command
    pub start_command: Option<String>,
    /// Stop command suggested by the planner (informational)
    pub stop_command: Option<String>,
    /// Readiness endpoint; `None` means wait the estimate
    pub health_check_url: Option<String>,
    /// Port the service binds inside its runtime
    pub service_port: u16,
    /// Fallback wait when no health URL is declared
    #[serde(alias = "estimated_startup_time")]
    pub estimated_startup_time_secs: u64,
    /// Directory, relative to the project root, where commands execute
    pub working_dir: PathBuf,
    /// Extra environment for the service
    pub env_vars: BTreeMap<String, String>,
    /// Planner rationale, logged only
    pub reason: Option<String>,
}

impl StartupConfig {
    /// Create a plan with the given method and defaults elsewhere
    #[inline]
    #[must_use]
    pub fn new(start_method: StartMethod) -> Self {
        Self {
            start_method,
            ..Self::default()
        }
    }

    /// Plan that refuses to start anything
    #[inline]
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(StartMethod::Unknown)
    }

    /// With install command
    #[inline]
    #[must_use]
    pub fn with_install(mut self, command: impl Into<String>) -> Self {
        self.install_command = Some(command.into());
        self
    }

    /// With start command
    #[inline]
    #[must_use]
    pub fn with_start(mut self, command: impl Into<String>) -> Self {
        self.start_command = Some(command.into());
        self
    }

    /// With health check URL
    #[inline]
    #[must_use]
    pub fn with_health_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }

    /// With service port
    #[inline]
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.service_port = port;
        self
    }

    /// With estimated startup time
    #[inline]
    #[must_use]
    pub fn with_estimated_startup(mut self, secs: u64) -> Self {
        self.estimated_startup_time_secs = secs;
        self
    }

    /// With runtime image
    #[inline]
    #[must_use]
    pub fn with_runtime_image(mut self, image: impl Into<String>) -> Self {
        self.runtime_image = Some(image.into());
        self
    }

    /// With working directory
    #[inline]
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// With an environment variable
    #[inline]
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Install command, if non-empty
    #[must_use]
    pub fn install(&self) -> Option<&str> {
        non_empty(self.install_command.as_deref())
    }

    /// Start command, if non-empty
    #[must_use]
    pub fn start(&self) -> Option<&str> {
        non_empty(self.start_command.as_deref())
    }

    /// Health URL, if non-empty
    #[must_use]
    pub fn health_url(&self) -> Option<&str> {
        non_empty(self.health_check_url.as_deref())
    }

    /// Combined `install && start` command line
    #[must_use]
    pub fn launch_command(&self) -> Option<String> {
        match (self.install(), self.start()) {
            (Some(install), Some(start)) => Some(format!("{install} && {start}")),
            (None, Some(start)) => Some(start.to_string()),
            (_, None) => None,
        }
    }

    /// Directory where commands execute for a project rooted at `root`
    #[must_use]
    pub fn command_dir(&self, root: &Path) -> PathBuf {
        if self.working_dir.as_os_str().is_empty() || self.working_dir == Path::new(".") {
            root.to_path_buf()
        } else {
            root.join(&self.working_dir)
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            start_method: StartMethod::Unknown,
            runtime_image: None,
            install_command: None,
            start_command: None,
            stop_command: None,
            health_check_url: None,
            service_port: 3000,
            estimated_startup_time_secs: 30,
            working_dir: PathBuf::from("."),
            env_vars: BTreeMap::new(),
            reason: None,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Process-unique project identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectId(String);

impl ProjectId {
    /// Generate a new short random token
    #[must_use]
    pub fn generate() -> Self {
        let token = Uuid::new_v4().simple().to_string();
        Self(token[..8].to_string())
    }

    /// Raw token
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace for every resource owned by this project
    #[inline]
    #[must_use]
    pub fn namespace(&self) -> String {
        format!("{NAMESPACE_PREFIX}-{}", self.0)
    }

    /// Container name
    #[inline]
    #[must_use]
    pub fn container_name(&self) -> String {
        self.namespace()
    }

    /// Image tag for built images
    #[inline]
    #[must_use]
    pub fn image_tag(&self) -> String {
        format!("{}:latest", self.namespace())
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Start strategy (every backend matches this exhaustively)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Compose manifest with one or more services
    Compose,
    /// Build an image, run one container
    ImageBuild,
    /// Generic runtime image with the project mounted
    NativeRuntime,
}

impl Strategy {
    /// Strategy for a start method; `None` for unknown
    #[inline]
    #[must_use]
    pub fn for_method(method: StartMethod) -> Option<Self> {
        match method {
            StartMethod::Compose => Some(Strategy::Compose),
            StartMethod::ImageBuild => Some(Strategy::ImageBuild),
            StartMethod::NativeRuntime => Some(Strategy::NativeRuntime),
            StartMethod::Unknown => None,
        }
    }

    /// Short name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Compose => "compose",
            Strategy::ImageBuild => "image-build",
            Strategy::NativeRuntime => "native-runtime",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one command run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exited with status 0
    pub success: bool,
    /// Exit code, `-1` when killed or signalled
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Wall time
    pub duration_ms: u64,
    /// Killed because the timeout elapsed
    pub timed_out: bool,
}

impl ExecutionResult {
    /// Stdout followed by stderr, trimmed
    #[must_use]
    pub fn combined_output(&self) -> String {
        let mut log = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !log.is_empty() {
                log.push('\n');
            }
            log.push_str(&self.stderr);
        }
        log.trim().to_string()
    }
}
