//! Runtime settings
//!
//! Every section has working defaults, so an empty file (or no file) is a
//! valid configuration. A few values can be overridden from the environment
//! for deployments that cannot ship a settings file.

use crate::error::SettingsError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use vera_sandbox::DockerSettings;

/// Docker binary override
pub const ENV_DOCKER_BIN: &str = "VERA_DOCKER_BIN";
/// Startup deadline override, in seconds
pub const ENV_STARTUP_DEADLINE: &str = "VERA_STARTUP_DEADLINE_SECS";
/// Test timeout override, in seconds
pub const ENV_TEST_TIMEOUT: &str = "VERA_TEST_TIMEOUT_SECS";

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VeraSettings {
    /// Project lifecycle
    pub lifecycle: LifecycleSettings,
    /// Readiness probing
    pub health: HealthSettings,
    /// Docker backend
    pub docker: DockerSettings,
    /// Generated test execution
    pub tests: TestSettings,
    /// Streaming worker
    pub stream: StreamSettings,
}

impl VeraSettings {
    /// Create default settings
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// - `SettingsError::Read` if the file cannot be read
    /// - `SettingsError::Parse` if it does not match the schema
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse from TOML text
    ///
    /// # Errors
    /// `SettingsError::Parse` if the text does not match the schema.
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `VERA_*` overrides from the process environment
    ///
    /// # Errors
    /// `SettingsError::InvalidOverride` if a numeric override does not parse.
    pub fn with_env_overrides(self) -> Result<Self, SettingsError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply `VERA_*` overrides from an arbitrary lookup
    ///
    /// # Errors
    /// `SettingsError::InvalidOverride` if a numeric override does not parse.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SettingsError> {
        if let Some(binary) = lookup(ENV_DOCKER_BIN).filter(|v| !v.trim().is_empty()) {
            self.docker.binary = binary;
        }
        if let Some(value) = lookup(ENV_STARTUP_DEADLINE) {
            self.lifecycle.startup_deadline_secs = parse_secs(ENV_STARTUP_DEADLINE, value)?;
        }
        if let Some(value) = lookup(ENV_TEST_TIMEOUT) {
            self.tests.timeout_secs = parse_secs(ENV_TEST_TIMEOUT, value)?;
        }
        Ok(self)
    }

    /// With startup deadline
    #[inline]
    #[must_use]
    pub fn with_startup_deadline(mut self, deadline: Duration) -> Self {
        self.lifecycle.startup_deadline_secs = deadline.as_secs();
        self
    }

    /// With port allocation policy
    #[inline]
    #[must_use]
    pub fn with_port_allocation(mut self, allocation: PortAllocation) -> Self {
        self.lifecycle.port_allocation = allocation;
        self
    }

    /// With health poll interval
    #[inline]
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.health.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With test timeout
    #[inline]
    #[must_use]
    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.tests.timeout_secs = timeout.as_secs();
        self
    }

    /// With test command template (`{file}` is replaced by the test file)
    #[inline]
    #[must_use]
    pub fn with_test_command(mut self, command: impl Into<String>) -> Self {
        self.tests.command = command.into();
        self
    }

    /// With docker binary
    #[inline]
    #[must_use]
    pub fn with_docker_binary(mut self, binary: impl Into<String>) -> Self {
        self.docker.binary = binary.into();
        self
    }
}

fn parse_secs(var: &'static str, value: String) -> Result<u64, SettingsError> {
    value
        .trim()
        .parse()
        .map_err(|_| SettingsError::InvalidOverride { var, value })
}

/// How host ports are chosen for a project
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortAllocation {
    /// Host port equals the service port
    #[default]
    Declared,
    /// Free ephemeral host port per project
    Dynamic,
}

/// Lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Provision-to-ready budget
    pub startup_deadline_secs: u64,
    /// Host port policy
    pub port_allocation: PortAllocation,
}

impl LifecycleSettings {
    /// Startup deadline
    #[inline]
    #[must_use]
    pub fn startup_deadline(&self) -> Duration {
        Duration::from_secs(self.startup_deadline_secs)
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            startup_deadline_secs: 180,
            port_allocation: PortAllocation::Declared,
        }
    }
}

/// Health probing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Interval between probes
    pub poll_interval_ms: u64,
    /// Per-request timeout
    pub request_timeout_ms: u64,
    /// Bytes of runtime logs attached to a health timeout
    pub log_tail_bytes: usize,
}

impl HealthSettings {
    /// Poll interval
    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Request timeout
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
            request_timeout_ms: 5000,
            log_tail_bytes: 2000,
        }
    }
}

/// Generated test execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSettings {
    /// Execution timeout
    pub timeout_secs: u64,
    /// File name the source is written to
    pub file_name: String,
    /// Command template; `{file}` is replaced by the quoted file path
    pub command: String,
}

impl TestSettings {
    /// Execution timeout
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            file_name: "generated.test.mjs".to_string(),
            command: "node {file}".to_string(),
        }
    }
}

/// Streaming worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Bounded channel capacity
    pub channel_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn empty_file_yields_defaults() {
        let settings = VeraSettings::from_toml_str("").unwrap();

        assert_eq!(settings.lifecycle.startup_deadline(), Duration::from_secs(180));
        assert_eq!(settings.lifecycle.port_allocation, PortAllocation::Declared);
        assert_eq!(settings.health.poll_interval(), Duration::from_secs(3));
        assert_eq!(settings.health.request_timeout(), Duration::from_secs(5));
        assert_eq!(settings.tests.timeout(), Duration::from_secs(60));
        assert_eq!(settings.tests.command, "node {file}");
        assert_eq!(settings.stream.channel_capacity, 32);
        assert_eq!(settings.docker.binary, "docker");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let settings = VeraSettings::from_toml_str(
            r#"
            [lifecycle]
            port_allocation = "dynamic"

            [docker]
            binary = "podman"

            [docker.runtime_images]
            nodejs = "node:22-alpine"

            [tests]
            command = "deno run -A {file}"
            "#,
        )
        .unwrap();

        assert_eq!(settings.lifecycle.port_allocation, PortAllocation::Dynamic);
        assert_eq!(settings.lifecycle.startup_deadline_secs, 180);
        assert_eq!(settings.docker.binary, "podman");
        assert_eq!(settings.docker.run_timeout_secs, 60);
        assert_eq!(
            settings.docker.runtime_images.get("nodejs").map(String::as_str),
            Some("node:22-alpine")
        );
        assert_eq!(settings.tests.command, "deno run -A {file}");
        assert_eq!(settings.tests.file_name, "generated.test.mjs");
    }

    #[test]
    fn unknown_allocation_is_rejected() {
        let err = VeraSettings::from_toml_str("[lifecycle]\nport_allocation = \"random\"\n");
        assert!(matches!(err, Err(SettingsError::Parse(_))));
    }

    #[test]
    fn overrides_apply_from_lookup() {
        let env: HashMap<&str, &str> = [
            (ENV_DOCKER_BIN, "/usr/local/bin/docker"),
            (ENV_STARTUP_DEADLINE, "45"),
            (ENV_TEST_TIMEOUT, " 90 "),
        ]
        .into_iter()
        .collect();

        let settings = VeraSettings::new()
            .with_overrides(|var| env.get(var).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(settings.docker.binary, "/usr/local/bin/docker");
        assert_eq!(settings.lifecycle.startup_deadline_secs, 45);
        assert_eq!(settings.tests.timeout_secs, 90);
    }

    #[test]
    fn malformed_override_is_an_error() {
        let err = VeraSettings::new()
            .with_overrides(|var| (var == ENV_TEST_TIMEOUT).then(|| "soon".to_string()))
            .unwrap_err();

        assert!(matches!(
            err,
            SettingsError::InvalidOverride { var: ENV_TEST_TIMEOUT, .. }
        ));
    }

    #[test]
    fn settings_file_round_trips_through_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vera.toml");
        std::fs::write(&path, "[stream]\nchannel_capacity = 4\n").unwrap();

        let settings = VeraSettings::from_toml_file(&path).unwrap();
        assert_eq!(settings.stream.channel_capacity, 4);

        assert!(matches!(
            VeraSettings::from_toml_file(&dir.path().join("missing.toml")),
            Err(SettingsError::Read { .. })
        ));
    }
}
