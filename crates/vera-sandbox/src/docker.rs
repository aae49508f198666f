//! Docker isolation backend
//!
//! Drives the docker CLI for all three strategies. Every resource is named
//! after the project namespace (`vera-<id>`) so concurrent verifications on
//! one host never collide, and teardown can find everything by name alone.

use crate::backend::{IsolationBackend, Provision};
use crate::error::{SandboxError, TeardownWarning};
use crate::exec::{tail, CommandExecutor, CommandSpec};
use crate::manifest::{
    find_manifest, prepare_env_file, ComposeManifest, Ecosystem, BUILD_MANIFESTS,
    COMPOSE_MANIFESTS,
};
use crate::types::{ExecutionResult, Strategy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bytes of stderr kept in step errors
const STDERR_TAIL: usize = 2000;

/// Rewrites project paths before they are used as volume sources
///
/// Needed when this process runs in a container that talks to the host's
/// docker daemon: the daemon resolves mounts against the host filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRewrite {
    /// Prefix as seen by this process
    pub from: PathBuf,
    /// Same location as seen by the docker daemon
    pub to: PathBuf,
}

impl PathRewrite {
    /// Apply to `path`; paths outside `from` are returned unchanged
    #[must_use]
    pub fn apply(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.from) {
            Ok(rest) => self.to.join(rest),
            Err(_) => path.to_path_buf(),
        }
    }
}

/// Docker backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    /// Docker CLI binary
    pub binary: String,
    /// Image build / compose up timeout
    pub build_timeout_secs: u64,
    /// Container run timeout
    pub run_timeout_secs: u64,
    /// Per-step teardown timeout
    pub teardown_timeout_secs: u64,
    /// Log capture timeout
    pub logs_timeout_secs: u64,
    /// Log lines captured per container
    pub log_tail_lines: u32,
    /// Runtime image per ecosystem key (`nodejs`, `python`, `rust`, `go`)
    pub runtime_images: BTreeMap<String, String>,
    /// Image used when no ecosystem is recognised
    pub fallback_image: String,
    /// Where the project is mounted inside native-runtime containers
    pub mount_path: String,
    /// Optional volume source rewrite
    pub host_path_rewrite: Option<PathRewrite>,
}

impl DockerSettings {
    /// With docker binary
    #[inline]
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Image for an ecosystem
    #[must_use]
    pub fn image_for(&self, ecosystem: Ecosystem) -> &str {
        self.runtime_images
            .get(ecosystem.as_str())
            .map_or(self.fallback_image.as_str(), String::as_str)
    }
}

impl Default for DockerSettings {
    fn default() -> Self {
        let runtime_images = [
            ("nodejs", "node:20-slim"),
            ("python", "python:3.12-slim"),
            ("rust", "rust:1.75-slim"),
            ("go", "golang:1.21-alpine"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            binary: "docker".to_string(),
            build_timeout_secs: 600,
            run_timeout_secs: 60,
            teardown_timeout_secs: 30,
            logs_timeout_secs: 10,
            log_tail_lines: 200,
            runtime_images,
            fallback_image: "ubuntu:22.04".to_string(),
            mount_path: "/app".to_string(),
            host_path_rewrite: None,
        }
    }
}

/// Isolation through the docker CLI
#[derive(Debug, Clone, Default)]
pub struct DockerBackend {
    settings: DockerSettings,
    executor: CommandExecutor,
}

impl DockerBackend {
    /// Create new backend
    #[inline]
    #[must_use]
    pub fn new(settings: DockerSettings) -> Self {
        Self {
            settings,
            executor: CommandExecutor::new(),
        }
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &DockerSettings {
        &self.settings
    }

    fn docker(&self, cwd: &Path, timeout_secs: u64) -> CommandSpec {
        CommandSpec::new(
            self.settings.binary.clone(),
            cwd,
            Duration::from_secs(timeout_secs),
        )
    }

    /// `docker compose up` for the compose strategy
    pub(crate) fn compose_up_spec(
        &self,
        provision: &Provision,
    ) -> Result<CommandSpec, SandboxError> {
        let dir = provision.command_dir();
        let manifest = find_manifest(&dir, COMPOSE_MANIFESTS).ok_or_else(|| {
            SandboxError::ManifestMissing {
                kind: "compose",
                dir: dir.clone(),
            }
        })?;

        let parsed = ComposeManifest::load(&manifest)?;
        tracing::info!(
            project_id = %provision.project_id,
            manifest = %manifest.display(),
            services = ?parsed.service_names().collect::<Vec<_>>(),
            "compose manifest loaded"
        );

        let mut spec = self
            .docker(&dir, self.settings.build_timeout_secs)
            .args(["compose", "-p"])
            .arg(provision.project_id.namespace())
            .arg("-f")
            .arg(manifest.display().to_string())
            .args(["up", "-d", "--build"]);
        for (key, value) in &provision.config.env_vars {
            spec = spec.env(key.clone(), value.clone());
        }
        Ok(spec)
    }

    /// `docker build` + `docker run` for the image-build strategy
    pub(crate) fn image_build_specs(
        &self,
        provision: &Provision,
    ) -> Result<(CommandSpec, CommandSpec), SandboxError> {
        let dir = provision.command_dir();
        let manifest = find_manifest(&dir, BUILD_MANIFESTS).ok_or_else(|| {
            SandboxError::ManifestMissing {
                kind: "build",
                dir: dir.clone(),
            }
        })?;
        let tag = provision.project_id.image_tag();

        let build = self
            .docker(&dir, self.settings.build_timeout_secs)
            .args(["build", "-t"])
            .arg(tag.clone())
            .arg("-f")
            .arg(manifest.display().to_string())
            .arg(dir.display().to_string());

        let run = self
            .run_prefix(provision, &dir)
            .arg(tag);

        Ok((build, run))
    }

    /// `docker run` for the native-runtime strategy
    pub(crate) fn native_run_spec(&self, provision: &Provision) -> Result<CommandSpec, SandboxError> {
        let command = provision
            .config
            .launch_command()
            .ok_or(SandboxError::MissingStartCommand)?;

        let root = std::fs::canonicalize(&provision.project_dir)
            .unwrap_or_else(|_| provision.project_dir.clone());
        let source = match &self.settings.host_path_rewrite {
            Some(rewrite) => rewrite.apply(&root),
            None => root.clone(),
        };

        let image = match provision.config.runtime_image.as_deref() {
            Some(image) if !image.trim().is_empty() => image.to_string(),
            _ => {
                let ecosystem = Ecosystem::detect(&provision.command_dir());
                tracing::debug!(ecosystem = ecosystem.as_str(), "runtime image from ecosystem");
                self.settings.image_for(ecosystem).to_string()
            }
        };

        Ok(self
            .run_prefix(provision, &root)
            .arg("-v")
            .arg(format!("{}:{}", source.display(), self.settings.mount_path))
            .arg("-w")
            .arg(self.container_workdir(provision))
            .arg(image)
            .args(["sh", "-c"])
            .arg(command))
    }

    fn run_prefix(&self, provision: &Provision, cwd: &Path) -> CommandSpec {
        let mut spec = self
            .docker(cwd, self.settings.run_timeout_secs)
            .args(["run", "-d", "--name"])
            .arg(provision.project_id.container_name())
            .arg("-p")
            .arg(format!(
                "{}:{}",
                provision.host_port, provision.config.service_port
            ));
        for pair in provision.env_pairs() {
            spec = spec.arg("-e").arg(pair);
        }
        spec
    }

    fn container_workdir(&self, provision: &Provision) -> String {
        let mount = self.settings.mount_path.trim_end_matches('/');
        let relative = provision.config.working_dir.display().to_string();
        let relative = relative.trim_start_matches("./").trim_matches('/');
        if relative.is_empty() || relative == "." {
            mount.to_string()
        } else {
            format!("{mount}/{relative}")
        }
    }

    async fn step(
        &self,
        step: &'static str,
        spec: &CommandSpec,
    ) -> Result<ExecutionResult, SandboxError> {
        let result = self.executor.run_spec(spec).await?;
        if result.timed_out {
            return Err(SandboxError::StepTimedOut {
                step,
                timeout_secs: spec.timeout.as_secs(),
            });
        }
        if !result.success {
            return Err(SandboxError::StepFailed {
                step,
                exit_code: result.exit_code,
                stderr: tail(result.stderr.trim(), STDERR_TAIL).to_string(),
            });
        }
        Ok(result)
    }

    async fn start_container(
        &self,
        provision: &Provision,
        spec: &CommandSpec,
    ) -> Result<(), SandboxError> {
        let result = self.step("docker run", spec).await?;
        let container_id = result.stdout.trim();
        if container_id.is_empty() {
            return Err(SandboxError::StepFailed {
                step: "docker run",
                exit_code: result.exit_code,
                stderr: tail(result.stderr.trim(), STDERR_TAIL).to_string(),
            });
        }
        tracing::info!(
            project_id = %provision.project_id,
            container = container_id.get(..12).unwrap_or(container_id),
            "container started"
        );
        Ok(())
    }

    async fn release(
        &self,
        step: &'static str,
        spec: &CommandSpec,
        warnings: &mut Vec<TeardownWarning>,
    ) {
        match self.executor.run_spec(spec).await {
            Ok(result) if result.success => {}
            Ok(result) if is_absent(&result.stderr) => {
                tracing::debug!(step, "nothing to release");
            }
            Ok(result) => warnings.push(TeardownWarning::new(
                step,
                if result.timed_out {
                    format!("timed out after {}s", spec.timeout.as_secs())
                } else {
                    format!(
                        "exit {}: {}",
                        result.exit_code,
                        tail(result.stderr.trim(), STDERR_TAIL)
                    )
                },
            )),
            Err(e) => warnings.push(TeardownWarning::new(step, e.to_string())),
        }
    }

    fn teardown_dir(provision: &Provision) -> PathBuf {
        let dir = provision.command_dir();
        if dir.is_dir() {
            dir
        } else {
            std::env::temp_dir()
        }
    }
}

fn is_absent(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such image")
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn provision(&self, provision: &Provision) -> Result<(), SandboxError> {
        tracing::info!(
            project_id = %provision.project_id,
            strategy = %provision.strategy,
            host_port = provision.host_port,
            "provisioning"
        );

        match provision.strategy {
            Strategy::Compose => {
                let spec = self.compose_up_spec(provision)?;
                prepare_env_file(&provision.command_dir())?;
                self.step("docker compose up", &spec).await?;
                tracing::info!(project_id = %provision.project_id, "compose services started");
                Ok(())
            }
            Strategy::ImageBuild => {
                let (build, run) = self.image_build_specs(provision)?;
                self.step("docker build", &build).await?;
                self.start_container(provision, &run).await
            }
            Strategy::NativeRuntime => {
                let run = self.native_run_spec(provision)?;
                self.start_container(provision, &run).await
            }
        }
    }

    async fn teardown(&self, provision: &Provision) -> Vec<TeardownWarning> {
        let cwd = Self::teardown_dir(provision);
        let timeout = self.settings.teardown_timeout_secs;
        let mut warnings = Vec::new();

        match provision.strategy {
            Strategy::Compose => {
                let mut spec = self
                    .docker(&cwd, timeout)
                    .args(["compose", "-p"])
                    .arg(provision.project_id.namespace());
                if let Some(manifest) = find_manifest(&cwd, COMPOSE_MANIFESTS) {
                    spec = spec.arg("-f").arg(manifest.display().to_string());
                }
                let spec = spec.args(["down", "-v", "--remove-orphans"]);
                self.release("docker compose down", &spec, &mut warnings)
                    .await;
            }
            Strategy::ImageBuild => {
                let rm = self
                    .docker(&cwd, timeout)
                    .args(["rm", "-f"])
                    .arg(provision.project_id.container_name());
                self.release("docker rm", &rm, &mut warnings).await;

                let rmi = self
                    .docker(&cwd, timeout)
                    .args(["rmi", "-f"])
                    .arg(provision.project_id.image_tag());
                self.release("docker rmi", &rmi, &mut warnings).await;
            }
            Strategy::NativeRuntime => {
                let rm = self
                    .docker(&cwd, timeout)
                    .args(["rm", "-f"])
                    .arg(provision.project_id.container_name());
                self.release("docker rm", &rm, &mut warnings).await;
            }
        }

        warnings
    }

    async fn logs(&self, provision: &Provision) -> String {
        let cwd = Self::teardown_dir(provision);
        let lines = self.settings.log_tail_lines.to_string();
        let base = self.docker(&cwd, self.settings.logs_timeout_secs);
        let spec = match provision.strategy {
            Strategy::Compose => base
                .args(["compose", "-p"])
                .arg(provision.project_id.namespace())
                .args(["logs", "--no-color", "--tail"])
                .arg(lines),
            Strategy::ImageBuild | Strategy::NativeRuntime => base
                .args(["logs", "--tail"])
                .arg(lines)
                .arg(provision.project_id.container_name()),
        };

        match self.executor.run_spec(&spec).await {
            Ok(result) => result.combined_output(),
            Err(e) => format!("Failed to get logs: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProjectId, StartMethod, StartupConfig};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn provision(dir: &Path, strategy: Strategy, config: StartupConfig) -> Provision {
        Provision {
            project_id: ProjectId::generate(),
            project_dir: dir.to_path_buf(),
            config,
            strategy,
            host_port: 43000,
        }
    }

    #[test]
    fn native_run_mounts_project_and_chains_commands() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        let config = StartupConfig::new(StartMethod::NativeRuntime)
            .with_install("npm ci")
            .with_start("npm start")
            .with_port(3000)
            .with_env("NODE_ENV", "test");
        let p = provision(dir.path(), Strategy::NativeRuntime, config);

        let spec = DockerBackend::default().native_run_spec(&p).unwrap();
        let args = spec.args.join(" ");

        assert_eq!(spec.program, "docker");
        assert!(args.starts_with(&format!("run -d --name {}", p.project_id.container_name())));
        assert!(args.contains("-p 43000:3000"));
        assert!(args.contains("-e NODE_ENV=test"));
        assert!(args.contains(":/app -w /app node:20-slim sh -c"));
        assert_eq!(spec.args.last().unwrap(), "npm ci && npm start");
    }

    #[test]
    fn native_run_requires_start_command() {
        let dir = TempDir::new().unwrap();
        let p = provision(
            dir.path(),
            Strategy::NativeRuntime,
            StartupConfig::new(StartMethod::NativeRuntime).with_install("npm ci"),
        );
        assert!(matches!(
            DockerBackend::default().native_run_spec(&p),
            Err(SandboxError::MissingStartCommand)
        ));
    }

    #[test]
    fn native_workdir_follows_relative_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("server")).unwrap();
        let config = StartupConfig::new(StartMethod::NativeRuntime)
            .with_start("python app.py")
            .with_working_dir("./server")
            .with_runtime_image("python:3.12-slim");
        let p = provision(dir.path(), Strategy::NativeRuntime, config);

        let spec = DockerBackend::default().native_run_spec(&p).unwrap();
        assert!(spec.args.join(" ").contains("-w /app/server python:3.12-slim"));
    }

    #[test]
    fn image_build_requires_manifest() {
        let dir = TempDir::new().unwrap();
        let p = provision(
            dir.path(),
            Strategy::ImageBuild,
            StartupConfig::new(StartMethod::ImageBuild),
        );
        assert!(matches!(
            DockerBackend::default().image_build_specs(&p),
            Err(SandboxError::ManifestMissing { kind: "build", .. })
        ));

        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        let (build, run) = DockerBackend::default().image_build_specs(&p).unwrap();
        assert_eq!(
            build.args[..3].join(" "),
            format!("build -t {}", p.project_id.image_tag())
        );
        assert_eq!(run.args.last().unwrap(), &p.project_id.image_tag());
    }

    #[test]
    fn compose_up_is_namespaced() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("docker-compose.yml"),
            "services:\n  web:\n    image: nginx\n",
        )
        .unwrap();
        let p = provision(
            dir.path(),
            Strategy::Compose,
            StartupConfig::new(StartMethod::Compose),
        );

        let spec = DockerBackend::default().compose_up_spec(&p).unwrap();
        let args = spec.args.join(" ");
        assert!(args.starts_with(&format!("compose -p {} -f ", p.project_id.namespace())));
        assert!(args.ends_with("docker-compose.yml up -d --build"));
    }

    #[test]
    fn path_rewrite_maps_container_paths() {
        let rewrite = PathRewrite {
            from: PathBuf::from("/tmp/uploads"),
            to: PathBuf::from("/srv/vera/uploads"),
        };
        assert_eq!(
            rewrite.apply(Path::new("/tmp/uploads/session-1/app")),
            PathBuf::from("/srv/vera/uploads/session-1/app")
        );
        assert_eq!(rewrite.apply(Path::new("/other")), PathBuf::from("/other"));
    }

    #[test]
    fn absent_resources_are_not_warnings() {
        assert!(is_absent("Error: No such container: vera-1234abcd"));
        assert!(is_absent("Error response from daemon: No such image: vera-x:latest"));
        assert!(!is_absent("permission denied"));
    }
}
