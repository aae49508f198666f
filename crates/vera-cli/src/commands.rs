//! Subcommand handlers

use anyhow::Context;
use clap::ArgMatches;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use vera_core::{
    FeatureAnalysis, FileTestGenerator, LifecycleManager, ProjectRegistry, StaticPlanner,
    StreamEvent, VeraSettings, VerificationCoordinator, VerificationOutcome, VerificationRequest,
};
use vera_sandbox::{CommandExecutor, DockerBackend, HealthProber, HostBackend, IsolationBackend};

/// Exit code used when a command was killed by its timeout
const EXIT_TIMEOUT: u8 = 124;
/// Exit code used when interrupted
const EXIT_INTERRUPTED: u8 = 130;

pub(crate) fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<VeraSettings> {
    let settings = match path {
        Some(path) => VeraSettings::from_toml_file(path)?,
        None => VeraSettings::default(),
    };
    Ok(settings.with_env_overrides()?)
}

fn backend(name: &str, settings: &VeraSettings) -> Arc<dyn IsolationBackend> {
    match name {
        "host" => Arc::new(HostBackend::new(
            Duration::from_secs(settings.docker.build_timeout_secs),
            Duration::from_secs(settings.docker.teardown_timeout_secs),
        )),
        _ => Arc::new(DockerBackend::new(settings.docker.clone())),
    }
}

fn load_features(path: &Path) -> anyhow::Result<Vec<FeatureAnalysis>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid feature analysis in {}", path.display()))
}

enum Next {
    Event(Option<StreamEvent>),
    Interrupted,
}

pub(crate) async fn verify(args: &ArgMatches, settings: &VeraSettings) -> anyhow::Result<ExitCode> {
    let project = args
        .get_one::<PathBuf>("project")
        .context("--project is required")?;
    let plan = args.get_one::<PathBuf>("plan").context("--plan is required")?;
    let tests = args.get_one::<PathBuf>("tests").context("--tests is required")?;
    let backend_name = args
        .get_one::<String>("backend")
        .map_or("docker", String::as_str);

    anyhow::ensure!(project.is_dir(), "{} is not a directory", project.display());

    let planner = StaticPlanner::from_file(plan)?;
    let features = match args.get_one::<PathBuf>("features") {
        Some(path) => load_features(path)?,
        None => Vec::new(),
    };
    let description = args
        .get_one::<String>("description")
        .cloned()
        .unwrap_or_default();

    let lifecycle = LifecycleManager::from_settings(
        backend(backend_name, settings),
        Arc::new(ProjectRegistry::new()),
        settings,
    );
    tracing::info!(backend = lifecycle.backend_name(), project = %project.display(), "verifying");

    let coordinator = VerificationCoordinator::new(
        Arc::new(lifecycle),
        Arc::new(planner),
        Arc::new(FileTestGenerator::new(tests)),
    )
    .with_settings(settings);

    let request = VerificationRequest::new(project, description).with_features(features);
    let mut stream = coordinator.spawn_stream(request);

    let outcome = loop {
        let next = tokio::select! {
            event = stream.next() => Next::Event(event),
            _ = tokio::signal::ctrl_c() => Next::Interrupted,
        };
        match next {
            Next::Event(Some(StreamEvent::Progress(event))) => {
                eprintln!("[{}] {}", event.stage, event.message);
            }
            Next::Event(Some(StreamEvent::Finished(outcome))) => break outcome,
            Next::Event(None) => anyhow::bail!("verification worker stopped without an outcome"),
            Next::Interrupted => {
                tracing::warn!("interrupted, cleaning up");
                stream.cancel().await;
                return Ok(ExitCode::from(EXIT_INTERRUPTED));
            }
        }
    };

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }

    Ok(if outcome.tests_passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_outcome(outcome: &VerificationOutcome) {
    println!(
        "Tests {} in {:.1}s",
        if outcome.tests_passed { "PASSED" } else { "FAILED" },
        Duration::from_millis(outcome.duration_ms).as_secs_f64()
    );
    println!();
    println!("{}", outcome.log);
}

pub(crate) async fn exec(args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let cwd = args
        .get_one::<PathBuf>("cwd")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("."));
    let timeout = Duration::from_secs(args.get_one::<u64>("timeout").copied().unwrap_or(60));
    let command = args
        .get_many::<String>("command")
        .map(|parts| parts.cloned().collect::<Vec<_>>().join(" "))
        .context("no command given")?;

    let result = CommandExecutor::new().run(&command, &cwd, timeout).await?;
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    tracing::debug!(exit_code = result.exit_code, duration_ms = result.duration_ms, "exec finished");

    Ok(if result.timed_out {
        ExitCode::from(EXIT_TIMEOUT)
    } else {
        ExitCode::from(u8::try_from(result.exit_code).unwrap_or(1))
    })
}

pub(crate) async fn probe(args: &ArgMatches, settings: &VeraSettings) -> anyhow::Result<ExitCode> {
    let url = args.get_one::<String>("url").context("url is required")?;
    let deadline = Duration::from_secs(args.get_one::<u64>("deadline").copied().unwrap_or(30));
    let prober = HealthProber::new(
        settings.health.poll_interval(),
        settings.health.request_timeout(),
    );

    match prober
        .wait_until_healthy(Some(url), Duration::ZERO, deadline)
        .await
    {
        Ok(()) => {
            println!("{url} is ready");
            Ok(ExitCode::SUCCESS)
        }
        Err(timeout) => {
            println!("{timeout}");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_default_without_file() {
        let settings = load_settings(None).unwrap();
        assert_eq!(settings.stream.channel_capacity, 32);
    }

    #[test]
    fn missing_settings_file_is_an_error() {
        let path = PathBuf::from("/nonexistent/vera.toml");
        assert!(load_settings(Some(&path)).is_err());
    }

    #[test]
    fn features_load_from_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("features.json");
        std::fs::write(
            &path,
            r#"[{"feature_description": "Create a channel",
                 "implementation_location": [{"file": "src/a.ts", "function": "create", "lines": "1-4"}]}]"#,
        )
        .unwrap();

        let features = load_features(&path).unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].implementation_location[0].function, "create");

        std::fs::write(&path, "{}").unwrap();
        assert!(load_features(&path).is_err());
    }

    #[test]
    fn host_backend_is_selectable() {
        let settings = VeraSettings::default();
        assert_eq!(backend("host", &settings).name(), "host");
        assert_eq!(backend("docker", &settings).name(), "docker");
    }
}
