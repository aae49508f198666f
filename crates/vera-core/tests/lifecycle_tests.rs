//! Lifecycle manager behaviour against the host and fake backends

use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vera_core::{LifecycleManager, ProjectRegistry, ProjectState, StartFailure};
use vera_sandbox::{HostBackend, StartMethod, StartupConfig};
use vera_test_utils::{dead_port, fast_lifecycle, native_config, project_dir, serve_status, FakeBackend, Fault};

#[tokio::test]
async fn host_project_starts_and_stops() {
    let dir = project_dir();
    let registry = Arc::new(ProjectRegistry::new());
    let manager = LifecycleManager::new(Arc::new(HostBackend::default()), Arc::clone(&registry));
    let config = StartupConfig::new(StartMethod::NativeRuntime)
        .with_install("true")
        .with_start("sleep 0; true")
        .with_estimated_startup(1);

    let project = manager.start(dir.path(), config).await.unwrap();
    assert!(project.is_running());
    assert_eq!(registry.len(), 1);

    assert!(manager.stop(&project).await);
    assert_eq!(project.state(), ProjectState::Stopped);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn unreachable_health_url_times_out_and_cleans_up() {
    let dir = project_dir();
    let port = dead_port().await;
    let backend = Arc::new(FakeBackend::new().with_logs("listening on wrong port"));
    let manager = fast_lifecycle(backend.clone(), Duration::from_millis(600));
    let config = native_config("node index.js")
        .with_port(port)
        .with_health_url(format!("http://127.0.0.1:{port}/health"));

    let started = Instant::now();
    let err = manager.start(dir.path(), config).await.unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(600));
    match &err {
        StartFailure::HealthCheckTimeout(timeout) => {
            assert_eq!(timeout.logs, "listening on wrong port");
        }
        other => panic!("unexpected failure: {other}"),
    }
    assert!(manager.registry().is_empty());
    assert_eq!(manager.registry().reserved_count(), 0);
    assert_eq!(backend.provisioned(), backend.torn_down());
}

#[tokio::test]
async fn healthy_service_registers_project() {
    let dir = project_dir();
    let port = serve_status("200 OK").await;
    let backend = Arc::new(FakeBackend::new());
    let manager = fast_lifecycle(backend.clone(), Duration::from_secs(5));
    let config = native_config("node index.js")
        .with_port(port)
        .with_health_url(format!("http://127.0.0.1:{port}/"));

    let project = manager.start(dir.path(), config).await.unwrap();

    assert!(project.is_running());
    assert_eq!(project.service_address(), format!("http://localhost:{port}"));
    assert!(manager.registry().get(project.id()).is_some());
    assert_eq!(manager.stop_all().await, 1);
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn provisioning_failure_tears_down_before_returning() {
    let dir = project_dir();
    let backend = Arc::new(FakeBackend::new().with_fault(Fault::Provision));
    let manager = fast_lifecycle(backend.clone(), Duration::from_secs(1));

    let err = manager
        .start(dir.path(), native_config("npm start"))
        .await
        .unwrap_err();

    assert!(matches!(err, StartFailure::Provisioning(_)));
    assert_eq!(backend.torn_down().len(), 1);
    assert_eq!(backend.provisioned(), backend.torn_down());
    assert_eq!(manager.registry().reserved_count(), 0);
}

#[tokio::test]
async fn second_stop_is_a_no_op() {
    let dir = project_dir();
    let backend = Arc::new(FakeBackend::new().with_fault(Fault::Teardown));
    let manager = fast_lifecycle(backend.clone(), Duration::from_secs(1));

    let project = manager
        .start(dir.path(), native_config("npm start"))
        .await
        .unwrap();

    assert!(manager.stop(&project).await);
    let after_first = manager.registry().len();
    assert!(!manager.stop(&project).await);

    assert_eq!(manager.registry().len(), after_first);
    assert_eq!(backend.torn_down().len(), 1);
}

#[tokio::test]
async fn unknown_method_never_provisions() {
    let dir = project_dir();
    let backend = Arc::new(FakeBackend::new());
    let manager = fast_lifecycle(backend.clone(), Duration::from_secs(1));

    let err = manager
        .start(dir.path(), StartupConfig::unknown().with_start("npm start"))
        .await
        .unwrap_err();

    assert!(matches!(err, StartFailure::UnsupportedMethod(StartMethod::Unknown)));
    assert!(backend.provisioned().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_get_distinct_ids() {
    let dir = project_dir();
    let backend = Arc::new(FakeBackend::new().with_provision_delay(Duration::from_millis(20)));
    let manager = Arc::new(fast_lifecycle(backend.clone(), Duration::from_secs(1)));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let root = dir.path().to_path_buf();
            tokio::spawn(async move { manager.start(root, native_config("npm start")).await })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        let project = handle.await.unwrap().unwrap();
        ids.insert(project.id().clone());
    }

    assert_eq!(ids.len(), 32);
    assert_eq!(manager.registry().len(), 32);
    assert_eq!(manager.stop_all().await, 32);
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn dropped_stop_still_finishes_teardown() {
    let dir = project_dir();
    let backend = Arc::new(FakeBackend::new().with_teardown_delay(Duration::from_millis(300)));
    let manager = fast_lifecycle(backend.clone(), Duration::from_secs(1));
    let project = manager
        .start(dir.path(), native_config("npm start"))
        .await
        .unwrap();

    let dropped = tokio::time::timeout(Duration::from_millis(50), manager.stop(&project)).await;
    assert!(dropped.is_err());
    assert_eq!(backend.teardowns_finished(), 0);

    // The second stop is a no-op but waits for the teardown in flight.
    assert!(!manager.stop(&project).await);
    assert_eq!(backend.teardowns_finished(), 1);
    assert!(manager.registry().is_empty());
    assert_eq!(manager.registry().reserved_count(), 0);
}

#[tokio::test]
async fn stop_during_launch_aborts_and_tears_down_again() {
    let dir = project_dir();
    let backend = Arc::new(FakeBackend::new().with_provision_delay(Duration::from_millis(300)));
    let manager = Arc::new(fast_lifecycle(backend.clone(), Duration::from_secs(1)));
    let project = manager.create(dir.path(), native_config("npm start")).unwrap();

    let launching = {
        let manager = Arc::clone(&manager);
        let project = Arc::clone(&project);
        tokio::spawn(async move { manager.launch(&project, None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.stop(&project).await);

    let err = launching.await.unwrap().unwrap_err();
    assert!(matches!(err, StartFailure::Aborted));
    assert_eq!(project.state(), ProjectState::Stopped);
    assert_eq!(backend.provisioned().len(), 1);
    assert_eq!(backend.torn_down().len(), 2);
    assert_eq!(backend.teardowns_finished(), 2);
    assert!(manager.registry().is_empty());
    assert_eq!(manager.registry().reserved_count(), 0);
}

#[tokio::test]
async fn stopped_project_is_never_provisioned() {
    let dir = project_dir();
    let backend = Arc::new(FakeBackend::new());
    let manager = fast_lifecycle(backend.clone(), Duration::from_secs(1));
    let project = manager.create(dir.path(), native_config("npm start")).unwrap();

    assert!(manager.stop(&project).await);
    let err = manager.launch(&project, None).await.unwrap_err();

    assert!(matches!(err, StartFailure::Aborted));
    assert!(backend.provisioned().is_empty());
    assert_eq!(manager.registry().reserved_count(), 0);
}
