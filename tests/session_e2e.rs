//! Whole-session scenarios against a live container engine.
//!
//! These need a reachable `docker` daemon and pull small public images, so
//! they are ignored by default:
//!
//! ```text
//! cargo test --test session_e2e -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use builder_playground::{
    ExecutionContext, Error, FnComponent, LaunchOptions, ReadyCheck, Recipe, Runtime, Service,
    ServiceOverride, Session, Shutdown,
};

async fn artifact_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("genesis.json"), "{}")
        .await
        .unwrap();
    dir
}

/// A long-running service with no readiness check is ready once started,
/// and teardown leaves no labeled containers behind.
#[tokio::test]
#[ignore = "requires a container engine"]
async fn test_basic_session_liveness() {
    let artifacts = artifact_dir().await;
    let recipe = Recipe::new("smoke").with(
        "idle",
        Arc::new(FnComponent::new(|s: &mut Service| {
            s.with_image("alpine")
                .with_tag("3.20")
                .with_entrypoint("sleep")
                .with_args(["600"]);
        })),
    );

    let session = Session::create(artifacts.path()).await.unwrap();
    let manifest = recipe
        .apply(session.id(), session.artifact_dir(), ExecutionContext::default())
        .unwrap();
    let mut runtime = Runtime::new(session, manifest, Shutdown::new(), LaunchOptions::default());

    runtime.launch().await.unwrap();
    runtime.wait_for_ready().await.unwrap();
    runtime.stop(false).await.unwrap();
}

/// A host-binary override removes the service from the compose document
/// and runs it as a child process with host-resolved arguments.
#[tokio::test]
#[ignore = "requires a container engine"]
async fn test_host_execution_override() {
    let artifacts = artifact_dir().await;
    let recipe = Recipe::new("override").with(
        "el",
        Arc::new(FnComponent::new(|s: &mut Service| {
            s.with_image("alpine")
                .with_tag("3.20")
                .with_entrypoint("sleep")
                .with_args(["600", "--marker", "{{Dir}}", "{{Port \"http\" 8545}}"]);
        })),
    );

    let session = Session::create(artifacts.path()).await.unwrap();
    let manifest = recipe
        .apply(session.id(), session.artifact_dir(), ExecutionContext::default())
        .unwrap();

    let mut options = LaunchOptions::default();
    options.overrides.insert(
        "el".to_string(),
        ServiceOverride::HostBinary("/bin/sleep".into()),
    );
    let mut runtime = Runtime::new(session, manifest, Shutdown::new(), options);
    runtime.launch().await.unwrap();

    // absent from the compose document
    let compose = tokio::fs::read_to_string(runtime.session().compose_path())
        .await
        .unwrap();
    assert!(!compose.contains("el:"));

    // but ready as a host process
    runtime.wait_for_ready().await.unwrap();
    runtime.stop(false).await.unwrap();
}

/// A service whose readiness check can never pass trips the ready
/// deadline, and teardown still completes promptly.
#[tokio::test]
#[ignore = "requires a container engine"]
async fn test_ready_timeout_tears_down() {
    let artifacts = artifact_dir().await;
    let recipe = Recipe::new("stuck").with(
        "never-ready",
        Arc::new(FnComponent::new(|s: &mut Service| {
            s.with_image("alpine")
                .with_tag("3.20")
                .with_entrypoint("sleep")
                .with_args(["600"])
                .with_ready(
                    ReadyCheck::exec(vec!["false".to_string()])
                        .interval(Duration::from_millis(500))
                        .retries(2),
                );
        })),
    );

    let session = Session::create(artifacts.path()).await.unwrap();
    let manifest = recipe
        .apply(session.id(), session.artifact_dir(), ExecutionContext::default())
        .unwrap();

    let mut options = LaunchOptions::default();
    options.ready_timeout = Duration::from_secs(5);
    let mut runtime = Runtime::new(session, manifest, Shutdown::new(), options);
    runtime.launch().await.unwrap();

    let err = runtime.wait_for_ready().await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }) || err.category() == "lifecycle");

    let teardown = tokio::time::timeout(Duration::from_secs(10), runtime.stop(false)).await;
    teardown.unwrap().unwrap();
}
