// ABOUTME: Integration tests for container lifecycle and command execution with a real Docker daemon
// ABOUTME: Tests skip when Docker (or the alpine image) is unavailable

use std::time::{Duration, Instant};
use testbox_sandbox::ContainerManager;
use testbox_sandbox::{
    CommandRunner, DockerRunner, RunRequest, RunnerConfig, SandboxError, SandboxRunner, Verdict,
};

const TEST_IMAGE: &str = "alpine:latest";
/// Image with npm, used by the full-run tests.
const NODE_IMAGE: &str = "node:20-alpine";

/// Check if Docker is available for testing
async fn docker_available() -> Option<ContainerManager> {
    ContainerManager::new().await.ok()
}

async fn test_image_present(manager: &ContainerManager) -> bool {
    manager.docker().inspect_image(TEST_IMAGE).await.is_ok()
}

/// Net-zero invariant: after a create + exec + remove cycle the number of
/// managed containers equals the count before the run.
#[tokio::test]
async fn lifecycle_leaves_no_containers_behind() {
    let Some(manager) = docker_available().await else {
        println!("Skipping test: Docker not available");
        return;
    };
    if !test_image_present(&manager).await {
        println!("Skipping test: {TEST_IMAGE} not present");
        return;
    }

    let project = tempfile::tempdir().unwrap();
    let before = manager.count_managed().await.unwrap();

    let context = manager
        .create(TEST_IMAGE, project.path())
        .await
        .expect("Failed to create container");

    let runner = DockerRunner::new(manager.docker().clone());
    let outcome = runner
        .exec(
            &context,
            vec!["sh".into(), "-c".into(), "echo out; echo err 1>&2; exit 3".into()],
            Duration::from_secs(30),
            None,
        )
        .await
        .expect("Failed to exec");

    assert_eq!(outcome.exit_code, 3);
    assert!(String::from_utf8_lossy(&outcome.stdout).contains("out"));
    assert!(String::from_utf8_lossy(&outcome.stderr).contains("err"));

    manager.remove(context).await;

    let after = manager.count_managed().await.unwrap();
    assert_eq!(before, after, "run leaked a container");
}

/// A command that never terminates fails with Timeout no later than the
/// budget plus the flush grace period, and the container is still removable.
#[tokio::test]
async fn exec_timeout_is_bounded_and_container_survives() {
    let Some(manager) = docker_available().await else {
        println!("Skipping test: Docker not available");
        return;
    };
    if !test_image_present(&manager).await {
        println!("Skipping test: {TEST_IMAGE} not present");
        return;
    }

    let project = tempfile::tempdir().unwrap();
    let context = manager
        .create(TEST_IMAGE, project.path())
        .await
        .expect("Failed to create container");

    let runner = DockerRunner::new(manager.docker().clone());
    let started = Instant::now();
    let result = runner
        .exec(
            &context,
            vec!["sleep".into(), "60".into()],
            Duration::from_secs(1),
            None,
        )
        .await;

    assert!(matches!(result, Err(SandboxError::Timeout { .. })));
    // 1s budget + 2s flush grace, with scheduling slack.
    assert!(started.elapsed() < Duration::from_secs(5));

    manager.remove(context).await;
    // Removing an already-removed context is tolerated.
}

/// remove() is idempotent: a second removal of the same container is success.
#[tokio::test]
async fn remove_is_idempotent() {
    let Some(manager) = docker_available().await else {
        println!("Skipping test: Docker not available");
        return;
    };
    if !test_image_present(&manager).await {
        println!("Skipping test: {TEST_IMAGE} not present");
        return;
    }

    let project = tempfile::tempdir().unwrap();
    let context = manager
        .create(TEST_IMAGE, project.path())
        .await
        .expect("Failed to create container");

    manager.remove(context.clone()).await;
    manager.remove(context).await; // must not panic or error
}

/// Writes a minimal npm project plus a dependency manifest; returns the
/// manifest path.
fn write_fixture_project(dir: &std::path::Path, test_script: &str) -> std::path::PathBuf {
    std::fs::write(
        dir.join("package.json"),
        format!(
            r#"{{"name":"fixture","version":"1.0.0","scripts":{{"test":"{}"}}}}"#,
            test_script
        ),
    )
    .unwrap();
    let manifest = dir.join("deps.json");
    std::fs::write(&manifest, r#"{"npm": ["left-pad"]}"#).unwrap();
    manifest
}

/// End-to-end happy path: ensure image, create container, install, run the
/// test command, clean up, and report PASS with no failure reason.
#[tokio::test]
async fn full_run_reports_pass_and_leaves_no_containers() {
    let Some(manager) = docker_available().await else {
        println!("Skipping test: Docker not available");
        return;
    };
    if manager.docker().inspect_image(NODE_IMAGE).await.is_err() {
        println!("Skipping test: {NODE_IMAGE} not present");
        return;
    }

    let project = tempfile::tempdir().unwrap();
    let manifest = write_fixture_project(project.path(), "exit 0");
    let before = manager.count_managed().await.unwrap();

    let runner = SandboxRunner::connect(RunnerConfig {
        image_tag: NODE_IMAGE.to_string(),
        command_timeout: Duration::from_secs(120),
        install_timeout: Duration::from_secs(60),
        ..Default::default()
    })
    .await
    .expect("Failed to connect");

    let report = runner
        .run(RunRequest {
            project_root: project.path().to_path_buf(),
            test_selector: None,
            dependency_manifest: manifest,
            extra_args: vec![],
        })
        .await
        .expect("Run failed");

    assert_eq!(report.verdict, Verdict::Pass);
    assert!(report.reason.is_none());
    assert!(report
        .progress_log
        .iter()
        .any(|e| e.contains("container") && e.contains("running")));
    assert!(report
        .progress_log
        .iter()
        .any(|e| e.contains("container removed")));

    let after = manager.count_managed().await.unwrap();
    assert_eq!(before, after, "run leaked a container");
}

/// A test command exceeding its budget is a FAIL report with a timeout
/// reason, not an engine error, and the container is still cleaned up.
#[tokio::test]
async fn full_run_maps_a_command_timeout_to_a_fail_report() {
    let Some(manager) = docker_available().await else {
        println!("Skipping test: Docker not available");
        return;
    };
    if manager.docker().inspect_image(NODE_IMAGE).await.is_err() {
        println!("Skipping test: {NODE_IMAGE} not present");
        return;
    }

    let project = tempfile::tempdir().unwrap();
    let manifest = write_fixture_project(project.path(), "sleep 60");
    let before = manager.count_managed().await.unwrap();

    let runner = SandboxRunner::connect(RunnerConfig {
        image_tag: NODE_IMAGE.to_string(),
        command_timeout: Duration::from_secs(2),
        install_timeout: Duration::from_secs(30),
        ..Default::default()
    })
    .await
    .expect("Failed to connect");

    let report = runner
        .run(RunRequest {
            project_root: project.path().to_path_buf(),
            test_selector: None,
            dependency_manifest: manifest,
            extra_args: vec![],
        })
        .await
        .expect("A timed-out test command must not surface as an engine error");

    assert_eq!(report.verdict, Verdict::Fail);
    assert!(report.reason.unwrap().contains("timed out"));

    let after = manager.count_managed().await.unwrap();
    assert_eq!(before, after, "run leaked a container");
}
