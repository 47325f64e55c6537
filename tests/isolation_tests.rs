//! Isolation tests against a real container engine.
//!
//! These try the usual escape routes and check that the container keeps user
//! code inside its workspace. They need a running Docker daemon and an image
//! with Python and matplotlib, named by `PYTHON_DOCKER_IMAGE`:
//!
//! ```sh
//! PYTHON_DOCKER_IMAGE=my/python-matplotlib cargo test -- --ignored
//! ```

use std::time::{Duration, Instant};

use code_sandbox::prelude::*;

fn docker_manager(root: &std::path::Path, timeout: Duration) -> SandboxManager {
    let image = std::env::var("PYTHON_DOCKER_IMAGE").unwrap_or_else(|_| "python:3.12-slim".to_string());
    let config = SandboxConfig::builder()
        .workspace_root(root)
        .timeout(timeout)
        .max_concurrency(2)
        .docker_image(image)
        .build();
    SandboxManager::new(config).unwrap()
}

async fn run(manager: &SandboxManager, code: &str) -> ExecutionResult {
    manager
        .execute(ExecutionRequest::new(Language::Python, code, "isolation"))
        .await
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_health_check() {
    let root = tempfile::tempdir().unwrap();
    let manager = docker_manager(root.path(), Duration::from_secs(30));
    manager.check_runtime().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_infinite_loop_timeout() {
    let root = tempfile::tempdir().unwrap();
    let manager = docker_manager(root.path(), Duration::from_secs(2));

    let started = Instant::now();
    let result = run(&manager, "while True: pass").await;

    assert!(result.is_timeout(), "infinite loop should time out: {:?}", result);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_host_filesystem_not_visible() {
    let root = tempfile::tempdir().unwrap();
    let marker = root.path().join("outside.txt");
    std::fs::write(&marker, "secret").unwrap();
    let manager = docker_manager(root.path(), Duration::from_secs(30));

    let code = format!(
        r#"
import os
print('VISIBLE' if os.path.exists({:?}) else 'HIDDEN')
"#,
        marker.display().to_string()
    );
    let result = run(&manager, &code).await;

    assert!(result.is_success(), "{:?}", result);
    assert_eq!(result.stdout_lines, vec!["HIDDEN"]);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_root_filesystem_read_only() {
    let root = tempfile::tempdir().unwrap();
    let manager = docker_manager(root.path(), Duration::from_secs(30));

    let result = run(
        &manager,
        r#"
try:
    open('/usr/breach.txt', 'w').write('x')
    print('SECURITY_BREACH')
except OSError as e:
    print(f'BLOCKED: {type(e).__name__}')
"#,
    )
    .await;

    assert!(result.stdout_lines.iter().all(|l| !l.contains("SECURITY_BREACH")));
    assert!(result.stdout_lines[0].starts_with("BLOCKED"));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_workspace_is_only_writable_location() {
    let root = tempfile::tempdir().unwrap();
    let manager = docker_manager(root.path(), Duration::from_secs(30));

    let result = run(
        &manager,
        r#"
import tempfile
for path in ['/tmp/x', '/dev/shm/x', '/root/x']:
    try:
        open(path, 'w').write('x')
        print('WRITABLE ' + path)
    except OSError:
        print('BLOCKED ' + path)
print(tempfile.gettempdir())
"#,
    )
    .await;

    assert!(result.is_success(), "{:?}", result);
    assert_eq!(
        result.stdout_lines,
        vec!["BLOCKED /tmp/x", "BLOCKED /dev/shm/x", "BLOCKED /root/x", "/workspace"]
    );
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_network_blocked() {
    let root = tempfile::tempdir().unwrap();
    let manager = docker_manager(root.path(), Duration::from_secs(30));

    let result = run(
        &manager,
        r#"
import socket
try:
    socket.create_connection(('1.1.1.1', 53), timeout=2)
    print('SECURITY_BREACH')
except OSError as e:
    print(f'BLOCKED: {type(e).__name__}')
"#,
    )
    .await;

    assert!(result.is_success(), "{:?}", result);
    assert!(result.stdout_lines[0].starts_with("BLOCKED"));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_stderr_marks_failure() {
    let root = tempfile::tempdir().unwrap();
    let manager = docker_manager(root.path(), Duration::from_secs(30));

    let result = run(&manager, "import sys\nprint('ok')\nsys.stderr.write('warned\\n')").await;

    assert_eq!(result.failure_kind(), Some(FailureKind::Runtime));
    assert_eq!(result.stdout_lines, vec!["ok"]);
    assert_eq!(result.stderr_lines, vec!["warned"]);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_exception_message() {
    let root = tempfile::tempdir().unwrap();
    let manager = docker_manager(root.path(), Duration::from_secs(30));

    let result = run(&manager, "x = 1 / 0").await;

    assert_eq!(result.failure_kind(), Some(FailureKind::Runtime));
    assert_eq!(
        result.error_message.as_deref(),
        Some("ZeroDivisionError: division by zero")
    );
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_matplotlib_show_yields_images() {
    let root = tempfile::tempdir().unwrap();
    let manager = docker_manager(root.path(), Duration::from_secs(60));

    let result = run(
        &manager,
        r#"
import matplotlib.pyplot as plt
plt.plot([1, 2, 3])
plt.show()
plt.figure()
plt.bar([1, 2], [3, 4])
plt.show()
print('done')
"#,
    )
    .await;

    assert!(result.is_success(), "{:?}", result);
    assert_eq!(result.stdout_lines, vec!["done"]);
    let images: Vec<_> = result.artifacts_of(ArtifactKind::Image).collect();
    assert_eq!(images.len(), 2);
    assert_eq!(images[0].order, 1);
    assert_eq!(images[1].order, 2);
    // PNG signature, base64-encoded.
    assert!(images[0].encoded_data.starts_with("iVBORw0KGgo"));
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}
