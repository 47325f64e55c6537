//! Isolation runtimes.
//!
//! A runtime runs one Python script that already sits in a workspace
//! directory, with that directory as the only writable location visible to
//! the code. It reports raw process output; deciding what counts as a failure
//! is left to the backend.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::Result;
use crate::sandbox::config::RuntimeConfig;

pub mod docker;
pub mod limits;
pub mod wasm;

pub use docker::DockerRuntime;
pub use wasm::WasmRuntime;

/// One script execution handed to a runtime.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Host path of the workspace, mounted at
    /// [`GUEST_WORKSPACE`](crate::sandbox::workspace::GUEST_WORKSPACE).
    pub workspace: PathBuf,
    /// File name of the script inside the workspace.
    pub script: String,
    /// Wall-clock budget, counted from the moment the guest starts.
    /// Runtimes must stop the guest once it elapses and return
    /// [`SandboxError::Timeout`](crate::error::SandboxError::Timeout).
    pub timeout: Duration,
    /// Start signal and pending cleanup shared with the caller.
    pub lifecycle: Lifecycle,
}

impl Invocation {
    pub fn new(workspace: impl Into<PathBuf>, script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            workspace: workspace.into(),
            script: script.into(),
            timeout,
            lifecycle: Lifecycle::default(),
        }
    }
}

/// Coordination between the manager and a runtime for one invocation.
///
/// A runtime calls [`mark_started`](Self::mark_started) once the guest is
/// actually running; the manager only starts its own timeout clock then, so
/// container creation or module setup is never billed to the user code.
/// Cleanup that has to outlive a dropped `run_python` future (removing a
/// container, waiting for a blocking guest thread) is registered with
/// [`defer_cleanup`](Self::defer_cleanup) and awaited by the manager before
/// it returns.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    started: Arc<watch::Sender<bool>>,
    cleanup: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            started: Arc::new(watch::Sender::new(false)),
            cleanup: Arc::default(),
        }
    }
}

impl Lifecycle {
    pub fn mark_started(&self) {
        self.started.send_replace(true);
    }

    pub fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    /// Resolves once the guest has started, even if that happened before
    /// this was called. Any number of tasks may wait.
    pub async fn started(&self) {
        let mut rx = self.started.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|started| *started).await;
    }

    pub fn defer_cleanup(&self, task: JoinHandle<()>) {
        match self.cleanup.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(_) => warn!("cleanup registry poisoned; task left detached"),
        }
    }

    /// Wait for every deferred cleanup task registered so far.
    pub async fn finish_cleanup(&self) {
        let tasks = match self.cleanup.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "cleanup task failed");
            }
        }
    }
}

/// What the guest process produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// A facility able to run untrusted Python in isolation.
///
/// `Err` means the runtime could not run the code at all (or timed out);
/// code that ran and failed is an `Ok` with stderr output or a non-zero exit.
#[async_trait]
pub trait IsolationRuntime: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run the script described by `invocation`. Implementations call
    /// [`Lifecycle::mark_started`] when the guest begins executing.
    async fn run_python(&self, invocation: Invocation) -> Result<RawOutput>;

    /// Verify the runtime is reachable.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the runtime named by the configuration.
pub fn connect(config: &RuntimeConfig) -> Result<Arc<dyn IsolationRuntime>> {
    match config {
        RuntimeConfig::Docker(docker) => Ok(Arc::new(DockerRuntime::connect(docker.clone())?)),
        RuntimeConfig::Wasm(wasm) => Ok(Arc::new(WasmRuntime::new(wasm.clone())?)),
    }
}
