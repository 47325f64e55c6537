//! Language backends.
//!
//! [`PythonBackend`] really executes code, inside an [`IsolationRuntime`].
//! [`DocumentBackend`] handles JavaScript/HTML and executes nothing: the
//! source comes back as an embeddable document for the client to render.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{FailureKind, Result, SandboxError};
use crate::sandbox::io::split_lines;
use crate::sandbox::result::{Artifact, ArtifactKind, ExecutionFailure};
use crate::sandbox::rewrite::rewrite_show_calls;
use crate::sandbox::runtime::{Invocation, IsolationRuntime, Lifecycle};
use crate::sandbox::workspace::{Workspace, GUEST_WORKSPACE};

/// Name of the rewritten script inside the workspace.
pub const SCRIPT_NAME: &str = "main.py";

/// What a backend guarantees about where the code runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// Executed inside the named isolation runtime.
    Sandboxed { runtime: String },
    /// Not executed at all; no isolation is provided or claimed.
    None,
}

/// Output of one Python run, before artifacts are collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonRun {
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub exit_code: i64,
    /// Show calls rewritten into figure files.
    pub figure_count: usize,
    /// Set when the code wrote to stderr or exited non-zero.
    pub failure: Option<ExecutionFailure>,
}

/// Runs Python through an isolation runtime.
#[derive(Clone)]
pub struct PythonBackend {
    runtime: Arc<dyn IsolationRuntime>,
}

impl PythonBackend {
    pub fn new(runtime: Arc<dyn IsolationRuntime>) -> Self {
        Self { runtime }
    }

    pub fn isolation(&self) -> Isolation {
        Isolation::Sandboxed {
            runtime: self.runtime.name().to_string(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn IsolationRuntime> {
        &self.runtime
    }

    /// Rewrite `code`, place it in `workspace` and run it.
    ///
    /// `Err` is reserved for the environment failing (launch failure,
    /// timeout); problems in the code itself come back in
    /// [`PythonRun::failure`].
    pub async fn run(
        &self,
        code: &str,
        workspace: &Workspace,
        timeout: Duration,
        lifecycle: Lifecycle,
    ) -> Result<PythonRun> {
        let rewritten = rewrite_show_calls(code, GUEST_WORKSPACE);
        debug!(
            workspace = %workspace.id(),
            figures = rewritten.figure_count,
            "rewrote show calls"
        );
        workspace
            .write_file(SCRIPT_NAME, rewritten.code.as_bytes())
            .await?;

        let raw = self
            .runtime
            .run_python(Invocation {
                workspace: workspace.path().to_path_buf(),
                script: SCRIPT_NAME.to_string(),
                timeout,
                lifecycle,
            })
            .await?;

        let failure = classify_output(&raw.stderr, raw.exit_code);
        Ok(PythonRun {
            stdout_lines: split_lines(&raw.stdout),
            stderr_lines: split_lines(&raw.stderr),
            exit_code: raw.exit_code,
            figure_count: rewritten.figure_count,
            failure,
        })
    }
}

/// Any stderr output marks the run as failed, even with exit status 0. A
/// non-zero exit with a clean stderr is a failure as well.
pub fn classify_output(stderr: &str, exit_code: i64) -> Option<ExecutionFailure> {
    if !stderr.trim().is_empty() {
        let message = match SandboxError::from_python_stderr(stderr) {
            Some(SandboxError::PythonException {
                exception_type,
                message,
                ..
            }) if message.is_empty() => exception_type,
            Some(SandboxError::PythonException {
                exception_type,
                message,
                ..
            }) => format!("{exception_type}: {message}"),
            _ => stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or_default()
                .trim()
                .to_string(),
        };
        return Some(ExecutionFailure::new(FailureKind::Runtime, message));
    }

    if exit_code != 0 {
        return Some(ExecutionFailure::new(
            FailureKind::Runtime,
            format!("process exited with status {exit_code}"),
        ));
    }

    None
}

/// Passes JavaScript/HTML through as a document artifact.
///
/// This is not a sandbox: nothing is evaluated server-side, no workspace is
/// created and no isolation is claimed. Whatever renders the document is
/// responsible for containing it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentBackend;

impl DocumentBackend {
    pub fn isolation(&self) -> Isolation {
        Isolation::None
    }

    /// Pure transform: `code` becomes a single document artifact.
    pub fn run(&self, code: &str) -> Vec<Artifact> {
        vec![Artifact {
            kind: ArtifactKind::Document,
            encoded_data: code.to_string(),
            order: 1,
        }]
    }
}
