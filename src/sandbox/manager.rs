//! The sandbox manager: validation, dispatch, limits and cleanup.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{FailureKind, Result, SandboxError};
use crate::sandbox::backend::{DocumentBackend, PythonBackend, PythonRun};
use crate::sandbox::collector::collect_images;
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::request::{ExecutionRequest, Language, RequestId};
use crate::sandbox::result::{Artifact, ExecutionFailure, ExecutionResult};
use crate::sandbox::runtime::{self, IsolationRuntime, Lifecycle};
use crate::sandbox::workspace::Workspace;

/// How long past the configured timeout, counted from guest start, the
/// manager waits for a runtime to report its own timeout before abandoning it.
const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

/// Accepts execution requests and turns each into exactly one
/// [`ExecutionResult`].
///
/// Requests are independent: each Python request gets its own workspace and
/// its own timeout. At most `max_concurrency` run at once; the rest wait in
/// FIFO order.
pub struct SandboxManager {
    config: SandboxConfig,
    python: PythonBackend,
    documents: DocumentBackend,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<RequestId>>,
}

impl SandboxManager {
    /// Validate `config` and connect the runtime it names.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        let runtime = runtime::connect(&config.runtime)?;
        Self::with_runtime(config, runtime)
    }

    /// Use an already constructed runtime. The runtime section of `config`
    /// is ignored.
    pub fn with_runtime(config: SandboxConfig, runtime: Arc<dyn IsolationRuntime>) -> Result<Self> {
        config.validate_limits()?;
        info!(
            runtime = runtime.name(),
            max_concurrency = config.max_concurrency,
            timeout = ?config.timeout,
            "sandbox manager ready"
        );
        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            python: PythonBackend::new(runtime),
            documents: DocumentBackend,
            in_flight: Mutex::new(HashSet::new()),
            config,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Ping the isolation runtime.
    pub async fn check_runtime(&self) -> Result<()> {
        self.python.runtime().health_check().await
    }

    /// Number of requests currently being handled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|set| set.len()).unwrap_or(0)
    }

    /// Execute from loosely typed parts, as received from a tool call.
    pub async fn execute_raw(
        &self,
        request_id: impl Into<RequestId>,
        language: &str,
        source_code: &str,
        caller_id: &str,
    ) -> ExecutionResult {
        let request_id = request_id.into();
        match language.parse::<Language>() {
            Ok(language) => {
                let request = ExecutionRequest::new(language, source_code, caller_id).with_id(request_id);
                self.execute(request).await
            }
            Err(e) => ExecutionResult::failure(request_id, (&e).into()),
        }
    }

    /// Execute one request. Never fails: every error becomes a result with
    /// `error_kind` set, and any workspace is gone by the time this returns.
    #[tracing::instrument(
        skip(self, request),
        fields(request_id = %request.request_id, language = %request.language)
    )]
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let request_id = request.request_id.clone();

        if let Err(e) = request.validate() {
            debug!(error = %e, "rejected request");
            return ExecutionResult::failure(request_id, (&e).into());
        }

        let _claim = match InFlightClaim::acquire(&self.in_flight, &request_id) {
            Ok(claim) => claim,
            Err(e) => return ExecutionResult::failure(request_id, (&e).into()),
        };

        match request.language {
            Language::JavaScript => {
                let artifacts = self.documents.run(&request.source_code);
                ExecutionResult::success(request_id, Vec::new(), Vec::new(), artifacts)
            }
            Language::Python => self.execute_python(request).await,
        }
    }

    async fn execute_python(&self, request: ExecutionRequest) -> ExecutionResult {
        let request_id = request.request_id;

        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                let failure = ExecutionFailure::new(
                    FailureKind::Infrastructure,
                    "sandbox manager is shutting down",
                );
                return ExecutionResult::failure(request_id, failure);
            }
        };

        let workspace = match Workspace::create(&self.config.workspace_root, &request.caller_id) {
            Ok(workspace) => workspace,
            Err(e) => {
                warn!(error = %e, "could not create workspace");
                return ExecutionResult::failure(request_id, (&e).into());
            }
        };

        let timeout = self.config.timeout;
        let lifecycle = Lifecycle::default();
        let run = self
            .run_bounded(&request.source_code, &workspace, lifecycle.clone())
            .await;
        // Container removal or a guest thread may still be winding down
        // after the run future was dropped; none of it may outlive the request.
        lifecycle.finish_cleanup().await;

        let result = match run {
            Ok(run) => {
                // Figures saved before a runtime error are still reported.
                let artifacts = match collect_images(workspace.path()).await {
                    Ok(artifacts) => artifacts,
                    Err(e) => {
                        warn!(workspace = %workspace.id(), error = %e, "artifact collection failed");
                        Vec::new()
                    }
                };
                if artifacts.len() < run.figure_count {
                    debug!(
                        expected = run.figure_count,
                        collected = artifacts.len(),
                        "fewer figures than show calls"
                    );
                }
                assemble(request_id, run, artifacts)
            }
            Err(e) => {
                match e.kind() {
                    FailureKind::Timeout => warn!(timeout = ?timeout, "execution timed out"),
                    _ => warn!(error = %e, "execution environment failed"),
                }
                ExecutionResult::failure(request_id, (&e).into())
            }
        };

        workspace.teardown();
        result
    }

    /// Run Python under two clocks: `launch_timeout` until the runtime
    /// reports the guest started, then `timeout` plus a grace period. An
    /// abandoned run future is dropped here, which is what hands its cleanup
    /// to `lifecycle`.
    async fn run_bounded(
        &self,
        code: &str,
        workspace: &Workspace,
        lifecycle: Lifecycle,
    ) -> Result<PythonRun> {
        let timeout = self.config.timeout;
        let launch_timeout = self.config.launch_timeout;
        let mut run = Box::pin(self.python.run(code, workspace, timeout, lifecycle.clone()));

        let launched = tokio::select! {
            biased;
            finished = &mut run => return finished,
            started = tokio::time::timeout(launch_timeout, lifecycle.started()) => started,
        };
        if launched.is_err() {
            return Err(SandboxError::ExecutionFailed(format!(
                "runtime did not start the guest within {launch_timeout:?}"
            )));
        }
        debug!("guest started");

        let finished = tokio::time::timeout(timeout + TIMEOUT_GRACE, &mut run).await;
        finished.unwrap_or(Err(SandboxError::Timeout(timeout)))
    }
}

fn assemble(
    request_id: RequestId,
    run: PythonRun,
    artifacts: Vec<Artifact>,
) -> ExecutionResult {
    match run.failure {
        None => ExecutionResult::success(request_id, run.stdout_lines, run.stderr_lines, artifacts),
        Some(failure) => ExecutionResult::failure(request_id, failure)
            .with_output(run.stdout_lines, run.stderr_lines)
            .with_artifacts(artifacts),
    }
}

/// Marks a request id as in flight until dropped.
struct InFlightClaim<'a> {
    set: &'a Mutex<HashSet<RequestId>>,
    id: RequestId,
}

impl<'a> InFlightClaim<'a> {
    fn acquire(set: &'a Mutex<HashSet<RequestId>>, id: &RequestId) -> Result<Self> {
        let mut guard = set
            .lock()
            .map_err(|_| SandboxError::ExecutionFailed("in-flight registry poisoned".to_string()))?;
        if !guard.insert(id.clone()) {
            return Err(SandboxError::Validation(format!(
                "request id {id} is already in flight"
            )));
        }
        Ok(Self { set, id: id.clone() })
    }
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.set.lock() {
            guard.remove(&self.id);
        }
    }
}
