//! # Code Sandbox
//!
//! Runs untrusted, model-generated code in per-request isolated workspaces
//! and returns its output together with any images it produced.
//!
//! A [`SandboxManager`] accepts [`ExecutionRequest`]s and turns each one into
//! exactly one [`ExecutionResult`]; it never returns an error to the caller.
//!
//! - **Python** is executed in an isolation runtime: a throwaway Docker
//!   container, or RustPython compiled to WebAssembly. `plt.show()` calls are
//!   rewritten into numbered `savefig` calls so plots become PNG artifacts,
//!   returned base64-encoded in call order.
//! - **JavaScript/HTML** is not executed. The source is returned as a
//!   document artifact for the client to render, and no isolation is claimed.
//!
//! Each Python request gets its own workspace directory, removed before
//! `execute` returns on every path, including timeouts. Concurrency is capped
//! by a FIFO semaphore.
//!
//! ## Example
//!
//! ```rust,ignore
//! use code_sandbox::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = SandboxConfig::builder()
//!         .docker_image("python:3.12-slim")
//!         .timeout(Duration::from_secs(10))
//!         .max_concurrency(4)
//!         .build();
//!
//!     let manager = SandboxManager::new(config)?;
//!     let request = ExecutionRequest::new(Language::Python, "print('x')", "user-1");
//!     let result = manager.execute(request).await;
//!
//!     assert_eq!(result.stdout_lines, vec!["x"]);
//!     assert!(result.is_success());
//!     Ok(())
//! }
//! ```
//!
//! ## Failure kinds
//!
//! Failed results carry a [`FailureKind`]: `Validation` (nothing ran),
//! `Runtime` (the code wrote to stderr or exited non-zero), `Infrastructure`
//! (the runtime could not run the code; retry after backoff) and `Timeout`.

pub mod error;
pub mod prelude;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use error::{FailureKind, Result, SandboxError};
pub use sandbox::backend::{DocumentBackend, Isolation, PythonBackend};
pub use sandbox::config::{DockerConfig, RuntimeConfig, SandboxConfig, SandboxConfigBuilder, WasmConfig};
pub use sandbox::manager::SandboxManager;
pub use sandbox::request::{ExecutionRequest, Language, RequestId};
pub use sandbox::result::{Artifact, ArtifactKind, ExecutionFailure, ExecutionResult};
pub use sandbox::runtime::{DockerRuntime, Invocation, IsolationRuntime, Lifecycle, RawOutput, WasmRuntime};
pub use sandbox::workspace::{Workspace, GUEST_WORKSPACE};
