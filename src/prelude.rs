//! Prelude module for convenient imports.

pub use crate::error::{FailureKind, Result, SandboxError};
pub use crate::sandbox::{
    config::SandboxConfig,
    manager::SandboxManager,
    request::{ExecutionRequest, Language},
    result::{Artifact, ArtifactKind, ExecutionResult},
};
