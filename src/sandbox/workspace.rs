//! Per-request workspaces.
//!
//! A [`Workspace`] is an exclusively owned directory holding the source file
//! and whatever the executed code writes. It is removed when the value is torn
//! down or dropped, so no exit path (error, timeout, cancelled future) can leave
//! it behind.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SandboxError};

/// Where the workspace is visible inside the isolation runtime.
pub const GUEST_WORKSPACE: &str = "/workspace";

const MAX_CALLER_PREFIX: usize = 32;

/// An ephemeral directory scoped to one execution request.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh workspace below `root`.
    ///
    /// The identifier is a sanitized caller prefix followed by a random UUID,
    /// so caller-controlled text can neither collide with nor escape `root`.
    pub fn create(root: &Path, caller_id: &str) -> Result<Self> {
        let id = workspace_id(caller_id);
        std::fs::create_dir_all(root).map_err(|e| {
            SandboxError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to create workspace root {}: {}", root.display(), e),
            ))
        })?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("{id}-"))
            .tempdir_in(root)
            .map_err(|e| {
                SandboxError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to create workspace {id}: {e}"),
                ))
            })?;

        debug!(workspace = %id, path = %dir.path().display(), "workspace created");
        Ok(Self { id, dir })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host path of the workspace directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file into the workspace and return its host path.
    pub async fn write_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        if name.contains(['/', '\\']) || name == ".." || name == "." {
            return Err(SandboxError::Validation(format!("invalid workspace file name {name:?}")));
        }
        let path = self.dir.path().join(name);
        tokio::fs::write(&path, contents).await.map_err(|e| {
            SandboxError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to write {}: {}", path.display(), e),
            ))
        })?;
        Ok(path)
    }

    /// Remove the workspace. Failures are logged, never returned, so they
    /// cannot mask the outcome of the execution itself.
    pub fn teardown(self) {
        let id = self.id;
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!(workspace = %id, "workspace removed"),
            Err(e) => warn!(workspace = %id, path = %path.display(), error = %e, "failed to remove workspace"),
        }
    }
}

fn workspace_id(caller_id: &str) -> String {
    let prefix: String = caller_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_CALLER_PREFIX)
        .collect();
    let prefix = if prefix.is_empty() { "anon".to_string() } else { prefix };
    format!("{prefix}-{}", Uuid::new_v4().simple())
}
