//! Harvesting generated images from a workspace.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::error::Result;
use crate::sandbox::result::{Artifact, ArtifactKind};
use crate::sandbox::rewrite::parse_figure_index;

/// Collect every PNG in the top level of `dir`.
///
/// Each file is read fully, base64-encoded and deleted. Files named
/// `figure_<n>.png` come first in ascending `n`; any other PNG follows, by
/// name. A file that cannot be read is logged and skipped. Only a failure to
/// list the directory itself is returned as an error.
pub async fn collect_images(dir: &Path) -> Result<Vec<Artifact>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file && is_png(&path) {
            paths.push(path);
        }
    }

    Ok(collect_paths(paths).await)
}

/// Read, encode and delete `paths` in figure order.
pub async fn collect_paths(paths: Vec<PathBuf>) -> Vec<Artifact> {
    let mut artifacts = Vec::with_capacity(paths.len());

    for path in order_image_paths(paths) {
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable artifact");
                continue;
            }
        };

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "failed to delete collected artifact");
        }

        artifacts.push(Artifact {
            kind: ArtifactKind::Image,
            encoded_data: STANDARD.encode(&bytes),
            order: artifacts.len() + 1,
        });
    }

    debug!(count = artifacts.len(), "collected image artifacts");
    artifacts
}

/// Sort image paths by the figure number in their name, independent of the
/// order the filesystem listed them in.
pub fn order_image_paths(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort_by(|a, b| compare_images(a, b));
    paths
}

fn compare_images(a: &Path, b: &Path) -> Ordering {
    let name_a = file_name(a);
    let name_b = file_name(b);
    match (parse_figure_index(name_a), parse_figure_index(name_b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => name_a.cmp(name_b),
    }
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
}

fn is_png(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("png"))
}
