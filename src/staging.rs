//! Ephemeral staging directory

use std::path::{Path, PathBuf};
use uuid::Uuid;

const STAGING_PREFIX: &str = "ModelExport_ModelData_";

/// Directory holding raw downloaded parts of one run
///
/// Removed when dropped, whatever the outcome of the run. Removal failures are
/// logged, never propagated.
#[derive(Debug)]
pub struct StagingArea {
    path: PathBuf,
}

impl StagingArea {
    /// Create a fresh directory under `root`, or under the OS temp dir
    pub fn create(root: Option<&Path>) -> std::io::Result<Self> {
        let root = root
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let path = root.join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4().simple()));
        std::fs::create_dir_all(&path)?;

        tracing::debug!(path = %path.display(), "Created staging area");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if !self.path.exists() {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed staging area"),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove staging area"
            ),
        }
    }
}
