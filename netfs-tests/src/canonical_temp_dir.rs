use std::path::{Path, PathBuf};

use anyhow::Context;
use tempfile::TempDir;

/// A temporary directory with a canonicalized path, since `mount` output reports
/// canonical paths and a raw `/tmp/...` path may actually be a symlink into them.
pub(crate) struct CanonicalTempDir {
    _temp_dir: TempDir,
    path: PathBuf,
}

impl CanonicalTempDir {
    pub(crate) fn new() -> anyhow::Result<Self> {
        let temp_dir = TempDir::new().context("failed to create temporary directory")?;
        let path = temp_dir
            .path()
            .canonicalize()
            .context("failed to canonicalize temporary directory path")?;
        Ok(Self { _temp_dir: temp_dir, path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}
