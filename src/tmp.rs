//! Scope-bound scratch directories.
//!
//! Every pipeline that stages files on disk (publish writes, catchup
//! downloads) borrows a scratch directory from the [`TmpDirManager`]. Each
//! directory lives inside one manager-owned root and is removed when the
//! owning handle drops, so an aborted Work never leaks staged files.

use std::path::Path;

use miette::Diagnostic;
use tempfile::TempDir;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[error("cannot create scratch directory: {0}")]
#[diagnostic(
    code(chronicle::tmp::create),
    help("Check free space and permissions for the system temp directory.")
)]
pub struct TmpDirError(#[from] std::io::Error);

/// Owns the root under which all scratch directories are created.
pub struct TmpDirManager {
    root: TempDir,
}

impl TmpDirManager {
    pub fn new() -> Result<Self, TmpDirError> {
        Ok(Self {
            root: tempfile::Builder::new().prefix("chronicle-").tempdir()?,
        })
    }

    /// A fresh directory scoped to the returned handle's lifetime.
    pub fn scratch_dir(&self, prefix: &str) -> Result<ScratchDir, TmpDirError> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(self.root.path())?;
        Ok(ScratchDir { dir })
    }
}

/// One scratch directory; removed on drop.
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}
