//! A history archive rooted in a local directory.
//!
//! Useful for single-host deployments and as the reference implementation
//! the fault-injecting test archive mirrors.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{Archive, ArchiveError};

pub struct LocalDirArchive {
    name: String,
    root: PathBuf,
    writable: bool,
}

impl LocalDirArchive {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, writable: bool) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            writable,
        }
    }

    fn resolve(&self, remote: &str) -> PathBuf {
        self.root.join(remote)
    }

    fn io_error(e: std::io::Error) -> ArchiveError {
        ArchiveError::Io {
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl Archive for LocalDirArchive {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), ArchiveError> {
        let source = self.resolve(remote);
        if !tokio::fs::try_exists(&source).await.map_err(Self::io_error)? {
            return Err(ArchiveError::NotFound {
                path: remote.to_string(),
            });
        }
        tokio::fs::copy(&source, local)
            .await
            .map_err(Self::io_error)?;
        Ok(())
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), ArchiveError> {
        if !self.writable {
            return Err(ArchiveError::ReadOnly {
                name: self.name.clone(),
            });
        }
        tokio::fs::copy(local, self.resolve(remote))
            .await
            .map_err(Self::io_error)?;
        Ok(())
    }

    async fn mkdir(&self, remote: &str) -> Result<(), ArchiveError> {
        if !self.writable {
            return Err(ArchiveError::ReadOnly {
                name: self.name.clone(),
            });
        }
        tokio::fs::create_dir_all(self.resolve(remote))
            .await
            .map_err(Self::io_error)?;
        Ok(())
    }
}
