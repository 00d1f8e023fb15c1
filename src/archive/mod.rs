//! The narrow archive capability set.
//!
//! The history core only ever asks an archive to get a file, put a file, or
//! make a directory; every implementation — local directory, object store,
//! or the in-memory test double — is interchangeable behind [`Archive`].
//! Each operation is a potentially slow, fallible unit of work.
//!
//! # Layout
//!
//! The on-archive layout is stable; the verifier depends on it:
//!
//! ```text
//! history/11/22/33/history-11223344.json.gz
//! ledger/11/22/33/ledger-11223344.xdr.gz
//! transactions/11/22/33/transactions-11223344.xdr.gz
//! bucket/aa/bb/cc/bucket-<64-hex>.xdr.gz
//! .well-known/history.json
//! ```
//!
//! The three directory components are the leading hex bytes of the
//! checkpoint id (or bucket hash), keeping directory fan-out bounded.

pub mod local;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::hash::Hash256;
use crate::history::HistoryArchiveState;
use crate::tmp::ScratchDir;

/// Path of the archive's most-recent state, outside the checkpoint tree.
pub const ROOT_STATE_PATH: &str = ".well-known/history.json";

/// Checkpoint-addressed file categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileCategory {
    History,
    Ledger,
    Transactions,
}

impl FileCategory {
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::History => "history",
            Self::Ledger => "ledger",
            Self::Transactions => "transactions",
        }
    }

    #[must_use]
    fn extension(self) -> &'static str {
        match self {
            Self::History => "json",
            Self::Ledger | Self::Transactions => "xdr",
        }
    }
}

/// Remote path of a checkpoint-addressed file.
#[must_use]
pub fn checkpoint_path(category: FileCategory, checkpoint: u32) -> String {
    let hex = format!("{checkpoint:08x}");
    format!(
        "{prefix}/{a}/{b}/{c}/{prefix}-{hex}.{ext}.gz",
        prefix = category.prefix(),
        a = &hex[0..2],
        b = &hex[2..4],
        c = &hex[4..6],
        ext = category.extension(),
    )
}

/// Remote path of a content-addressed bucket file.
#[must_use]
pub fn bucket_path(hash: &Hash256) -> String {
    let hex = hash.to_hex();
    format!(
        "bucket/{a}/{b}/{c}/bucket-{hex}.xdr.gz",
        a = &hex[0..2],
        b = &hex[2..4],
        c = &hex[4..6],
    )
}

/// Directory component of a remote path.
#[must_use]
pub fn remote_dir(remote: &str) -> &str {
    remote.rsplit_once('/').map_or("", |(dir, _)| dir)
}

#[derive(Debug, Error, Diagnostic)]
pub enum ArchiveError {
    /// The archive cannot be reached at all.
    #[error("archive {name} unavailable: {message}")]
    #[diagnostic(
        code(chronicle::archive::unavailable),
        help("Check archive configuration and connectivity for `{name}`.")
    )]
    Unavailable { name: String, message: String },

    /// A requested file does not exist on the archive.
    #[error("{path} is not on the archive")]
    #[diagnostic(code(chronicle::archive::not_found))]
    NotFound { path: String },

    /// A file exists but its content is unusable.
    #[error("corrupted archive file {path}: {message}")]
    #[diagnostic(code(chronicle::archive::corrupted))]
    Corrupted { path: String, message: String },

    /// Transfer-level failure; worth one retry.
    #[error("archive i/o: {message}")]
    #[diagnostic(code(chronicle::archive::io))]
    Io { message: String },

    #[error("archive {name} is read-only")]
    #[diagnostic(code(chronicle::archive::read_only))]
    ReadOnly { name: String },
}

impl ArchiveError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, ArchiveError::Io { .. })
    }
}

/// What the history core requires of any archive backend.
#[async_trait]
pub trait Archive: Send + Sync {
    fn name(&self) -> &str;

    fn is_writable(&self) -> bool;

    /// Download `remote` into the local path.
    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), ArchiveError>;

    /// Upload the local path to `remote`.
    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), ArchiveError>;

    /// Ensure a remote directory exists.
    async fn mkdir(&self, remote: &str) -> Result<(), ArchiveError>;
}

/// True when at least one archive accepts uploads.
#[must_use]
pub fn has_any_writable(archives: &[Arc<dyn Archive>]) -> bool {
    archives.iter().any(|a| a.is_writable())
}

/// Seed a fresh archive with its root state.
pub async fn initialize_archive(
    archive: &dyn Archive,
    state: &HistoryArchiveState,
    scratch: &ScratchDir,
) -> Result<(), ArchiveError> {
    let local = scratch.path().join("root-state.json");
    tokio::fs::write(&local, state.to_json())
        .await
        .map_err(|e| ArchiveError::Io {
            message: e.to_string(),
        })?;
    archive.mkdir(remote_dir(ROOT_STATE_PATH)).await?;
    archive.put_file(&local, ROOT_STATE_PATH).await
}

/// Read an archive's root state: its newest published checkpoint.
pub async fn fetch_root_state(
    archive: &dyn Archive,
    scratch: &ScratchDir,
) -> Result<HistoryArchiveState, ArchiveError> {
    let local = scratch.path().join("root-state.json");
    archive.get_file(ROOT_STATE_PATH, &local).await?;
    let raw = tokio::fs::read_to_string(&local)
        .await
        .map_err(|e| ArchiveError::Io {
            message: e.to_string(),
        })?;
    HistoryArchiveState::from_json(&raw).map_err(|e| ArchiveError::Corrupted {
        path: ROOT_STATE_PATH.to_string(),
        message: e.to_string(),
    })
}
