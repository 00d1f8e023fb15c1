//! The publish pipeline: one checkpoint from snapshot to archive.
//!
//! Exactly one [`PublishWork`] is in flight per node; the application only
//! schedules the next queued entry once the previous one reached a terminal
//! state. Each crank advances one phase:
//!
//! ```text
//! ResolveFutures ── join merge handles so bucket bytes exist
//! WriteFiles     ── stage HAS + headers + transactions + new buckets, gzipped
//! Upload         ── per archive, mkdir + put every staged file
//! ```
//!
//! Success removes the durable row and releases bucket pins; failure leaves
//! the row intact, bumps the failure meter, and halts auto-scheduling until
//! an operator intervenes.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::PublishError;
use crate::app::AppContext;
use crate::archive::{
    bucket_path, checkpoint_path, remote_dir, FileCategory, ROOT_STATE_PATH,
};
use crate::buckets::BucketError;
use crate::history::{
    encode_header_file, encode_state_file, encode_tx_file, gzip_bytes, HistoryArchiveState,
};
use crate::status::StatusCategory;
use crate::tmp::ScratchDir;
use crate::work::{retry_once, Work, WorkError, WorkStep};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PublishPhase {
    ResolveFutures,
    WriteFiles,
    Upload,
}

struct StagedFile {
    local: PathBuf,
    remote: String,
}

/// Publishes one queued checkpoint.
pub struct PublishWork {
    ledger: u32,
    state: HistoryArchiveState,
    phase: PublishPhase,
    scratch: Option<ScratchDir>,
    staged: Vec<StagedFile>,
}

impl PublishWork {
    #[must_use]
    pub fn new(ledger: u32, state: HistoryArchiveState) -> Self {
        Self {
            ledger,
            state,
            phase: PublishPhase::ResolveFutures,
            scratch: None,
            staged: Vec::new(),
        }
    }

    async fn resolve_futures(&mut self, ctx: &AppContext) -> Result<PublishPhase, WorkError> {
        let mut buckets = ctx.buckets.lock().await;
        buckets.resolve_futures().await?;
        // Every bucket the queued state references must now have content.
        let referenced = self.state.bucket_hashes();
        let missing = buckets.store.missing_of(referenced.iter());
        if let Some(hash) = missing.first() {
            return Err(BucketError::Missing { hash: *hash }.into());
        }
        Ok(PublishPhase::WriteFiles)
    }

    #[instrument(skip(self, ctx), fields(ledger = self.ledger))]
    async fn write_files(&mut self, ctx: &AppContext) -> Result<PublishPhase, WorkError> {
        let scratch = ctx.tmp.scratch_dir("publish-")?;
        let first = ctx.frequency.first_ledger_in_checkpoint(self.ledger);

        let lm = ctx.ledger.lock().await;
        let mut headers = Vec::with_capacity((self.ledger - first + 1) as usize);
        let mut entries = Vec::with_capacity(headers.capacity());
        for seq in first..=self.ledger {
            headers.push(
                lm.header(seq)
                    .cloned()
                    .ok_or(PublishError::MissingHistory { ledger: seq })?,
            );
            entries.push(
                lm.close_data(seq)
                    .cloned()
                    .ok_or(PublishError::MissingHistory { ledger: seq })?,
            );
        }
        drop(lm);

        let mut staged = Vec::new();
        let mut stage = |name: &str, remote: String, bytes: Vec<u8>| {
            let local = scratch.path().join(name);
            staged.push((local, remote, bytes));
        };
        stage(
            "state.json.gz",
            checkpoint_path(FileCategory::History, self.ledger),
            encode_state_file(&self.state)?,
        );
        stage(
            "headers.xdr.gz",
            checkpoint_path(FileCategory::Ledger, self.ledger),
            encode_header_file(&headers)?,
        );
        stage(
            "transactions.xdr.gz",
            checkpoint_path(FileCategory::Transactions, self.ledger),
            encode_tx_file(&entries)?,
        );

        // Buckets not referenced by the previously published state are new
        // to the archive.
        let history = ctx.history.lock().await;
        let previous = history
            .last_published()
            .map(HistoryArchiveState::bucket_hashes)
            .unwrap_or_default();
        drop(history);
        let buckets = ctx.buckets.lock().await;
        for (i, hash) in self
            .state
            .bucket_hashes()
            .into_iter()
            .filter(|h| !previous.contains(h))
            .enumerate()
        {
            let bucket = buckets
                .store
                .get(&hash)
                .ok_or(BucketError::Missing { hash })?;
            stage(
                &format!("bucket-{i}.xdr.gz"),
                bucket_path(&hash),
                gzip_bytes(&bucket.bytes)?,
            );
        }
        drop(buckets);

        // The root state advertises this checkpoint as the archive tip.
        stage(
            "root-state.json",
            ROOT_STATE_PATH.to_string(),
            self.state.to_json().into_bytes(),
        );

        for (local, remote, bytes) in staged {
            tokio::fs::write(&local, &bytes)
                .await
                .map_err(|e| WorkError::Transient {
                    action: "stage publish files",
                    message: e.to_string(),
                })?;
            self.staged.push(StagedFile { local, remote });
        }
        self.scratch = Some(scratch);
        Ok(PublishPhase::Upload)
    }

    #[instrument(skip(self, ctx), fields(ledger = self.ledger))]
    async fn upload(&mut self, ctx: &AppContext) -> Result<(), WorkError> {
        for archive in ctx.archives.iter().filter(|a| a.is_writable()) {
            for file in &self.staged {
                retry_once("archive mkdir", || async {
                    archive
                        .mkdir(remote_dir(&file.remote))
                        .await
                        .map_err(WorkError::from)
                })
                .await?;
                retry_once("archive put", || async {
                    archive
                        .put_file(&file.local, &file.remote)
                        .await
                        .map_err(WorkError::from)
                })
                .await?;
            }
            info!(
                ledger = self.ledger,
                archive = archive.name(),
                files = self.staged.len(),
                "checkpoint uploaded"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Work for PublishWork {
    fn name(&self) -> &str {
        "publish"
    }

    async fn on_run(&mut self, ctx: &AppContext) -> Result<WorkStep, WorkError> {
        let result = match self.phase {
            PublishPhase::ResolveFutures => self.resolve_futures(ctx).await.map(Some),
            PublishPhase::WriteFiles => self.write_files(ctx).await.map(Some),
            PublishPhase::Upload => self.upload(ctx).await.map(|()| None),
        };
        match result {
            Ok(Some(next)) => {
                self.phase = next;
                Ok(WorkStep::Running)
            }
            Ok(None) => {
                ctx.metrics.publish.mark_success();
                ctx.status.set_status(
                    StatusCategory::HistoryPublish,
                    format!("published checkpoint {}", self.ledger),
                );
                let mut history = ctx.history.lock().await;
                history
                    .history_published(self.ledger, &self.state, true)
                    .await?;
                Ok(WorkStep::Complete)
            }
            Err(e) => {
                warn!(ledger = self.ledger, error = %e, "publish failed");
                ctx.metrics.publish.mark_failure();
                ctx.status.set_status(
                    StatusCategory::HistoryPublish,
                    format!("publish of checkpoint {} failed: {e}", self.ledger),
                );
                let mut history = ctx.history.lock().await;
                if let Err(inner) = history
                    .history_published(self.ledger, &self.state, false)
                    .await
                {
                    warn!(error = %inner, "failure bookkeeping also failed");
                }
                Err(e)
            }
        }
    }

    fn on_reset(&mut self) {
        self.phase = PublishPhase::ResolveFutures;
        self.scratch = None;
        self.staged.clear();
    }

    async fn on_abort(&mut self) -> bool {
        // Staged files die with the scratch dir; the durable row survives.
        self.scratch = None;
        self.staged.clear();
        true
    }
}
