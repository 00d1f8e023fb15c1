//! Catchup: download, verify, and apply archived checkpoints.
//!
//! A [`CatchupWork`] drives one catchup run as a sequence of bounded steps:
//! resolve the target against the archive, fetch the trust-anchor state,
//! verify the header chain newest-to-oldest, optionally install a bucket
//! snapshot, then replay transactions up to the target. Verification is
//! monotonic over checkpoints and replay is monotonic over ledgers; any
//! failure is terminal for the run and leaves the local ledger untouched
//! apart from already-applied replay progress.

pub mod planner;
pub mod verify;

pub use planner::{CatchupPlan, PlanError};

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::app::AppContext;
use crate::archive::{
    bucket_path, checkpoint_path, fetch_root_state, ArchiveError, FileCategory,
};
use crate::buckets::{Bucket, BucketError};
use crate::hash::Hash256;
use crate::history::{
    decode_header_file, decode_state_file, decode_tx_file, gunzip_bytes, HistoryArchiveState,
};
use crate::ledger::{LedgerHeaderHistoryEntry, LedgerState};
use crate::status::StatusCategory;
use crate::tmp::ScratchDir;
use crate::work::{retry_once, Work, WorkError, WorkStep};
use async_trait::async_trait;
use verify::{
    verify_checkpoint_headers, verify_checkpoint_seam, verify_local_anchor, VerifyError,
};

/// Whether the node keeps serving while catching up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatchupMode {
    /// Standalone catchup; the node ends synced at the target.
    Offline,
    /// Catchup under live traffic; buffered ledgers knit up afterwards.
    Online,
}

/// What to catch up to and how much history to replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CatchupConfiguration {
    pub to_ledger: u32,
    /// Minimum number of recent ledgers to replay; `None` replays the whole
    /// gap (`CATCHUP_COMPLETE`).
    pub recent: Option<u32>,
    pub mode: CatchupMode,
}

#[derive(Debug, Error, Diagnostic)]
pub enum CatchupError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Plan(#[from] PlanError),

    #[error("no archives configured; catchup has nothing to read from")]
    #[diagnostic(code(chronicle::catchup::no_archives))]
    NoArchives,

    #[error("no verified header retained for ledger {ledger_seq}")]
    #[diagnostic(code(chronicle::catchup::missing_verified_header))]
    MissingVerifiedHeader { ledger_seq: u32 },

    #[error("bucket snapshot at checkpoint {checkpoint} does not match its verified header")]
    #[diagnostic(code(chronicle::catchup::bucket_list_mismatch))]
    BucketListMismatch { checkpoint: u32 },

    #[error("replayed ledger {ledger_seq} does not chain onto the local ledger")]
    #[diagnostic(code(chronicle::catchup::replay_chain))]
    ReplayChainMismatch { ledger_seq: u32 },
}

#[derive(Clone, Copy, Debug)]
enum CatchupPhase {
    ResolveTarget,
    FetchAnchor,
    /// Next checkpoint boundary to verify, walking downward.
    VerifyHeaders { next: u32 },
    FetchBuckets,
    ApplyBuckets,
    /// Next checkpoint boundary to replay, walking upward.
    Replay { next: u32 },
    Finalize,
}

/// One catchup run, crankable one bounded step at a time.
pub struct CatchupWork {
    config: CatchupConfiguration,
    revert_state: LedgerState,
    phase: CatchupPhase,
    scratch: Option<ScratchDir>,
    plan: Option<CatchupPlan>,
    anchor_state: Option<HistoryArchiveState>,
    bucket_state: Option<HistoryArchiveState>,
    /// Verified headers per checkpoint boundary.
    verified: FxHashMap<u32, Vec<LedgerHeaderHistoryEntry>>,
    initial_lcl: Option<(u32, Hash256)>,
}

impl CatchupWork {
    #[must_use]
    pub fn new(config: CatchupConfiguration, revert_state: LedgerState) -> Self {
        Self {
            config,
            revert_state,
            phase: CatchupPhase::ResolveTarget,
            scratch: None,
            plan: None,
            anchor_state: None,
            bucket_state: None,
            verified: FxHashMap::default(),
            initial_lcl: None,
        }
    }

    fn plan(&self) -> &CatchupPlan {
        self.plan.as_ref().expect("phase order fixes the plan first")
    }

    fn verified_header(&self, ledger_seq: u32, ctx: &AppContext) -> Option<&LedgerHeaderHistoryEntry> {
        let checkpoint = ctx.frequency.checkpoint_containing(ledger_seq);
        self.verified
            .get(&checkpoint)?
            .iter()
            .find(|h| h.ledger_seq == ledger_seq)
    }

    /// Fetch a remote file through the first archive that can serve it.
    async fn fetch_bytes(&self, ctx: &AppContext, remote: &str) -> Result<Vec<u8>, WorkError> {
        let scratch = self.scratch.as_ref().expect("scratch exists once resolved");
        let local = scratch.path().join(remote.replace('/', "_"));
        let mut last: Option<ArchiveError> = None;
        for archive in ctx.archives.iter() {
            let got = retry_once("archive get", || async {
                archive
                    .get_file(remote, &local)
                    .await
                    .map_err(WorkError::from)
            })
            .await;
            match got {
                Ok(()) => {
                    return tokio::fs::read(&local).await.map_err(|e| {
                        WorkError::from(ArchiveError::Io {
                            message: e.to_string(),
                        })
                    });
                }
                Err(WorkError::Archive(e)) => last = Some(e),
                Err(other) => return Err(other),
            }
        }
        Err(last.map_or(WorkError::from(CatchupError::NoArchives), WorkError::from))
    }

    async fn resolve_target(&mut self, ctx: &AppContext) -> Result<CatchupPhase, WorkError> {
        if ctx.archives.is_empty() {
            return Err(CatchupError::NoArchives.into());
        }
        self.scratch = Some(ctx.tmp.scratch_dir("catchup-")?);
        let scratch = self.scratch.as_ref().expect("just created");

        let mut root = None;
        for archive in ctx.archives.iter() {
            match fetch_root_state(archive.as_ref(), scratch).await {
                Ok(state) => {
                    root = Some(state);
                    break;
                }
                Err(e) => warn!(archive = archive.name(), error = %e, "root state unavailable"),
            }
        }
        let root = root.ok_or(WorkError::from(ArchiveError::NotFound {
            path: crate::archive::ROOT_STATE_PATH.to_string(),
        }))?;

        let lm = ctx.ledger.lock().await;
        let lcl = lm.last_closed().clone();
        drop(lm);
        self.initial_lcl = Some((lcl.ledger_seq, lcl.hash));

        // Cap the target so the checkpoint containing it is fully published.
        let mut config = self.config;
        if ctx.frequency.checkpoint_containing(config.to_ledger) > root.current_ledger {
            warn!(
                requested = config.to_ledger,
                available = root.current_ledger,
                "target checkpoint not yet published; capping"
            );
            config.to_ledger = root.current_ledger;
        }
        let plan = CatchupPlan::plan(lcl.ledger_seq, &config, ctx.frequency)
            .map_err(CatchupError::from)?;
        ctx.status.set_status(
            StatusCategory::HistoryCatchup,
            format!(
                "catching up to {}: verify {} checkpoint(s), replay [{}, {}]",
                plan.apply_last,
                plan.verify_range.count(),
                plan.apply_first,
                plan.apply_last
            ),
        );
        info!(
            lcl = lcl.ledger_seq,
            target = plan.apply_last,
            buckets = plan.apply_buckets,
            "catchup planned"
        );
        self.plan = Some(plan);
        Ok(CatchupPhase::FetchAnchor)
    }

    async fn fetch_anchor(&mut self, ctx: &AppContext) -> Result<CatchupPhase, WorkError> {
        let target_checkpoint = self.plan().verify_range.last();
        let remote = checkpoint_path(FileCategory::History, target_checkpoint);
        let state = match self.fetch_bytes(ctx, &remote).await {
            Ok(bytes) => decode_state_file(&bytes).inspect_err(|_| {
                ctx.metrics.download_has.mark_failure();
            })?,
            Err(e) => {
                ctx.metrics.download_has.mark_failure();
                return Err(e);
            }
        };
        ctx.metrics.download_has.mark_success();
        self.anchor_state = Some(state);
        Ok(CatchupPhase::VerifyHeaders {
            next: target_checkpoint,
        })
    }

    #[instrument(skip(self, ctx))]
    async fn verify_one_checkpoint(
        &mut self,
        ctx: &AppContext,
        checkpoint: u32,
    ) -> Result<CatchupPhase, WorkError> {
        let plan = self.plan().clone();
        let remote = checkpoint_path(FileCategory::Ledger, checkpoint);
        let headers = match self.fetch_bytes(ctx, &remote).await {
            Ok(bytes) => match decode_header_file(&bytes) {
                Ok(headers) => headers,
                Err(e) => {
                    ctx.metrics.download_ledger.mark_failure();
                    ctx.metrics.verify_ledger_chain.mark_failure();
                    return Err(e.into());
                }
            },
            Err(e) => {
                ctx.metrics.download_ledger.mark_failure();
                return Err(e);
            }
        };
        ctx.metrics
            .download_ledger
            .add_success(headers.len() as u64);

        let max_version = ctx.config.ledger_protocol_version;
        let outcome: Result<(), WorkError> = async {
            verify_checkpoint_headers(&headers, checkpoint, ctx.frequency, max_version)?;
            if checkpoint == plan.verify_range.last() {
                // Top anchor: the boundary header must describe exactly the
                // bucket list the trusted archive state advertises.
                let anchor = self.anchor_state.as_ref().expect("anchor fetched");
                let boundary = headers.last().expect("verified file is non-empty");
                if boundary.bucket_list_hash != anchor.bucket_list_hash() {
                    return Err(VerifyError::BadHash {
                        ledger_seq: boundary.ledger_seq,
                    }
                    .into());
                }
            } else {
                let newer = self
                    .verified
                    .get(&(checkpoint + ctx.frequency.get()))
                    .expect("newer checkpoint verified first");
                verify_checkpoint_seam(
                    headers.last().expect("non-empty"),
                    newer.first().expect("non-empty"),
                )?;
            }
            if checkpoint == plan.verify_range.first() && !plan.apply_buckets {
                // Bottom anchor: the first replayed ledger chains onto the
                // locally trusted LCL.
                let (lcl_seq, lcl_hash) = self.initial_lcl.expect("captured at resolve");
                let entry = headers
                    .iter()
                    .find(|h| h.ledger_seq == lcl_seq + 1)
                    .ok_or(VerifyError::Undershot {
                        checkpoint,
                        last: headers.first().map_or(0, |h| h.ledger_seq),
                        expected: lcl_seq + 1,
                    })?;
                verify_local_anchor(entry, lcl_seq, lcl_hash)?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            ctx.metrics.verify_ledger.mark_failure();
            ctx.metrics.verify_ledger_chain.mark_failure();
            return Err(e);
        }
        ctx.metrics.verify_ledger.add_success(headers.len() as u64);
        ctx.metrics.verify_ledger_chain.mark_success();
        self.verified.insert(checkpoint, headers);

        if checkpoint == plan.verify_range.first() {
            if plan.apply_buckets {
                Ok(CatchupPhase::FetchBuckets)
            } else {
                Ok(CatchupPhase::Replay {
                    next: plan.apply_checkpoints.first(),
                })
            }
        } else {
            Ok(CatchupPhase::VerifyHeaders {
                next: checkpoint - ctx.frequency.get(),
            })
        }
    }

    async fn fetch_buckets(&mut self, ctx: &AppContext) -> Result<CatchupPhase, WorkError> {
        let plan = self.plan().clone();
        let boundary = plan.bucket_apply_at.expect("bucket phase implies anchor");
        let state = if boundary == plan.verify_range.last() {
            self.anchor_state.clone().expect("anchor fetched")
        } else {
            let remote = checkpoint_path(FileCategory::History, boundary);
            let state = match self.fetch_bytes(ctx, &remote).await {
                Ok(bytes) => decode_state_file(&bytes).inspect_err(|_| {
                    ctx.metrics.download_has.mark_failure();
                })?,
                Err(e) => {
                    ctx.metrics.download_has.mark_failure();
                    return Err(e);
                }
            };
            ctx.metrics.download_has.mark_success();
            state
        };

        for hash in state.bucket_hashes() {
            {
                let buckets = ctx.buckets.lock().await;
                if buckets.store.contains(&hash) {
                    continue;
                }
            }
            let remote = bucket_path(&hash);
            let compressed = match self.fetch_bytes(ctx, &remote).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    ctx.metrics.download_bucket.mark_failure();
                    return Err(e);
                }
            };
            let bytes = gunzip_bytes(&compressed).inspect_err(|_| {
                ctx.metrics.download_bucket.mark_failure();
            })?;
            let bucket = Bucket::from_bytes(bytes);
            if bucket.hash != hash {
                ctx.metrics.download_bucket.mark_failure();
                return Err(BucketError::HashMismatch {
                    expected: hash,
                    got: bucket.hash,
                }
                .into());
            }
            ctx.metrics.download_bucket.mark_success();
            ctx.buckets.lock().await.store.insert(bucket);
        }
        self.bucket_state = Some(state);
        Ok(CatchupPhase::ApplyBuckets)
    }

    async fn apply_buckets(&mut self, ctx: &AppContext) -> Result<CatchupPhase, WorkError> {
        let plan = self.plan().clone();
        let boundary = plan.bucket_apply_at.expect("bucket phase implies anchor");
        let state = self.bucket_state.clone().expect("buckets fetched");
        let header = self
            .verified_header(boundary, ctx)
            .cloned()
            .ok_or(CatchupError::MissingVerifiedHeader {
                ledger_seq: boundary,
            })?;
        if header.bucket_list_hash != state.bucket_list_hash() {
            ctx.metrics.bucket_apply.mark_failure();
            return Err(CatchupError::BucketListMismatch {
                checkpoint: boundary,
            }
            .into());
        }
        let mut buckets = ctx.buckets.lock().await;
        let accounts = match buckets.install_from_state(&state) {
            Ok(accounts) => accounts,
            Err(e) => {
                ctx.metrics.bucket_apply.mark_failure();
                return Err(e.into());
            }
        };
        drop(buckets);
        let mut lm = ctx.ledger.lock().await;
        lm.install_snapshot(header, accounts);
        drop(lm);
        ctx.metrics.bucket_apply.mark_success();
        Ok(CatchupPhase::Replay {
            next: plan.apply_checkpoints.first(),
        })
    }

    #[instrument(skip(self, ctx))]
    async fn replay_one_checkpoint(
        &mut self,
        ctx: &AppContext,
        checkpoint: u32,
    ) -> Result<CatchupPhase, WorkError> {
        let plan = self.plan().clone();
        let remote = checkpoint_path(FileCategory::Transactions, checkpoint);
        let entries = match self.fetch_bytes(ctx, &remote).await {
            Ok(bytes) => decode_tx_file(&bytes).inspect_err(|_| {
                ctx.metrics.download_transactions.mark_failure();
            })?,
            Err(e) => {
                ctx.metrics.download_transactions.mark_failure();
                return Err(e);
            }
        };
        ctx.metrics
            .download_transactions
            .add_success(entries.len() as u64);

        for data in entries {
            let seq = data.ledger_seq;
            let mut lm = ctx.ledger.lock().await;
            if seq <= lm.last_closed().ledger_seq || seq > plan.apply_last {
                continue;
            }
            let expected = self
                .verified_header(seq, ctx)
                .cloned()
                .ok_or(CatchupError::MissingVerifiedHeader { ledger_seq: seq })?;
            if expected.prev_hash != lm.last_closed().hash {
                ctx.metrics.apply_ledger_chain.mark_failure();
                return Err(CatchupError::ReplayChainMismatch { ledger_seq: seq }.into());
            }
            let mut buckets = ctx.buckets.lock().await;
            let closed = match lm.close_ledger(&data, &mut buckets) {
                Ok(header) => header,
                Err(e) => {
                    ctx.metrics.apply_ledger_chain.mark_failure();
                    return Err(e.into());
                }
            };
            drop(buckets);
            drop(lm);
            if closed.hash != expected.hash {
                ctx.metrics.apply_ledger_chain.mark_failure();
                return Err(crate::ledger::LedgerError::ReplayHashMismatch {
                    ledger_seq: seq,
                    expected: expected.hash,
                    got: closed.hash,
                }
                .into());
            }
            ctx.metrics.apply_ledger_chain.mark_success();
        }

        if checkpoint == plan.apply_checkpoints.last() {
            Ok(CatchupPhase::Finalize)
        } else {
            Ok(CatchupPhase::Replay {
                next: checkpoint + ctx.frequency.get(),
            })
        }
    }

    async fn finalize(&mut self, ctx: &AppContext) -> Result<CatchupPhase, WorkError> {
        let plan = self.plan().clone();
        let mut lm = ctx.ledger.lock().await;
        lm.discard_stale_buffered();
        match self.config.mode {
            CatchupMode::Offline => lm.set_state(LedgerState::Synced),
            CatchupMode::Online => lm.set_state(LedgerState::WaitingForClosingLedger),
        }
        let lcl = lm.last_closed().ledger_seq;
        drop(lm);
        ctx.status.set_status(
            StatusCategory::HistoryCatchup,
            format!("caught up to ledger {} (target {})", lcl, plan.apply_last),
        );
        info!(lcl, "catchup complete");
        Ok(CatchupPhase::Finalize)
    }
}

#[async_trait]
impl Work for CatchupWork {
    fn name(&self) -> &str {
        "catchup"
    }

    async fn on_run(&mut self, ctx: &AppContext) -> Result<WorkStep, WorkError> {
        let step = match self.phase {
            CatchupPhase::ResolveTarget => self.resolve_target(ctx).await,
            CatchupPhase::FetchAnchor => self.fetch_anchor(ctx).await,
            CatchupPhase::VerifyHeaders { next } => self.verify_one_checkpoint(ctx, next).await,
            CatchupPhase::FetchBuckets => self.fetch_buckets(ctx).await,
            CatchupPhase::ApplyBuckets => self.apply_buckets(ctx).await,
            CatchupPhase::Replay { next } => self.replay_one_checkpoint(ctx, next).await,
            CatchupPhase::Finalize => {
                self.finalize(ctx).await?;
                return Ok(WorkStep::Complete);
            }
        };
        match step {
            Ok(next) => {
                self.phase = next;
                Ok(WorkStep::Running)
            }
            Err(e) => {
                warn!(error = %e, "catchup failed");
                ctx.status.set_status(
                    StatusCategory::HistoryCatchup,
                    format!("catchup to {} failed: {e}", self.config.to_ledger),
                );
                let mut lm = ctx.ledger.lock().await;
                lm.set_state(self.revert_state);
                Err(e)
            }
        }
    }

    fn on_reset(&mut self) {
        self.phase = CatchupPhase::ResolveTarget;
        self.scratch = None;
        self.plan = None;
        self.anchor_state = None;
        self.bucket_state = None;
        self.verified.clear();
        self.initial_lcl = None;
    }

    async fn on_abort(&mut self) -> bool {
        // Dropping the scratch dir tears down staged downloads; durable
        // state was never touched outside apply, which is not abortable
        // mid-ledger.
        self.scratch = None;
        true
    }
}
