//! The application aggregate.
//!
//! [`App`] wires the managers — ledger, buckets, history, archives, metrics,
//! status — into one [`AppContext`] handed to every Work, and owns the
//! cooperative scheduler that drives them. Tests and embedding nodes make
//! progress by calling [`crank`](App::crank) (or
//! [`crank_until`](App::crank_until)); nothing advances between cranks, so
//! interleavings stay reproducible.

use std::sync::Arc;
use std::time::{Duration, Instant};

use miette::Diagnostic;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::archive::{
    bucket_path, checkpoint_path, fetch_root_state, has_any_writable, initialize_archive,
    Archive, ArchiveError, FileCategory, ROOT_STATE_PATH,
};
use crate::buckets::{Bucket, BucketError, BucketManager};
use crate::catchup::verify::{verify_checkpoint_headers, VerifyError};
use crate::catchup::{CatchupConfiguration, CatchupMode, CatchupWork};
use crate::checkpoint::CheckpointFrequency;
use crate::config::Config;
use crate::history::{
    decode_header_file, gunzip_bytes, HistoryArchiveState, HistoryFileError,
};
use crate::ledger::{
    AccountEntry, ExternalizeOutcome, LedgerCloseData, LedgerError, LedgerHeaderHistoryEntry,
    LedgerManager, LedgerState,
};
use crate::metrics::HistoryMetrics;
use crate::publish::{HistoryManager, PublishError, PublishWork};
use crate::status::{EventBus, StatusReporter};
use crate::tmp::{TmpDirError, TmpDirManager};
use crate::work::{WorkHandle, WorkScheduler, WorkState};

/// Shared handles every Work receives instead of a global singleton.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub frequency: CheckpointFrequency,
    pub db: SqlitePool,
    pub ledger: Arc<Mutex<LedgerManager>>,
    pub buckets: Arc<Mutex<BucketManager>>,
    pub history: Arc<Mutex<HistoryManager>>,
    pub archives: Arc<Vec<Arc<dyn Archive>>>,
    pub metrics: Arc<HistoryMetrics>,
    pub status: StatusReporter,
    pub tmp: Arc<TmpDirManager>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum AppError {
    #[error("database setup failed: {0}")]
    #[diagnostic(code(chronicle::app::database))]
    Database(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bucket(#[from] BucketError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    HistoryFile(#[from] HistoryFileError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Tmp(#[from] TmpDirError),

    #[error("crank_until timed out after {elapsed:?}")]
    #[diagnostic(
        code(chronicle::app::crank_timeout),
        help("The predicate never held within the wall-clock budget.")
    )]
    CrankTimeout { elapsed: Duration },
}

/// Synchronous snapshot handed to `crank_until` predicates.
#[derive(Clone, Copy, Debug)]
pub struct CrankView {
    pub ledger_state: LedgerState,
    pub lcl: u32,
    pub all_work_done: bool,
    pub publish_queue_len: u32,
    pub publish_halted: bool,
}

/// One history-subsystem node.
pub struct App {
    ctx: AppContext,
    scheduler: WorkScheduler,
}

impl App {
    /// Build a node from configuration: connect the durable queue, run
    /// migrations, restore queued state, and start from genesis.
    pub async fn build(
        config: Config,
        archives: Vec<Arc<dyn Archive>>,
    ) -> Result<Self, AppError> {
        Self::build_with_bus(config, archives, EventBus::new()).await
    }

    /// Like [`build`](Self::build) with a caller-supplied event bus, so
    /// embedders can attach sinks.
    pub async fn build_with_bus(
        config: Config,
        archives: Vec<Arc<dyn Archive>>,
        bus: EventBus,
    ) -> Result<Self, AppError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&config.database_url)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let frequency = config.checkpoint_frequency();
        let tmp = TmpDirManager::new()?;
        let mut buckets = BucketManager::new();
        let ledger = if config.use_config_for_genesis {
            LedgerManager::genesis(frequency, config.ledger_protocol_version, &mut buckets)
        } else {
            Self::genesis_from_archives(&config, frequency, &archives, &tmp, &mut buckets)
                .await?
        };
        // References rebuilt from persisted rows before any bucket GC runs.
        let history = HistoryManager::restore(pool.clone()).await?;

        info!(
            frequency = frequency.get(),
            archives = archives.len(),
            "history subsystem ready"
        );
        let ctx = AppContext {
            config: Arc::new(config),
            frequency,
            db: pool,
            ledger: Arc::new(Mutex::new(ledger)),
            buckets: Arc::new(Mutex::new(buckets)),
            history: Arc::new(Mutex::new(history)),
            archives: Arc::new(archives),
            metrics: Arc::new(HistoryMetrics::new()),
            status: StatusReporter::new(Arc::new(bus)),
            tmp: Arc::new(tmp),
        };
        Ok(Self {
            ctx,
            scheduler: WorkScheduler::new(),
        })
    }

    /// Derive the starting ledger state from a real archive state
    /// (`USE_CONFIG_FOR_GENESIS = false`).
    ///
    /// The root state names the newest published checkpoint. Its header
    /// file anchors the snapshot — the boundary header must describe the
    /// state's bucket list — and its buckets, verified by content hash,
    /// rebuild the account map.
    async fn genesis_from_archives(
        config: &Config,
        frequency: CheckpointFrequency,
        archives: &[Arc<dyn Archive>],
        tmp: &TmpDirManager,
        buckets: &mut BucketManager,
    ) -> Result<LedgerManager, AppError> {
        let scratch = tmp.scratch_dir("genesis-")?;
        let mut found = None;
        for archive in archives {
            match fetch_root_state(archive.as_ref(), &scratch).await {
                Ok(state) => {
                    found = Some((state, archive.clone()));
                    break;
                }
                Err(e) => warn!(archive = archive.name(), error = %e, "root state unavailable"),
            }
        }
        let Some((root, archive)) = found else {
            return Err(ArchiveError::NotFound {
                path: ROOT_STATE_PATH.to_string(),
            }
            .into());
        };

        let checkpoint = frequency.checkpoint_containing(root.current_ledger);
        let local = scratch.path().join("genesis-headers");
        archive
            .get_file(&checkpoint_path(FileCategory::Ledger, checkpoint), &local)
            .await?;
        let bytes = tokio::fs::read(&local).await.map_err(|e| ArchiveError::Io {
            message: e.to_string(),
        })?;
        let headers = decode_header_file(&bytes)?;
        verify_checkpoint_headers(&headers, checkpoint, frequency, config.ledger_protocol_version)?;
        let boundary = headers
            .iter()
            .find(|h| h.ledger_seq == root.current_ledger)
            .ok_or(VerifyError::Undershot {
                checkpoint,
                last: headers.first().map_or(0, |h| h.ledger_seq),
                expected: root.current_ledger,
            })?;
        if boundary.bucket_list_hash != root.bucket_list_hash() {
            return Err(VerifyError::BadHash {
                ledger_seq: boundary.ledger_seq,
            }
            .into());
        }

        for hash in root.bucket_hashes() {
            let local = scratch.path().join(hash.to_hex());
            archive.get_file(&bucket_path(&hash), &local).await?;
            let compressed = tokio::fs::read(&local).await.map_err(|e| ArchiveError::Io {
                message: e.to_string(),
            })?;
            let bucket = Bucket::from_bytes(gunzip_bytes(&compressed)?);
            if bucket.hash != hash {
                return Err(BucketError::HashMismatch {
                    expected: hash,
                    got: bucket.hash,
                }
                .into());
            }
            buckets.store.insert(bucket);
        }
        let accounts = buckets.install_from_state(&root)?;
        info!(
            ledger = boundary.ledger_seq,
            "genesis derived from archive state"
        );
        Ok(LedgerManager::from_snapshot(
            frequency,
            config.ledger_protocol_version,
            boundary.clone(),
            accounts,
        ))
    }

    #[must_use]
    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub async fn ledger_state(&self) -> LedgerState {
        self.ctx.ledger.lock().await.state()
    }

    pub async fn last_closed(&self) -> LedgerHeaderHistoryEntry {
        self.ctx.ledger.lock().await.last_closed().clone()
    }

    pub async fn account(&self, account: &str) -> Option<AccountEntry> {
        self.ctx.ledger.lock().await.account(account).cloned()
    }

    /// Seed every writable archive with the node's current state.
    pub async fn initialize_archives(&self) -> Result<(), AppError> {
        let state = {
            let lm = self.ctx.ledger.lock().await;
            let buckets = self.ctx.buckets.lock().await;
            HistoryArchiveState::capture(
                lm.last_closed().ledger_seq,
                self.ctx.config.ledger_protocol_version,
                buckets.list(),
            )
        };
        let scratch = self.ctx.tmp.scratch_dir("init-")?;
        for archive in self.ctx.archives.iter().filter(|a| a.is_writable()) {
            initialize_archive(archive.as_ref(), &state, &scratch).await?;
        }
        Ok(())
    }

    /// Close one ledger and, on a checkpoint boundary, durably queue its
    /// state for publication. A queue insert failure aborts the close.
    pub async fn close_ledger(&mut self, data: &LedgerCloseData) -> Result<(), AppError> {
        let (header, state) = {
            let mut lm = self.ctx.ledger.lock().await;
            let mut buckets = self.ctx.buckets.lock().await;
            let header = lm.close_ledger(data, &mut buckets)?;
            let state = HistoryArchiveState::capture(
                header.ledger_seq,
                self.ctx.config.ledger_protocol_version,
                buckets.list(),
            );
            (header, state)
        };
        let mut history = self.ctx.history.lock().await;
        history
            .maybe_queue(
                &header,
                state,
                self.ctx.frequency,
                has_any_writable(&self.ctx.archives),
            )
            .await?;
        Ok(())
    }

    /// A value arrived from the network: close it, buffer it, or kick off
    /// online catchup.
    pub async fn value_externalized(&mut self, data: LedgerCloseData) -> Result<(), AppError> {
        let outcome = {
            let mut lm = self.ctx.ledger.lock().await;
            lm.value_externalized(data)
        };
        match outcome {
            ExternalizeOutcome::ShouldDrain => self.drain_buffered().await,
            ExternalizeOutcome::TriggerCatchup { target } => {
                let config = CatchupConfiguration {
                    to_ledger: target,
                    recent: if self.ctx.config.catchup_complete {
                        None
                    } else {
                        self.ctx.config.catchup_recent
                    },
                    mode: CatchupMode::Online,
                };
                self.start_catchup(config).await;
                Ok(())
            }
            ExternalizeOutcome::Buffered | ExternalizeOutcome::Ignored => Ok(()),
        }
    }

    /// Close buffered ledgers while they extend the LCL; leaving the
    /// waiting state once the buffer fully knits up.
    async fn drain_buffered(&mut self) -> Result<(), AppError> {
        let mut drained = 0u32;
        loop {
            let next = {
                let mut lm = self.ctx.ledger.lock().await;
                lm.take_next_buffered()
            };
            let Some(data) = next else { break };
            self.close_ledger(&data).await?;
            drained += 1;
        }
        if drained > 0 {
            let mut lm = self.ctx.ledger.lock().await;
            if lm.state() == LedgerState::WaitingForClosingLedger && lm.buffered_is_empty() {
                lm.set_state(LedgerState::Synced);
            }
        }
        Ok(())
    }

    /// Schedule a catchup run; progress happens on subsequent cranks.
    pub async fn start_catchup(&mut self, config: CatchupConfiguration) -> WorkHandle {
        let revert = {
            let mut lm = self.ctx.ledger.lock().await;
            let revert = match lm.state() {
                LedgerState::CatchingUp | LedgerState::WaitingForClosingLedger => {
                    LedgerState::CatchingUp
                }
                other => other,
            };
            lm.set_state(LedgerState::CatchingUp);
            revert
        };
        self.scheduler
            .add_work(Box::new(CatchupWork::new(config, revert)))
    }

    /// Run offline catchup to `to_ledger`, driving the scheduler until the
    /// run finishes or the budget is spent. Returns whether the node ended
    /// synced at the target.
    pub async fn catchup_offline(
        &mut self,
        to_ledger: u32,
        recent: Option<u32>,
        timeout: Duration,
    ) -> Result<bool, AppError> {
        let handle = self
            .start_catchup(CatchupConfiguration {
                to_ledger,
                recent,
                mode: CatchupMode::Offline,
            })
            .await;
        if self.crank_until(|_| true, timeout).await.is_err() {
            self.scheduler.abort_all().await;
            return Ok(false);
        }
        let synced = matches!(
            self.ledger_state().await,
            LedgerState::Synced | LedgerState::Booting
        );
        Ok(self.scheduler.state_of(handle) == WorkState::Success && synced)
    }

    /// Start the next queued publish when nothing is in flight.
    async fn maybe_start_publish(&mut self) -> Result<(), AppError> {
        let next = {
            let mut history = self.ctx.history.lock().await;
            history.begin_publish().await?
        };
        if let Some((ledger, state)) = next {
            self.scheduler
                .add_work(Box::new(PublishWork::new(ledger, state)));
        }
        Ok(())
    }

    /// Advance every live work one step; returns how many are still live.
    pub async fn crank(&mut self) -> Result<usize, AppError> {
        self.maybe_start_publish().await?;
        Ok(self.scheduler.crank(&self.ctx).await)
    }

    pub async fn view(&self) -> Result<CrankView, AppError> {
        let (ledger_state, lcl) = {
            let lm = self.ctx.ledger.lock().await;
            (lm.state(), lm.last_closed().ledger_seq)
        };
        let (publish_queue_len, publish_halted, in_flight) = {
            let history = self.ctx.history.lock().await;
            (
                history.queue_len().await?,
                history.is_halted(),
                history.in_flight().is_some(),
            )
        };
        // The queue counts as outstanding work: an idle scheduler with
        // unhalted entries will start the next publish on the next crank.
        let quiescent = self.scheduler.all_done()
            && !in_flight
            && (publish_queue_len == 0 || publish_halted);
        Ok(CrankView {
            ledger_state,
            lcl,
            all_work_done: quiescent,
            publish_queue_len,
            publish_halted,
        })
    }

    /// Crank until the scheduler is idle and `predicate` holds, or the
    /// wall-clock budget runs out.
    pub async fn crank_until<P>(&mut self, mut predicate: P, timeout: Duration) -> Result<(), AppError>
    where
        P: FnMut(&CrankView) -> bool,
    {
        let start = Instant::now();
        loop {
            let view = self.view().await?;
            if view.all_work_done && predicate(&view) {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(AppError::CrankTimeout {
                    elapsed: start.elapsed(),
                });
            }
            self.crank().await?;
            tokio::task::yield_now().await;
        }
    }

    #[must_use]
    pub fn scheduler(&self) -> &WorkScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn scheduler_mut(&mut self) -> &mut WorkScheduler {
        &mut self.scheduler
    }
}
