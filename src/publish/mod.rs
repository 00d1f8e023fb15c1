//! Checkpoint publication.
//!
//! When the last ledger of a checkpoint closes and at least one archive is
//! writable, the bucket list is snapshotted into a HAS and durably queued.
//! The pipeline then publishes queue entries strictly in ledger order, at
//! most one in flight, through resolve → write → upload phases. A failed
//! entry stays queued and halts auto-scheduling until an operator steps in.

pub mod pipeline;
pub mod queue;

pub use pipeline::PublishWork;
pub use queue::{PublishQueue, PublishQueueBuckets};

use miette::Diagnostic;
use rustc_hash::FxHashSet;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};

use crate::buckets::BucketStore;
use crate::checkpoint::CheckpointFrequency;
use crate::hash::Hash256;
use crate::history::HistoryArchiveState;
use crate::ledger::LedgerHeaderHistoryEntry;

#[derive(Debug, Error, Diagnostic)]
pub enum PublishError {
    /// Database failures are fatal for the node.
    #[error("publish queue database error: {0}")]
    #[diagnostic(
        code(chronicle::publish::database),
        help("The durable queue is unusable; the node cannot close ledgers safely.")
    )]
    Database(#[from] sqlx::Error),

    #[error("queued state for ledger {ledger} is unreadable: {message}")]
    #[diagnostic(code(chronicle::publish::bad_row))]
    BadRow { ledger: u32, message: String },

    #[error("no retained history for ledger {ledger}; cannot publish its checkpoint")]
    #[diagnostic(code(chronicle::publish::missing_history))]
    MissingHistory { ledger: u32 },
}

/// Coordinates the durable queue, the bucket pins, and the single in-flight
/// publish slot.
pub struct HistoryManager {
    queue: PublishQueue,
    bucket_refs: PublishQueueBuckets,
    referenced_memo: Option<FxHashSet<Hash256>>,
    in_flight: Option<u32>,
    halted: bool,
    last_published: Option<HistoryArchiveState>,
}

impl HistoryManager {
    /// Open the durable queue and rebuild the bucket reference multiset
    /// from persisted rows. Runs before any bucket eviction may.
    pub async fn restore(pool: SqlitePool) -> Result<Self, PublishError> {
        let queue = PublishQueue::new(pool);
        let mut bucket_refs = PublishQueueBuckets::new();
        let rows = queue.snapshot_states().await?;
        for (_, state) in &rows {
            bucket_refs.add_state(state);
        }
        if !rows.is_empty() {
            info!(entries = rows.len(), "restored publish queue");
        }
        Ok(Self {
            queue,
            bucket_refs,
            referenced_memo: None,
            in_flight: None,
            halted: false,
            last_published: None,
        })
    }

    /// Queue the just-closed ledger's checkpoint when it sits on a boundary
    /// and something can accept the upload.
    ///
    /// Returns whether an entry was queued. A database failure here aborts
    /// the ledger close upstream; a crash between snapshot and insert never
    /// surfaces as "published" because only the row makes it durable.
    pub async fn maybe_queue(
        &mut self,
        lcl: &LedgerHeaderHistoryEntry,
        state: HistoryArchiveState,
        frequency: CheckpointFrequency,
        any_writable: bool,
    ) -> Result<bool, PublishError> {
        if !frequency.is_checkpoint_boundary(lcl.ledger_seq) {
            return Ok(false);
        }
        if !any_writable {
            warn!(
                ledger = lcl.ledger_seq,
                "checkpoint boundary with no writable archive; not queueing"
            );
            return Ok(false);
        }
        debug_assert_eq!(state.current_ledger, lcl.ledger_seq);
        self.queue.insert(lcl.ledger_seq, &state).await?;
        self.bucket_refs.add_state(&state);
        self.referenced_memo = None;
        info!(ledger = lcl.ledger_seq, "queued checkpoint for publication");
        Ok(true)
    }

    /// All queued states, ascending.
    pub async fn snapshot_states(
        &self,
    ) -> Result<Vec<(u32, HistoryArchiveState)>, PublishError> {
        self.queue.snapshot_states().await
    }

    pub async fn queue_len(&self) -> Result<u32, PublishError> {
        self.queue.len().await
    }

    /// Union of bucket hashes across the queue; memoised between mutations.
    pub fn referenced_buckets(&mut self) -> &FxHashSet<Hash256> {
        self.referenced_memo
            .get_or_insert_with(|| self.bucket_refs.referenced())
    }

    /// Referenced buckets that are not in the local store.
    pub fn missing_buckets(&mut self, store: &BucketStore) -> Vec<Hash256> {
        let referenced = self.referenced_buckets();
        store.missing_of(referenced.iter())
    }

    /// Claim the next entry for publication; `None` while one is in flight,
    /// after a halt, or when the queue is empty.
    pub async fn begin_publish(
        &mut self,
    ) -> Result<Option<(u32, HistoryArchiveState)>, PublishError> {
        if self.halted || self.in_flight.is_some() {
            return Ok(None);
        }
        let Some((ledger, state)) = self.queue.front().await? else {
            return Ok(None);
        };
        self.in_flight = Some(ledger);
        Ok(Some((ledger, state)))
    }

    /// Publication outcome callback.
    ///
    /// Success removes the row and releases its bucket pins; failure leaves
    /// the row for inspection and halts auto-scheduling.
    pub async fn history_published(
        &mut self,
        ledger: u32,
        state: &HistoryArchiveState,
        success: bool,
    ) -> Result<(), PublishError> {
        debug_assert_eq!(self.in_flight, Some(ledger));
        self.in_flight = None;
        if success {
            self.queue.remove(ledger).await?;
            self.bucket_refs.remove_state(state);
            self.referenced_memo = None;
            self.last_published = Some(state.clone());
            info!(ledger, "checkpoint published");
        } else {
            self.halted = true;
            warn!(ledger, "publish failed; pipeline halted");
        }
        Ok(())
    }

    /// The most recently published state, used to diff newly referenced
    /// buckets.
    #[must_use]
    pub fn last_published(&self) -> Option<&HistoryArchiveState> {
        self.last_published.as_ref()
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Operator acknowledgement after a failed entry.
    pub fn clear_halt(&mut self) {
        self.halted = false;
    }

    #[must_use]
    pub fn in_flight(&self) -> Option<u32> {
        self.in_flight
    }
}
