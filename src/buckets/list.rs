//! The levelled bucket list.
//!
//! Three levels, freshest first. Level 0 accumulates the per-ledger batch of
//! changed account entries; every 4th close level 0 spills into level 1 and
//! every 16th close level 1 spills into level 2. Merge content is the
//! deterministic concatenation of older-then-newer bytes, so the merged hash
//! is known at spill time; producing the merged bucket for the store runs as
//! a background task whose handle the publish pipeline joins before it reads
//! bucket bytes (`resolve_futures`).
//!
//! Replaying level 2 ∥ level 1 ∥ level 0 oldest-to-newest therefore visits
//! every batch since genesis exactly once, which is what lets a catchup
//! install a downloaded bucket list wholesale and rebuild account state.

use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{decode_entries, encode_entries, Bucket, BucketError, BucketStore};
use crate::hash::Hash256;
use crate::history::HistoryArchiveState;
use crate::ledger::AccountEntry;

pub const BUCKET_LIST_LEVELS: usize = 3;

/// Close counts between spills into the next level, per source level.
const SPILL_PERIOD: [u32; BUCKET_LIST_LEVELS - 1] = [4, 16];

/// An in-flight bucket merge: the output hash is already known, the handle
/// produces the merged bucket for the store.
pub struct MergeHandle {
    output: Hash256,
    task: JoinHandle<Bucket>,
}

impl MergeHandle {
    fn spawn(merged_bytes: Vec<u8>) -> Self {
        let output = Hash256::of(&merged_bytes);
        let task = tokio::spawn(async move {
            // Materialisation is deliberately off the close path.
            tokio::task::yield_now().await;
            Bucket::from_bytes(merged_bytes)
        });
        Self { output, task }
    }

    #[must_use]
    pub fn output(&self) -> Hash256 {
        self.output
    }

    pub async fn join(self) -> Result<Bucket, BucketError> {
        self.task.await.map_err(|e| BucketError::Merge {
            message: e.to_string(),
        })
    }
}

#[derive(Clone, Default)]
struct BucketLevel {
    curr: Hash256,
    bytes: Vec<u8>,
}

impl BucketLevel {
    fn set(&mut self, bytes: Vec<u8>) {
        self.curr = if bytes.is_empty() {
            Hash256::ZERO
        } else {
            Hash256::of(&bytes)
        };
        self.bytes = bytes;
    }

    fn clear(&mut self) {
        self.curr = Hash256::ZERO;
        self.bytes.clear();
    }
}

/// The live levelled list of one node.
#[derive(Default)]
pub struct BucketList {
    levels: [BucketLevel; BUCKET_LIST_LEVELS],
}

impl BucketList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest over the level hashes, freshest first.
    #[must_use]
    pub fn hash(&self) -> Hash256 {
        let parts: Vec<&[u8]> = self.levels.iter().map(|l| &l.curr.0[..]).collect();
        Hash256::of_parts(&parts)
    }

    /// Current level hashes, freshest first; zero marks an empty level.
    #[must_use]
    pub fn level_hashes(&self) -> Vec<Hash256> {
        self.levels.iter().map(|l| l.curr).collect()
    }

    #[must_use]
    pub fn level_hash(&self, level: usize) -> Hash256 {
        self.levels[level].curr
    }
}

/// Owns the store and the live list; the only writer of either.
#[derive(Default)]
pub struct BucketManager {
    pub store: BucketStore,
    list: BucketList,
    pending: Vec<MergeHandle>,
}

impl BucketManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn list(&self) -> &BucketList {
        &self.list
    }

    /// Fold one closed ledger's changed entries into the list and return the
    /// resulting bucket-list hash.
    pub fn add_batch(&mut self, ledger_seq: u32, entries: &[AccountEntry]) -> Hash256 {
        let batch = encode_entries(entries);
        let mut level0 = self.list.levels[0].bytes.clone();
        level0.extend_from_slice(&batch);
        self.store.insert(Bucket::from_bytes(level0.clone()));
        self.list.levels[0].set(level0);

        // Shallow spill first so a deep spill the same ledger carries it.
        if ledger_seq % SPILL_PERIOD[0] == 0 {
            self.spill(0);
        }
        if ledger_seq % SPILL_PERIOD[1] == 0 {
            self.spill(1);
        }
        self.list.hash()
    }

    fn spill(&mut self, from: usize) {
        let source = std::mem::take(&mut self.list.levels[from].bytes);
        if source.is_empty() {
            self.list.levels[from].clear();
            return;
        }
        let mut merged = self.list.levels[from + 1].bytes.clone();
        merged.extend_from_slice(&source);
        let handle = MergeHandle::spawn(merged.clone());
        debug!(level = from + 1, output = %handle.output(), "bucket spill");
        self.pending.push(handle);
        self.list.levels[from + 1].set(merged);
        self.list.levels[from].clear();
    }

    /// Join every outstanding merge and land its output in the store.
    ///
    /// Publish must call this before reading bucket bytes for upload.
    pub async fn resolve_futures(&mut self) -> Result<(), BucketError> {
        let joins = self.pending.drain(..).map(MergeHandle::join);
        for bucket in futures_util::future::try_join_all(joins).await? {
            self.store.insert(bucket);
        }
        Ok(())
    }

    #[must_use]
    pub fn has_pending_merges(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Adopt a downloaded bucket list wholesale and rebuild account state.
    ///
    /// Every non-zero level hash must already be present in the store; the
    /// rebuilt map reflects level 2 ∥ level 1 ∥ level 0 applied oldest to
    /// newest.
    pub fn install_from_state(
        &mut self,
        state: &HistoryArchiveState,
    ) -> Result<FxHashMap<String, AccountEntry>, BucketError> {
        let mut levels: [BucketLevel; BUCKET_LIST_LEVELS] = Default::default();
        for (i, hash) in state.buckets.iter().take(BUCKET_LIST_LEVELS).enumerate() {
            if hash.is_zero() {
                continue;
            }
            let bucket = self
                .store
                .get(hash)
                .ok_or(BucketError::Missing { hash: *hash })?;
            levels[i].set(bucket.bytes.clone());
        }
        let mut accounts = FxHashMap::default();
        for level in levels.iter().rev() {
            for entry in decode_entries(&level.bytes)? {
                accounts.insert(entry.account.clone(), entry);
            }
        }
        self.pending.clear();
        self.list = BucketList { levels };
        Ok(accounts)
    }
}
