//! The durable publish queue and the bucket reference multiset.
//!
//! One SQLite table, one row per checkpoint awaiting upload. The queue is
//! append-mostly and strictly ordered by ledger; rows disappear only after
//! every archive acknowledged the upload. The parallel in-memory multiset
//! pins every bucket a queued state references so the store cannot drop a
//! bucket mid-publish; it is rebuilt from the persisted rows on restart
//! before any eviction decision can run.

use rustc_hash::{FxHashMap, FxHashSet};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::PublishError;
use crate::hash::Hash256;
use crate::history::HistoryArchiveState;

/// Durable, ordered list of `(ledger, HAS)` pairs.
pub struct PublishQueue {
    pool: SqlitePool,
}

impl PublishQueue {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist one checkpoint state. The insert either lands or the whole
    /// ledger close fails; there is no partially queued state.
    #[instrument(skip(self, state), err)]
    pub async fn insert(
        &self,
        ledger: u32,
        state: &HistoryArchiveState,
    ) -> Result<(), PublishError> {
        sqlx::query("INSERT INTO publishqueue (ledger, state) VALUES (?1, ?2)")
            .bind(i64::from(ledger))
            .bind(state.to_json())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All queued states, ascending by ledger.
    pub async fn snapshot_states(
        &self,
    ) -> Result<Vec<(u32, HistoryArchiveState)>, PublishError> {
        let rows = sqlx::query("SELECT ledger, state FROM publishqueue ORDER BY ledger ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let ledger: i64 = row.get("ledger");
                let raw: String = row.get("state");
                let state =
                    HistoryArchiveState::from_json(&raw).map_err(|e| PublishError::BadRow {
                        ledger: ledger as u32,
                        message: e.to_string(),
                    })?;
                Ok((ledger as u32, state))
            })
            .collect()
    }

    /// The oldest queued entry, if any.
    pub async fn front(&self) -> Result<Option<(u32, HistoryArchiveState)>, PublishError> {
        let row = sqlx::query("SELECT ledger, state FROM publishqueue ORDER BY ledger ASC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let ledger: i64 = row.get("ledger");
            let raw: String = row.get("state");
            let state = HistoryArchiveState::from_json(&raw).map_err(|e| PublishError::BadRow {
                ledger: ledger as u32,
                message: e.to_string(),
            })?;
            Ok((ledger as u32, state))
        })
        .transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn remove(&self, ledger: u32) -> Result<(), PublishError> {
        sqlx::query("DELETE FROM publishqueue WHERE ledger = ?1")
            .bind(i64::from(ledger))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn len(&self) -> Result<u32, PublishError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM publishqueue")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n as u32)
    }
}

/// Reference counts for every bucket pinned by the queue.
///
/// Counts, not a set: two queued checkpoints may share a bucket, and the
/// pin must survive until the *last* referring entry is removed.
#[derive(Default)]
pub struct PublishQueueBuckets {
    refs: FxHashMap<Hash256, usize>,
}

impl PublishQueueBuckets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_state(&mut self, state: &HistoryArchiveState) {
        for hash in state.bucket_hashes() {
            *self.refs.entry(hash).or_insert(0) += 1;
        }
    }

    pub fn remove_state(&mut self, state: &HistoryArchiveState) {
        for hash in state.bucket_hashes() {
            if let Some(count) = self.refs.get_mut(&hash) {
                *count -= 1;
                if *count == 0 {
                    self.refs.remove(&hash);
                }
            }
        }
    }

    #[must_use]
    pub fn referenced(&self) -> FxHashSet<Hash256> {
        self.refs.keys().copied().collect()
    }

    #[must_use]
    pub fn is_referenced(&self, hash: &Hash256) -> bool {
        self.refs.contains_key(hash)
    }
}
