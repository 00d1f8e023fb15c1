//! Content-addressed buckets and their store.
//!
//! A bucket is an immutable blob of account post-states at one level of the
//! bucket list. Bytes are newline-delimited JSON entries; the hash is the
//! SHA-256 of the bytes, so equal content always has equal identity. The
//! store keeps every bucket the node has produced or downloaded; eviction is
//! governed elsewhere via the publish queue's reference counts.

pub mod list;

pub use list::{BucketList, BucketManager, MergeHandle, BUCKET_LIST_LEVELS};

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::hash::Hash256;
use crate::ledger::AccountEntry;

/// One immutable, content-addressed blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bucket {
    pub hash: Hash256,
    pub bytes: Vec<u8>,
}

impl Bucket {
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            hash: Hash256::of(&bytes),
            bytes,
        }
    }

    /// Decode the account entries carried by this bucket, oldest first.
    pub fn entries(&self) -> Result<Vec<AccountEntry>, BucketError> {
        decode_entries(&self.bytes)
    }
}

/// Canonical bucket framing: one JSON object per line, input order kept.
#[must_use]
pub fn encode_entries(entries: &[AccountEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        // serde_json cannot fail on these plain records
        let line = serde_json::to_string(entry).expect("account entry serialises");
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
    }
    out
}

pub fn decode_entries(bytes: &[u8]) -> Result<Vec<AccountEntry>, BucketError> {
    let text = std::str::from_utf8(bytes).map_err(|e| BucketError::Malformed {
        message: e.to_string(),
    })?;
    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| BucketError::Malformed {
                message: e.to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Error, Diagnostic)]
pub enum BucketError {
    #[error("bucket {hash} is not in the local store")]
    #[diagnostic(code(chronicle::buckets::missing))]
    Missing { hash: Hash256 },

    #[error("bucket content hashes to {got}, expected {expected}")]
    #[diagnostic(
        code(chronicle::buckets::hash_mismatch),
        help("The archive served corrupted bucket content; try another archive.")
    )]
    HashMismatch { expected: Hash256, got: Hash256 },

    #[error("malformed bucket content: {message}")]
    #[diagnostic(code(chronicle::buckets::malformed))]
    Malformed { message: String },

    #[error("bucket merge task failed: {message}")]
    #[diagnostic(code(chronicle::buckets::merge))]
    Merge { message: String },
}

/// In-memory content-addressed bucket store.
#[derive(Default)]
pub struct BucketStore {
    buckets: FxHashMap<Hash256, Arc<Bucket>>,
}

impl BucketStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: re-inserting identical content is a no-op.
    pub fn insert(&mut self, bucket: Bucket) -> Arc<Bucket> {
        self.buckets
            .entry(bucket.hash)
            .or_insert_with(|| Arc::new(bucket))
            .clone()
    }

    #[must_use]
    pub fn get(&self, hash: &Hash256) -> Option<Arc<Bucket>> {
        self.buckets.get(hash).cloned()
    }

    #[must_use]
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.buckets.contains_key(hash)
    }

    /// The subset of `hashes` not present locally; the zero sentinel never
    /// counts.
    #[must_use]
    pub fn missing_of<'a>(&self, hashes: impl IntoIterator<Item = &'a Hash256>) -> Vec<Hash256> {
        hashes
            .into_iter()
            .filter(|h| !h.is_zero() && !self.contains(h))
            .copied()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
