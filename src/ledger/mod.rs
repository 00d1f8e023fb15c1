//! Ledger-facing data model: headers, transaction sets, accounts.
//!
//! The history subsystem treats transaction execution as an external
//! collaborator; the operations here are the minimal deterministic set the
//! test harness and replay path need (account creation and payments). What
//! matters to history is the header chain: every header's `hash` is a
//! deterministic function of its contents and `prev_hash` must equal the
//! previous header's `hash`.

pub mod manager;

pub use manager::{ExternalizeOutcome, LedgerManager, LedgerState};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::Hash256;

/// Post-state of one account, as stored in buckets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    pub account: String,
    pub balance: i64,
    pub seqnum: u32,
}

/// The operations history replay understands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Fund a new account from the root account.
    CreateAccount { account: String, balance: i64 },
    /// Move `amount` from one existing account to another.
    Payment {
        from: String,
        to: String,
        amount: i64,
    },
}

/// Ordered operations closed within one ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSet {
    pub ops: Vec<Operation>,
}

impl TxSet {
    #[must_use]
    pub fn new(ops: Vec<Operation>) -> Self {
        Self { ops }
    }
}

/// Everything needed to close one ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCloseData {
    pub ledger_seq: u32,
    pub close_time: u64,
    pub tx_set: TxSet,
}

/// One entry of the ledger-header history: the unit of chain verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHeaderHistoryEntry {
    pub ledger_seq: u32,
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub bucket_list_hash: Hash256,
    pub close_time: u64,
    pub version: u32,
}

impl LedgerHeaderHistoryEntry {
    /// Build an entry, deriving `hash` from the remaining fields.
    #[must_use]
    pub fn new(
        ledger_seq: u32,
        prev_hash: Hash256,
        bucket_list_hash: Hash256,
        close_time: u64,
        version: u32,
    ) -> Self {
        let hash = Self::compute_hash(ledger_seq, prev_hash, bucket_list_hash, close_time, version);
        Self {
            ledger_seq,
            hash,
            prev_hash,
            bucket_list_hash,
            close_time,
            version,
        }
    }

    /// The canonical header digest.
    #[must_use]
    pub fn compute_hash(
        ledger_seq: u32,
        prev_hash: Hash256,
        bucket_list_hash: Hash256,
        close_time: u64,
        version: u32,
    ) -> Hash256 {
        Hash256::of_parts(&[
            &ledger_seq.to_be_bytes(),
            &prev_hash.0,
            &bucket_list_hash.0,
            &close_time.to_be_bytes(),
            &version.to_be_bytes(),
        ])
    }

    /// True when `hash` matches the entry's own contents.
    #[must_use]
    pub fn hash_is_consistent(&self) -> bool {
        self.hash
            == Self::compute_hash(
                self.ledger_seq,
                self.prev_hash,
                self.bucket_list_hash,
                self.close_time,
                self.version,
            )
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum LedgerError {
    #[error("cannot close ledger {got}: expected {expected}")]
    #[diagnostic(code(chronicle::ledger::unexpected_sequence))]
    UnexpectedSequence { expected: u32, got: u32 },

    #[error("account already exists: {account}")]
    #[diagnostic(code(chronicle::ledger::account_exists))]
    AccountExists { account: String },

    #[error("no such account: {account}")]
    #[diagnostic(code(chronicle::ledger::no_such_account))]
    NoSuchAccount { account: String },

    #[error("insufficient balance on {account}: have {have}, need {need}")]
    #[diagnostic(code(chronicle::ledger::insufficient_balance))]
    InsufficientBalance {
        account: String,
        have: i64,
        need: i64,
    },

    #[error("replayed ledger {ledger_seq} hashes to {got}, history says {expected}")]
    #[diagnostic(
        code(chronicle::ledger::replay_hash_mismatch),
        help("The local node diverged from the archived chain; catchup must stop.")
    )]
    ReplayHashMismatch {
        ledger_seq: u32,
        expected: Hash256,
        got: Hash256,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_hash_is_deterministic() {
        let a = LedgerHeaderHistoryEntry::new(5, Hash256::of(b"prev"), Hash256::of(b"bl"), 5, 1);
        let b = LedgerHeaderHistoryEntry::new(5, Hash256::of(b"prev"), Hash256::of(b"bl"), 5, 1);
        assert_eq!(a.hash, b.hash);
        assert!(a.hash_is_consistent());
    }

    #[test]
    fn header_hash_covers_every_field() {
        let base = LedgerHeaderHistoryEntry::new(5, Hash256::of(b"prev"), Hash256::of(b"bl"), 5, 1);
        let bumped = LedgerHeaderHistoryEntry::new(5, Hash256::of(b"prev"), Hash256::of(b"bl"), 6, 1);
        assert_ne!(base.hash, bumped.hash);
    }
}
