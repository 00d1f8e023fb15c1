//! Checkpoint arithmetic over the ledger sequence.
//!
//! History is cut into fixed-frequency checkpoints. With frequency `F`, a
//! checkpoint is the contiguous run of ledgers ending at `k·F − 1` for some
//! `k ≥ 1`; that last ledger is the checkpoint's identifier. The genesis
//! checkpoint is special: ledger 0 does not exist as content, so it spans
//! `[1, F − 1]` and carries `F − 1` ledgers.
//!
//! All arithmetic here is pure; the frequency value itself comes from
//! [`crate::config::Config`] (64 in production, 8 when test acceleration is
//! enabled).
//!
//! # Examples
//!
//! ```rust
//! use chronicle::checkpoint::CheckpointFrequency;
//!
//! let f = CheckpointFrequency::ACCELERATED; // F = 8
//! assert_eq!(f.next_checkpoint_ledger(9), 16);
//! assert_eq!(f.checkpoint_containing(9), 15);
//! assert!(f.is_checkpoint_boundary(15));
//! assert_eq!(f.first_ledger_in_checkpoint(7), 1); // genesis checkpoint
//! ```

use serde::{Deserialize, Serialize};

/// Sequence number of the genesis ledger. Ledger 0 never exists as content.
pub const GENESIS_LEDGER: u32 = 1;

/// How many ledgers make up one checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFrequency(u32);

impl CheckpointFrequency {
    /// Production frequency: one checkpoint per 64 ledgers.
    pub const PRODUCTION: CheckpointFrequency = CheckpointFrequency(64);
    /// Test-accelerated frequency used when
    /// `ARTIFICIALLY_ACCELERATE_TIME_FOR_TESTING` is set.
    pub const ACCELERATED: CheckpointFrequency = CheckpointFrequency(8);

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Smallest multiple of `F` that is `≥ n`; returns `F` for `n == 0`.
    #[must_use]
    pub fn next_checkpoint_ledger(self, n: u32) -> u32 {
        let f = self.0;
        if n == 0 {
            return f;
        }
        n.div_ceil(f) * f
    }

    /// Largest multiple of `F` that is `≤ n`.
    #[must_use]
    pub fn prev_checkpoint_ledger(self, n: u32) -> u32 {
        (n / self.0) * self.0
    }

    /// The identifier (last ledger) of the checkpoint containing `n`.
    #[must_use]
    pub fn checkpoint_containing(self, n: u32) -> u32 {
        self.next_checkpoint_ledger(n + 1) - 1
    }

    /// True when `n` is a checkpoint identifier, i.e. `n == k·F − 1`.
    #[must_use]
    pub fn is_checkpoint_boundary(self, n: u32) -> bool {
        (n + 1) % self.0 == 0
    }

    /// First ledger of the checkpoint identified by boundary `checkpoint`.
    ///
    /// For the genesis checkpoint this is [`GENESIS_LEDGER`], not 0.
    #[must_use]
    pub fn first_ledger_in_checkpoint(self, checkpoint: u32) -> u32 {
        debug_assert!(self.is_checkpoint_boundary(checkpoint));
        (checkpoint + 1 - self.0).max(GENESIS_LEDGER)
    }

    /// True when `n` opens a fresh checkpoint (it is `k·F` for `k ≥ 1`).
    ///
    /// Seeing such a ledger externalized means the previous checkpoint has
    /// been cut, which is what makes it usable as an online-catchup trigger.
    #[must_use]
    pub fn is_first_ledger_in_checkpoint(self, n: u32) -> bool {
        n >= self.0 && n % self.0 == 0
    }

    /// The checkpoint boundary strictly below `n`, if one exists.
    #[must_use]
    pub fn checkpoint_before(self, n: u32) -> Option<u32> {
        if n <= self.0 - 1 {
            return None;
        }
        // Boundary of the checkpoint containing n, stepped back one window
        // when n itself sits on the boundary.
        let containing = self.checkpoint_containing(n);
        if containing == n {
            Some(n - self.0)
        } else {
            Some(containing - self.0)
        }
    }

    /// Checkpoint-align an inclusive ledger range.
    #[must_use]
    pub fn checkpoints_containing(self, range: LedgerRange) -> CheckpointRange {
        CheckpointRange {
            first: self.checkpoint_containing(range.first),
            last: self.checkpoint_containing(range.last),
            frequency: self,
        }
    }
}

/// Inclusive `[first, last]` run of ledger sequence numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRange {
    pub first: u32,
    pub last: u32,
}

impl LedgerRange {
    #[must_use]
    pub fn inclusive(first: u32, last: u32) -> Self {
        debug_assert!(first <= last);
        LedgerRange { first, last }
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.last - self.first + 1
    }

    #[must_use]
    pub fn contains(&self, n: u32) -> bool {
        self.first <= n && n <= self.last
    }
}

/// A run of whole checkpoints, identified by first and last boundary.
///
/// `count` is the number of checkpoints; `ledger_count` is the number of
/// ledger entries the corresponding archive files carry (the genesis
/// checkpoint contributes one fewer than `F`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointRange {
    first: u32,
    last: u32,
    frequency: CheckpointFrequency,
}

impl CheckpointRange {
    #[must_use]
    pub fn first(&self) -> u32 {
        self.first
    }

    #[must_use]
    pub fn last(&self) -> u32 {
        self.last
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        (self.last - self.first) / self.frequency.get() + 1
    }

    /// First ledger covered by the range's files.
    #[must_use]
    pub fn first_ledger(&self) -> u32 {
        self.frequency.first_ledger_in_checkpoint(self.first)
    }

    /// Total ledger entries across the range's files.
    #[must_use]
    pub fn ledger_count(&self) -> u32 {
        self.last - self.first_ledger() + 1
    }

    /// Boundaries in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + use<> {
        let f = self.frequency.get();
        (self.first..=self.last).step_by(f as usize).map(move |n| {
            debug_assert!((n + 1) % f == 0);
            n
        })
    }
}
