//! Success/failure meters for history work.
//!
//! One [`HistoryMetrics`] aggregate lives in the application context; Works
//! bump the relevant counters as they make progress. The catchup-facing
//! subset is readable as a [`CatchupMetrics`] snapshot at any time, and
//! snapshots subtract, so a test can compare the work performed by one
//! catchup run against the planner's [`CatchupPerformedWork`] prediction.

use std::ops::Sub;
use std::sync::atomic::{AtomicU64, Ordering};

/// A success/failure counter pair for one meter.
#[derive(Default)]
pub struct Meter {
    success: AtomicU64,
    failure: AtomicU64,
}

impl Meter {
    pub fn add_success(&self, n: u64) {
        self.success.fetch_add(n, Ordering::Relaxed);
    }

    pub fn mark_success(&self) {
        self.add_success(1);
    }

    pub fn mark_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }
}

/// All meters kept by the history subsystem.
///
/// Download meters for ledger and transaction files count *entries*, not
/// files, so they line up with the planner's range arithmetic.
#[derive(Default)]
pub struct HistoryMetrics {
    pub publish: Meter,
    pub download_has: Meter,
    pub download_ledger: Meter,
    pub download_transactions: Meter,
    pub download_bucket: Meter,
    pub verify_ledger: Meter,
    pub verify_ledger_chain: Meter,
    pub bucket_apply: Meter,
    pub apply_ledger_chain: Meter,
}

impl HistoryMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the catchup-facing counters.
    #[must_use]
    pub fn catchup_snapshot(&self) -> CatchupMetrics {
        CatchupMetrics {
            has_downloaded: self.download_has.success_count(),
            ledgers_downloaded: self.download_ledger.success_count(),
            ledgers_verified: self.verify_ledger.success_count(),
            chain_verify_failures: self.verify_ledger_chain.failure_count(),
            buckets_downloaded: self.download_bucket.success_count(),
            buckets_applied: self.bucket_apply.success_count(),
            tx_downloaded: self.download_transactions.success_count(),
            tx_applied: self.apply_ledger_chain.success_count(),
        }
    }
}

/// Raw catchup counters at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CatchupMetrics {
    pub has_downloaded: u64,
    pub ledgers_downloaded: u64,
    pub ledgers_verified: u64,
    pub chain_verify_failures: u64,
    pub buckets_downloaded: u64,
    pub buckets_applied: u64,
    pub tx_downloaded: u64,
    pub tx_applied: u64,
}

impl Sub for CatchupMetrics {
    type Output = CatchupMetrics;

    fn sub(self, start: CatchupMetrics) -> CatchupMetrics {
        CatchupMetrics {
            has_downloaded: self.has_downloaded - start.has_downloaded,
            ledgers_downloaded: self.ledgers_downloaded - start.ledgers_downloaded,
            ledgers_verified: self.ledgers_verified - start.ledgers_verified,
            chain_verify_failures: self.chain_verify_failures - start.chain_verify_failures,
            buckets_downloaded: self.buckets_downloaded - start.buckets_downloaded,
            buckets_applied: self.buckets_applied - start.buckets_applied,
            tx_downloaded: self.tx_downloaded - start.tx_downloaded,
            tx_applied: self.tx_applied - start.tx_applied,
        }
    }
}

/// Boolean-normalised form of [`CatchupMetrics`]: the work-oracle shape.
///
/// Bucket work either happened or it did not; the exact number of bucket
/// files depends on which levels were empty, so the oracle normalises it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CatchupPerformedWork {
    pub has_downloaded: u64,
    pub ledgers_downloaded: u64,
    pub ledgers_verified: u64,
    pub chain_verify_failures: u64,
    pub buckets_downloaded: bool,
    pub buckets_applied: bool,
    pub tx_downloaded: u64,
    pub tx_applied: u64,
}

impl From<CatchupMetrics> for CatchupPerformedWork {
    fn from(m: CatchupMetrics) -> Self {
        CatchupPerformedWork {
            has_downloaded: m.has_downloaded,
            ledgers_downloaded: m.ledgers_downloaded,
            ledgers_verified: m.ledgers_verified,
            chain_verify_failures: m.chain_verify_failures,
            buckets_downloaded: m.buckets_downloaded > 0,
            buckets_applied: m.buckets_applied > 0,
            tx_downloaded: m.tx_downloaded,
            tx_applied: m.tx_applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_subtract_fieldwise() {
        let metrics = HistoryMetrics::new();
        let start = metrics.catchup_snapshot();
        metrics.download_has.mark_success();
        metrics.download_ledger.add_success(8);
        metrics.verify_ledger.add_success(8);
        let delta = metrics.catchup_snapshot() - start;
        assert_eq!(delta.has_downloaded, 1);
        assert_eq!(delta.ledgers_downloaded, 8);
        assert_eq!(delta.ledgers_verified, 8);
        assert_eq!(delta.tx_applied, 0);
    }

    #[test]
    fn performed_work_normalises_bucket_counts() {
        let observed = CatchupMetrics {
            buckets_downloaded: 3,
            buckets_applied: 1,
            ..Default::default()
        };
        let work = CatchupPerformedWork::from(observed);
        assert!(work.buckets_downloaded);
        assert!(work.buckets_applied);
    }
}
