//! The catchup planner and its work oracle.
//!
//! Given the local last-closed ledger and a target, the planner fixes the
//! minimal set of archive objects to fetch: which ledgers replay, whether a
//! bucket snapshot bridges the gap, and which checkpoints the header chain
//! verification must cover. The oracle — [`CatchupPlan::performed_work`] —
//! is *derived from those same ranges*, so tests compare observed counters
//! against the plan rather than against a second, parallel computation.

use miette::Diagnostic;
use thiserror::Error;

use super::CatchupConfiguration;
use crate::checkpoint::{CheckpointFrequency, CheckpointRange, LedgerRange};
use crate::metrics::CatchupPerformedWork;

#[derive(Debug, Error, Diagnostic)]
pub enum PlanError {
    #[error("catchup target {target} is not ahead of the local ledger {lcl}")]
    #[diagnostic(code(chronicle::catchup::target_not_ahead))]
    TargetNotAhead { target: u32, lcl: u32 },
}

/// The fixed shape of one catchup run.
#[derive(Clone, Debug)]
pub struct CatchupPlan {
    /// First ledger to replay.
    pub apply_first: u32,
    /// Last ledger to replay; equals the (possibly capped) target.
    pub apply_last: u32,
    /// Whether state jumps across a gap via a bucket snapshot first.
    pub apply_buckets: bool,
    /// Checkpoint boundary the snapshot lands on, when buckets apply.
    pub bucket_apply_at: Option<u32>,
    /// Checkpoints whose header files are downloaded and chain-verified.
    pub verify_range: CheckpointRange,
    /// Checkpoints whose transaction files are downloaded for replay.
    pub apply_checkpoints: CheckpointRange,
}

impl CatchupPlan {
    /// Fix the plan for catching up from `lcl` under `config`.
    ///
    /// The caller caps `config.to_ledger` to the newest checkpoint fully
    /// present in the archive before planning.
    pub fn plan(
        lcl: u32,
        config: &CatchupConfiguration,
        frequency: CheckpointFrequency,
    ) -> Result<Self, PlanError> {
        let apply_last = config.to_ledger;
        if apply_last <= lcl {
            return Err(PlanError::TargetNotAhead {
                target: apply_last,
                lcl,
            });
        }

        let (apply_first, bucket_apply_at) = match config.recent {
            // Complete replay: walk the whole gap, no snapshot.
            None => (lcl + 1, None),
            Some(recent) => {
                let floor = apply_last.saturating_sub(recent).saturating_add(1);
                let want = (lcl + 1).max(floor.min(apply_last));
                if want == lcl + 1 {
                    (lcl + 1, None)
                } else {
                    // The snapshot must land on a checkpoint boundary; widen
                    // the replay window down to just past the boundary. When
                    // the boundary is at or behind the LCL, replaying from
                    // the LCL is cheaper than any snapshot.
                    match frequency.checkpoint_before(want) {
                        Some(boundary) if boundary > lcl => (boundary + 1, Some(boundary)),
                        _ => (lcl + 1, None),
                    }
                }
            }
        };
        let apply_buckets = bucket_apply_at.is_some();

        // Verification anchors one step below the replay window: at the
        // snapshot boundary (its header must be on the verified chain) or at
        // the locally trusted LCL.
        let verify_from = bucket_apply_at.unwrap_or(lcl + 1);
        let verify_range =
            frequency.checkpoints_containing(LedgerRange::inclusive(verify_from, apply_last));
        let apply_checkpoints =
            frequency.checkpoints_containing(LedgerRange::inclusive(apply_first, apply_last));

        Ok(Self {
            apply_first,
            apply_last,
            apply_buckets,
            bucket_apply_at,
            verify_range,
            apply_checkpoints,
        })
    }

    /// The ledgers handed to the ledger manager's close operation.
    #[must_use]
    pub fn replay_range(&self) -> LedgerRange {
        LedgerRange::inclusive(self.apply_first, self.apply_last)
    }

    /// Predict the exact work a successful run of this plan performs.
    ///
    /// One archive state is always fetched as the trust anchor; the bucket
    /// snapshot needs a second one only when its boundary sits in an older
    /// checkpoint than the target.
    #[must_use]
    pub fn performed_work(&self) -> CatchupPerformedWork {
        let extra_state = self.apply_buckets && self.verify_range.count() > 1;
        CatchupPerformedWork {
            has_downloaded: 1 + u64::from(extra_state),
            ledgers_downloaded: u64::from(self.verify_range.ledger_count()),
            ledgers_verified: u64::from(self.verify_range.ledger_count()),
            chain_verify_failures: 0,
            buckets_downloaded: self.apply_buckets,
            buckets_applied: self.apply_buckets,
            tx_downloaded: u64::from(self.apply_checkpoints.ledger_count()),
            tx_applied: u64::from(self.replay_range().count()),
        }
    }
}
