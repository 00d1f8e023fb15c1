//! Ledger-header chain verification.
//!
//! Catchup downloads one header file per checkpoint and walks them newest
//! to oldest. Within a file every entry must hash consistently and chain to
//! its predecessor; across files the oldest entry of the newer checkpoint
//! must chain onto the newest entry of the older one; the newest checkpoint
//! ties to the trust anchor and the oldest ties to local state (the LCL or
//! the bucket-snapshot header).

use miette::Diagnostic;
use thiserror::Error;

use crate::checkpoint::CheckpointFrequency;
use crate::hash::Hash256;
use crate::ledger::LedgerHeaderHistoryEntry;

#[derive(Debug, Error, Diagnostic)]
pub enum VerifyError {
    #[error("bad hash in header chain at ledger {ledger_seq}")]
    #[diagnostic(
        code(chronicle::verify::bad_hash),
        help("The archive's header chain is inconsistent; the checkpoint cannot be trusted.")
    )]
    BadHash { ledger_seq: u32 },

    #[error("unsupported ledger version {version} at ledger {ledger_seq}")]
    #[diagnostic(code(chronicle::verify::bad_ledger_version))]
    BadLedgerVersion { ledger_seq: u32, version: u32 },

    #[error("header file for checkpoint {checkpoint} overshoots: starts at {first}, expected {expected}")]
    #[diagnostic(code(chronicle::verify::overshot))]
    Overshot {
        checkpoint: u32,
        first: u32,
        expected: u32,
    },

    #[error("header file for checkpoint {checkpoint} undershoots: ends at {last}, expected {expected}")]
    #[diagnostic(code(chronicle::verify::undershot))]
    Undershot {
        checkpoint: u32,
        last: u32,
        expected: u32,
    },

    #[error("header file for checkpoint {checkpoint} has {got} entries, expected {expected}")]
    #[diagnostic(code(chronicle::verify::missing_entries))]
    MissingEntries {
        checkpoint: u32,
        expected: u32,
        got: u32,
    },
}

/// Verify one checkpoint's header file internally.
///
/// Checks coverage of the checkpoint's exact ledger window, strict sequence
/// increments, per-entry hash consistency, and the intra-file chain.
pub fn verify_checkpoint_headers(
    headers: &[LedgerHeaderHistoryEntry],
    checkpoint: u32,
    frequency: CheckpointFrequency,
    max_version: u32,
) -> Result<(), VerifyError> {
    let expected_first = frequency.first_ledger_in_checkpoint(checkpoint);
    let expected_count = checkpoint - expected_first + 1;
    if headers.len() as u32 != expected_count {
        return Err(VerifyError::MissingEntries {
            checkpoint,
            expected: expected_count,
            got: headers.len() as u32,
        });
    }
    let first = &headers[0];
    if first.ledger_seq < expected_first {
        return Err(VerifyError::Overshot {
            checkpoint,
            first: first.ledger_seq,
            expected: expected_first,
        });
    }
    if first.ledger_seq > expected_first {
        return Err(VerifyError::Undershot {
            checkpoint,
            last: first.ledger_seq,
            expected: expected_first,
        });
    }
    let mut prev: Option<&LedgerHeaderHistoryEntry> = None;
    for header in headers {
        if header.version > max_version {
            return Err(VerifyError::BadLedgerVersion {
                ledger_seq: header.ledger_seq,
                version: header.version,
            });
        }
        if !header.hash_is_consistent() {
            return Err(VerifyError::BadHash {
                ledger_seq: header.ledger_seq,
            });
        }
        if let Some(prev) = prev {
            if header.ledger_seq != prev.ledger_seq + 1 || header.prev_hash != prev.hash {
                return Err(VerifyError::BadHash {
                    ledger_seq: header.ledger_seq,
                });
            }
        }
        prev = Some(header);
    }
    Ok(())
}

/// Verify the seam between two adjacent checkpoints.
///
/// `newer_first` is the oldest entry of the newer file; it must chain onto
/// `older_last`, the newest entry of the older file.
pub fn verify_checkpoint_seam(
    older_last: &LedgerHeaderHistoryEntry,
    newer_first: &LedgerHeaderHistoryEntry,
) -> Result<(), VerifyError> {
    if newer_first.ledger_seq != older_last.ledger_seq + 1
        || newer_first.prev_hash != older_last.hash
    {
        return Err(VerifyError::BadHash {
            ledger_seq: newer_first.ledger_seq,
        });
    }
    Ok(())
}

/// Verify that a header chains directly onto a trusted local hash.
pub fn verify_local_anchor(
    header: &LedgerHeaderHistoryEntry,
    trusted_seq: u32,
    trusted_hash: Hash256,
) -> Result<(), VerifyError> {
    if header.ledger_seq != trusted_seq + 1 || header.prev_hash != trusted_hash {
        return Err(VerifyError::BadHash {
            ledger_seq: header.ledger_seq,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const F: CheckpointFrequency = CheckpointFrequency::ACCELERATED;

    fn chain(first: u32, last: u32, prev: Hash256) -> Vec<LedgerHeaderHistoryEntry> {
        let mut headers = Vec::new();
        let mut prev_hash = prev;
        for seq in first..=last {
            let header =
                LedgerHeaderHistoryEntry::new(seq, prev_hash, Hash256::of(b"bl"), seq as u64, 1);
            prev_hash = header.hash;
            headers.push(header);
        }
        headers
    }

    #[test]
    fn a_well_formed_checkpoint_verifies() {
        let headers = chain(8, 15, Hash256::of(b"anchor"));
        verify_checkpoint_headers(&headers, 15, F, 1).unwrap();
    }

    #[test]
    fn genesis_checkpoint_has_short_coverage() {
        let headers = chain(1, 7, Hash256::ZERO);
        verify_checkpoint_headers(&headers, 7, F, 1).unwrap();
    }

    #[test]
    fn tampered_entry_is_a_bad_hash() {
        let mut headers = chain(8, 15, Hash256::of(b"anchor"));
        headers[3].close_time += 1;
        let err = verify_checkpoint_headers(&headers, 15, F, 1).unwrap_err();
        assert!(matches!(err, VerifyError::BadHash { ledger_seq: 11 }));
    }

    #[test]
    fn broken_link_is_a_bad_hash() {
        let mut headers = chain(8, 15, Hash256::of(b"anchor"));
        headers[4].prev_hash = Hash256::of(b"elsewhere");
        // Recompute so the entry is self-consistent but mis-chained.
        headers[4] = LedgerHeaderHistoryEntry::new(
            headers[4].ledger_seq,
            headers[4].prev_hash,
            headers[4].bucket_list_hash,
            headers[4].close_time,
            headers[4].version,
        );
        let err = verify_checkpoint_headers(&headers, 15, F, 1).unwrap_err();
        assert!(matches!(err, VerifyError::BadHash { ledger_seq: 12 }));
    }

    #[test]
    fn truncated_file_reports_missing_entries() {
        let headers = chain(8, 13, Hash256::of(b"anchor"));
        let err = verify_checkpoint_headers(&headers, 15, F, 1).unwrap_err();
        assert!(matches!(err, VerifyError::MissingEntries { expected: 8, got: 6, .. }));
    }

    #[test]
    fn future_protocol_versions_are_rejected() {
        let headers = chain(8, 15, Hash256::of(b"anchor"));
        let err = verify_checkpoint_headers(&headers, 15, F, 0).unwrap_err();
        assert!(matches!(err, VerifyError::BadLedgerVersion { .. }));
    }

    #[test]
    fn seams_and_local_anchors_chain() {
        let older = chain(8, 15, Hash256::of(b"anchor"));
        let newer = chain(16, 23, older.last().unwrap().hash);
        verify_checkpoint_seam(older.last().unwrap(), newer.first().unwrap()).unwrap();
        verify_local_anchor(&newer[0], 15, older.last().unwrap().hash).unwrap();
        assert!(verify_local_anchor(&newer[0], 15, Hash256::of(b"wrong")).is_err());
    }
}
