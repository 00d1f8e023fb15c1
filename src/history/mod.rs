//! History archive state and file codecs.
//!
//! A [`HistoryArchiveState`] (HAS) is the root of trust for one checkpoint:
//! the checkpoint's ledger sequence plus the bucket-list manifest at that
//! ledger. It serialises to canonical JSON — the same text the durable
//! publish queue persists and the archive hosts.
//!
//! The file codecs frame ledger-header and transaction history as gzipped
//! JSON lines; the verifier decompresses in memory.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use miette::Diagnostic;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buckets::BucketList;
use crate::hash::Hash256;
use crate::ledger::{LedgerCloseData, LedgerHeaderHistoryEntry};

/// Snapshot descriptor for one checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryArchiveState {
    pub version: u32,
    pub current_ledger: u32,
    /// Level hashes, freshest first; the zero hash marks an empty level.
    pub buckets: Vec<Hash256>,
}

impl HistoryArchiveState {
    /// Capture the live bucket list at `current_ledger`.
    #[must_use]
    pub fn capture(current_ledger: u32, version: u32, list: &BucketList) -> Self {
        Self {
            version,
            current_ledger,
            buckets: list.level_hashes(),
        }
    }

    /// The non-zero bucket hashes this state references.
    #[must_use]
    pub fn bucket_hashes(&self) -> FxHashSet<Hash256> {
        self.buckets.iter().filter(|h| !h.is_zero()).copied().collect()
    }

    /// Digest over the manifest, used to tie header chains to bucket state.
    #[must_use]
    pub fn bucket_list_hash(&self) -> Hash256 {
        let parts: Vec<&[u8]> = self.buckets.iter().map(|h| &h.0[..]).collect();
        Hash256::of_parts(&parts)
    }

    /// Canonical serialisation, as persisted and archived.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("archive state serialises")
    }

    pub fn from_json(raw: &str) -> Result<Self, HistoryFileError> {
        serde_json::from_str(raw).map_err(|e| HistoryFileError::Malformed {
            what: "archive state",
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum HistoryFileError {
    #[error("corrupted gzip stream: {message}")]
    #[diagnostic(
        code(chronicle::history::corrupted),
        help("The archive served a truncated or damaged file; retry or switch archives.")
    )]
    CorruptedGzip { message: String },

    #[error("malformed {what}: {message}")]
    #[diagnostic(code(chronicle::history::malformed))]
    Malformed {
        what: &'static str,
        message: String,
    },

    #[error("i/o while coding history file: {0}")]
    #[diagnostic(code(chronicle::history::io))]
    Io(#[from] std::io::Error),
}

/// Gzip a byte buffer.
pub fn gzip_bytes(bytes: &[u8]) -> Result<Vec<u8>, HistoryFileError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Decompress a gzip buffer fully in memory.
pub fn gunzip_bytes(bytes: &[u8]) -> Result<Vec<u8>, HistoryFileError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| HistoryFileError::CorruptedGzip {
            message: e.to_string(),
        })?;
    Ok(out)
}

fn encode_lines<T: Serialize>(items: &[T]) -> Result<Vec<u8>, HistoryFileError> {
    let mut out = Vec::new();
    for item in items {
        let line = serde_json::to_string(item).map_err(|e| HistoryFileError::Malformed {
            what: "history record",
            message: e.to_string(),
        })?;
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
    }
    gzip_bytes(&out)
}

fn decode_lines<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
    what: &'static str,
) -> Result<Vec<T>, HistoryFileError> {
    let raw = gunzip_bytes(bytes)?;
    let text = String::from_utf8(raw).map_err(|e| HistoryFileError::Malformed {
        what,
        message: e.to_string(),
    })?;
    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| HistoryFileError::Malformed {
                what,
                message: e.to_string(),
            })
        })
        .collect()
}

/// Frame one checkpoint's ledger headers, ascending.
pub fn encode_header_file(
    headers: &[LedgerHeaderHistoryEntry],
) -> Result<Vec<u8>, HistoryFileError> {
    encode_lines(headers)
}

pub fn decode_header_file(bytes: &[u8]) -> Result<Vec<LedgerHeaderHistoryEntry>, HistoryFileError> {
    decode_lines(bytes, "ledger header entry")
}

/// Frame one checkpoint's transaction sets, ascending by ledger.
pub fn encode_tx_file(entries: &[LedgerCloseData]) -> Result<Vec<u8>, HistoryFileError> {
    encode_lines(entries)
}

pub fn decode_tx_file(bytes: &[u8]) -> Result<Vec<LedgerCloseData>, HistoryFileError> {
    decode_lines(bytes, "transaction history entry")
}

/// Frame the HAS itself for archive hosting.
pub fn encode_state_file(state: &HistoryArchiveState) -> Result<Vec<u8>, HistoryFileError> {
    gzip_bytes(state.to_json().as_bytes())
}

pub fn decode_state_file(bytes: &[u8]) -> Result<HistoryArchiveState, HistoryFileError> {
    let raw = gunzip_bytes(bytes)?;
    let text = String::from_utf8(raw).map_err(|e| HistoryFileError::Malformed {
        what: "archive state",
        message: e.to_string(),
    })?;
    HistoryArchiveState::from_json(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hash256;

    #[test]
    fn state_json_roundtrip() {
        let state = HistoryArchiveState {
            version: 1,
            current_ledger: 39,
            buckets: vec![Hash256::of(b"l0"), Hash256::ZERO, Hash256::of(b"l2")],
        };
        let back = HistoryArchiveState::from_json(&state.to_json()).unwrap();
        assert_eq!(state, back);
        assert_eq!(back.bucket_hashes().len(), 2);
    }

    #[test]
    fn gzip_roundtrip_and_corruption() {
        let compressed = gzip_bytes(b"history").unwrap();
        assert_eq!(gunzip_bytes(&compressed).unwrap(), b"history");
        let err = gunzip_bytes(&compressed[..4]).unwrap_err();
        assert!(matches!(err, HistoryFileError::CorruptedGzip { .. }));
    }

    #[test]
    fn header_file_roundtrip() {
        let headers: Vec<_> = (1..=3u32)
            .scan(Hash256::ZERO, |prev, seq| {
                let header = crate::ledger::LedgerHeaderHistoryEntry::new(
                    seq,
                    *prev,
                    Hash256::of(b"bl"),
                    seq as u64,
                    1,
                );
                *prev = header.hash;
                Some(header)
            })
            .collect();
        let file = encode_header_file(&headers).unwrap();
        let back = decode_header_file(&file).unwrap();
        assert_eq!(headers, back);
        for pair in back.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].hash);
        }
    }
}
