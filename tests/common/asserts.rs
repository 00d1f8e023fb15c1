//! Validation helpers shared by the catchup tests.

use chronicle::app::App;
use chronicle::archive::{bucket_path, checkpoint_path, FileCategory};
use chronicle::history::decode_state_file;

use super::archive::MemoryArchive;
use super::simulation::ExpectedLedger;

/// Check a caught-up node against the generator's record for one ledger:
/// header identity, bucket list, per-level bucket hashes, and every cast
/// account's balance and sequence number.
pub async fn validate_ledger(node: &App, expected: &ExpectedLedger) {
    let lcl = node.last_closed().await;
    assert_eq!(lcl.ledger_seq, expected.seq, "ledger sequence");
    assert_eq!(lcl.hash, expected.hash, "ledger hash");
    assert_eq!(
        lcl.bucket_list_hash, expected.bucket_list_hash,
        "bucket list hash"
    );
    {
        let buckets = node.context().buckets.lock().await;
        assert_eq!(
            buckets.list().level_hash(0),
            expected.bucket_level0,
            "level 0 bucket"
        );
        assert_eq!(
            buckets.list().level_hash(2),
            expected.bucket_level2,
            "level 2 bucket"
        );
    }
    for (account, balance) in &expected.balances {
        let entry = node
            .account(account)
            .await
            .unwrap_or_else(|| panic!("account {account} missing after catchup"));
        assert_eq!(entry.balance, *balance, "balance of {account}");
    }
    for (account, seqnum) in &expected.seqnums {
        let entry = node.account(account).await.expect("account exists");
        assert_eq!(entry.seqnum, *seqnum, "seqnum of {account}");
    }
}

/// Every bucket referenced by a hosted checkpoint state must still be on
/// the archive under its content hash.
pub async fn assert_archive_hosts_buckets(archive: &MemoryArchive, checkpoint: u32) {
    let remote = checkpoint_path(FileCategory::History, checkpoint);
    let bytes = archive
        .file_bytes(&remote)
        .unwrap_or_else(|| panic!("archive state for checkpoint {checkpoint} not hosted"));
    let state = decode_state_file(&bytes).expect("hosted state decodes");
    assert_eq!(state.current_ledger, checkpoint);
    for hash in state.bucket_hashes() {
        let remote = bucket_path(&hash);
        let hosted = archive
            .hosted_bucket_hash(&remote)
            .unwrap_or_else(|| panic!("bucket {hash} not hosted at {remote}"));
        assert_eq!(hosted, hash, "hosted bucket content hash");
    }
}
