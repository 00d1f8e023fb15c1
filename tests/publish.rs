//! Publish queue and pipeline behaviour.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{CatchupSimulation, MemoryArchive, TEST_TIMEOUT};

use chronicle::app::App;
use chronicle::archive::{checkpoint_path, Archive, FileCategory};
use chronicle::config::Config;
use chronicle::status::StatusCategory;

#[tokio::test]
async fn checkpoints_queue_on_boundaries_and_pin_their_buckets() {
    let mut sim = CatchupSimulation::new(21).await;
    sim.generate(23).await;

    let mut history = sim.app.context().history.lock().await;
    let states = history.snapshot_states().await.unwrap();
    let ledgers: Vec<u32> = states.iter().map(|(l, _)| *l).collect();
    assert_eq!(ledgers, vec![7, 15, 23]);

    // Every bucket any queued state references is pinned.
    let referenced = history.referenced_buckets().clone();
    for (_, state) in &states {
        for hash in state.bucket_hashes() {
            assert!(referenced.contains(&hash), "bucket {hash} not pinned");
        }
    }

    // Nothing pinned is missing once merges resolve.
    drop(history);
    let mut buckets = sim.app.context().buckets.lock().await;
    buckets.resolve_futures().await.unwrap();
    let mut history = sim.app.context().history.lock().await;
    assert!(history.missing_buckets(&buckets.store).is_empty());
}

#[tokio::test]
async fn queue_survives_restart_and_rebuilds_references() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("publish.db").display()
    );
    let archive = MemoryArchive::new("main");
    let config = || Config {
        artificially_accelerate_time_for_testing: true,
        database_url: url.clone(),
        ..Config::default()
    };

    let states = {
        let mut sim = CatchupSimulation::new(3).await;
        // Rebuild the generating node against the file-backed database.
        sim.app = App::build(
            config(),
            vec![Arc::new(archive.clone()) as Arc<dyn Archive>],
        )
        .await
        .unwrap();
        sim.generate(15).await;
        let history = sim.app.context().history.lock().await;
        history.snapshot_states().await.unwrap()
    };
    assert_eq!(states.len(), 2);

    // A fresh node over the same database sees the same queue, with bucket
    // references rebuilt before anything else touches the store.
    let restarted = App::build(config(), vec![Arc::new(archive) as Arc<dyn Archive>])
        .await
        .unwrap();
    let mut history = restarted.context().history.lock().await;
    let restored = history.snapshot_states().await.unwrap();
    assert_eq!(restored, states);
    let referenced = history.referenced_buckets();
    for (_, state) in &restored {
        for hash in state.bucket_hashes() {
            assert!(referenced.contains(&hash));
        }
    }
}

#[tokio::test]
async fn publishing_drains_the_queue_in_ledger_order() {
    let mut sim = CatchupSimulation::new(5).await;
    sim.generate(47).await;
    sim.publish_all().await;

    let metrics = &sim.app.context().metrics;
    assert_eq!(metrics.publish.success_count(), 6);
    assert_eq!(metrics.publish.failure_count(), 0);
    let history = sim.app.context().history.lock().await;
    assert_eq!(history.queue_len().await.unwrap(), 0);
    drop(history);

    // Entries published strictly ascending, one at a time.
    let state_puts: Vec<String> = sim
        .archive
        .put_log()
        .into_iter()
        .filter(|p| p.starts_with("history/"))
        .collect();
    let expected: Vec<String> = [7u32, 15, 23, 31, 39, 47]
        .iter()
        .map(|l| checkpoint_path(FileCategory::History, *l))
        .collect();
    assert_eq!(state_puts, expected);

    // Checkpoint files are all hosted.
    for ledger in [7u32, 15, 23, 31, 39, 47] {
        for category in [
            FileCategory::History,
            FileCategory::Ledger,
            FileCategory::Transactions,
        ] {
            assert!(
                sim.archive.has_file(&checkpoint_path(category, ledger)),
                "missing {category:?} for {ledger}"
            );
        }
    }
}

#[tokio::test]
async fn a_failed_publish_halts_the_pipeline_until_cleared() {
    let mut sim = CatchupSimulation::new(11).await;
    sim.generate(7).await;
    sim.archive.fail_puts(true);

    sim.app
        .crank_until(|view| view.publish_halted, TEST_TIMEOUT)
        .await
        .unwrap();

    let metrics = &sim.app.context().metrics;
    assert_eq!(metrics.publish.failure_count(), 1);
    assert_eq!(metrics.publish.success_count(), 0);
    let history = sim.app.context().history.lock().await;
    // The row stays for inspection; nothing new is scheduled.
    assert_eq!(history.queue_len().await.unwrap(), 1);
    assert!(history.is_halted());
    drop(history);
    let status = sim
        .app
        .context()
        .status
        .latest(StatusCategory::HistoryPublish)
        .expect("failure surfaced");
    assert!(status.contains("failed"), "status was: {status}");

    // Operator clears the halt; the entry publishes on the next cranks.
    sim.archive.fail_puts(false);
    sim.app.context().history.lock().await.clear_halt();
    sim.app
        .crank_until(|view| view.publish_queue_len == 0, TEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(sim.app.context().metrics.publish.success_count(), 1);
}

#[tokio::test]
async fn initializing_an_archive_seeds_its_root_state() {
    let sim = CatchupSimulation::new(19).await;
    sim.app.initialize_archives().await.unwrap();

    let scratch = sim.app.context().tmp.scratch_dir("check-").unwrap();
    let root = chronicle::archive::fetch_root_state(&sim.archive, &scratch)
        .await
        .unwrap();
    assert_eq!(root.current_ledger, 1);
    assert_eq!(root.bucket_list_hash(), sim.app.last_closed().await.bucket_list_hash);
}

#[tokio::test]
async fn no_writable_archive_means_nothing_queues() {
    let archive = MemoryArchive::new("main").read_only_view("ro");
    let config = Config {
        artificially_accelerate_time_for_testing: true,
        ..Config::default()
    };
    let mut app = App::build(config, vec![Arc::new(archive) as Arc<dyn Archive>])
        .await
        .unwrap();
    let mut sim = CatchupSimulation::new(13).await;
    sim.generate(7).await;
    for seq in 2..=7 {
        app.close_ledger(&sim.close_data(seq)).await.unwrap();
    }
    assert_eq!(
        app.context()
            .history
            .lock()
            .await
            .queue_len()
            .await
            .unwrap(),
        0
    );
    app.crank_until(|_| true, Duration::from_secs(5)).await.unwrap();
}
