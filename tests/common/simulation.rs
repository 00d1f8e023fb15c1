//! Deterministic ledger generation and catchup driving.
//!
//! `CatchupSimulation` owns the generating node and the shared archive. A
//! fixed cast of accounts is created over the first few ledgers; from then
//! on every ledger carries a fixed payment plus seeded extras, so the whole
//! run is reproducible from the seed. Every close records the state the
//! validator later checks a caught-up node against.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use chronicle::app::App;
use chronicle::archive::Archive;
use chronicle::checkpoint::CheckpointFrequency;
use chronicle::config::Config;
use chronicle::hash::Hash256;
use chronicle::ledger::{LedgerCloseData, LedgerState, Operation, TxSet};

use super::archive::MemoryArchive;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the validator checks about one generated ledger.
#[derive(Clone, Debug)]
pub struct ExpectedLedger {
    pub seq: u32,
    pub hash: Hash256,
    pub bucket_list_hash: Hash256,
    pub bucket_level0: Hash256,
    pub bucket_level2: Hash256,
    pub balances: Vec<(String, i64)>,
    pub seqnums: Vec<(String, u32)>,
}

pub struct CatchupSimulation {
    pub app: App,
    pub archive: MemoryArchive,
    pub frequency: CheckpointFrequency,
    cast: Vec<String>,
    rng: StdRng,
    close_data: BTreeMap<u32, LedgerCloseData>,
    recorded: BTreeMap<u32, ExpectedLedger>,
    next_seq: u32,
}

pub fn accelerated_config() -> Config {
    Config {
        artificially_accelerate_time_for_testing: true,
        ..Config::default()
    }
}

impl CatchupSimulation {
    pub async fn new(seed: u64) -> Self {
        chronicle::telemetry::init();
        let archive = MemoryArchive::new("main");
        let config = accelerated_config();
        let frequency = config.checkpoint_frequency();
        let app = App::build(config, vec![Arc::new(archive.clone()) as Arc<dyn Archive>])
            .await
            .expect("primary node builds");
        Self {
            app,
            archive,
            frequency,
            cast: ["alice", "bob", "carol", "dan"]
                .map(String::from)
                .to_vec(),
            rng: StdRng::seed_from_u64(seed),
            close_data: BTreeMap::new(),
            recorded: BTreeMap::new(),
            next_seq: 2,
        }
    }

    fn make_ops(&mut self, seq: u32) -> Vec<Operation> {
        let cast_len = self.cast.len() as u32;
        if seq < 2 + cast_len {
            let idx = (seq - 2) as usize;
            return vec![Operation::CreateAccount {
                account: self.cast[idx].clone(),
                balance: 1_000 * i64::from(seq),
            }];
        }
        // One fixed payment per ledger, then seeded extras.
        let from = (seq % cast_len) as usize;
        let to = ((seq + 1) % cast_len) as usize;
        let mut ops = vec![Operation::Payment {
            from: self.cast[from].clone(),
            to: self.cast[to].clone(),
            amount: 1 + i64::from(seq % 7),
        }];
        for _ in 0..self.rng.random_range(0..3u32) {
            let from = self.rng.random_range(0..cast_len) as usize;
            let to = (from + 1) % self.cast.len();
            ops.push(Operation::Payment {
                from: self.cast[from].clone(),
                to: self.cast[to].clone(),
                amount: self.rng.random_range(1..10),
            });
        }
        ops
    }

    async fn record(&mut self) {
        let lcl = self.app.last_closed().await;
        let (level0, level2) = {
            let buckets = self.app.context().buckets.lock().await;
            (buckets.list().level_hash(0), buckets.list().level_hash(2))
        };
        let mut balances = Vec::new();
        let mut seqnums = Vec::new();
        for account in self.cast.clone() {
            if let Some(entry) = self.app.account(&account).await {
                balances.push((account.clone(), entry.balance));
                seqnums.push((account, entry.seqnum));
            }
        }
        self.recorded.insert(
            lcl.ledger_seq,
            ExpectedLedger {
                seq: lcl.ledger_seq,
                hash: lcl.hash,
                bucket_list_hash: lcl.bucket_list_hash,
                bucket_level0: level0,
                bucket_level2: level2,
                balances,
                seqnums,
            },
        );
    }

    /// Close ledgers up to `up_to` on the generating node, without cranking
    /// the publish pipeline.
    pub async fn generate(&mut self, up_to: u32) {
        while self.next_seq <= up_to {
            let seq = self.next_seq;
            let data = LedgerCloseData {
                ledger_seq: seq,
                close_time: u64::from(seq),
                tx_set: TxSet::new(self.make_ops(seq)),
            };
            self.app.close_ledger(&data).await.expect("close succeeds");
            self.close_data.insert(seq, data);
            self.record().await;
            self.next_seq += 1;
        }
    }

    /// Drive the publish pipeline until the queue drains.
    pub async fn publish_all(&mut self) {
        self.app
            .crank_until(|view| view.publish_queue_len == 0, TEST_TIMEOUT)
            .await
            .expect("publishing drains the queue");
    }

    pub async fn generate_and_publish(&mut self, up_to: u32) {
        self.generate(up_to).await;
        self.publish_all().await;
    }

    pub fn close_data(&self, seq: u32) -> LedgerCloseData {
        self.close_data.get(&seq).expect("ledger generated").clone()
    }

    pub fn expected(&self, seq: u32) -> &ExpectedLedger {
        self.recorded.get(&seq).expect("ledger recorded")
    }

    /// A fresh node reading the same archive, without write access.
    pub async fn new_catchup_node(&self) -> App {
        let reader = self.archive.read_only_view("main-ro");
        App::build(
            accelerated_config(),
            vec![Arc::new(reader) as Arc<dyn Archive>],
        )
        .await
        .expect("catchup node builds")
    }

    /// First ledger of the checkpoint after the one containing `seq`.
    pub fn trigger_ledger(&self, seq: u32) -> u32 {
        self.frequency.checkpoint_containing(seq) + 1
    }

    /// Drive online catchup on `node`: externalize the recorded window
    /// `[init_ledger, trigger + buffer]` (minus the optional gap), wait for
    /// the waiting-for-closing-ledger state, then supply the gap and the
    /// closing ledger. Returns the final LCL.
    pub async fn run_online_catchup(
        &mut self,
        node: &mut App,
        init_ledger: u32,
        buffer: u32,
        gap: Option<u32>,
    ) -> u32 {
        let trigger = self.trigger_ledger(init_ledger);
        for seq in init_ledger..=trigger + buffer {
            if gap == Some(seq) {
                continue;
            }
            node.value_externalized(self.close_data(seq))
                .await
                .expect("externalize accepted");
        }
        node.crank_until(
            |view| view.ledger_state == LedgerState::WaitingForClosingLedger,
            TEST_TIMEOUT,
        )
        .await
        .expect("online catchup reaches the waiting state");

        if let Some(gap) = gap {
            node.value_externalized(self.close_data(gap))
                .await
                .expect("gap ledger accepted");
        }
        let closing = trigger + buffer + 1;
        node.value_externalized(self.close_data(closing))
            .await
            .expect("closing ledger accepted");
        node.last_closed().await.ledger_seq
    }
}
