//! The ledger manager state machine.
//!
//! History interacts with ledger close through three operations:
//! `close_ledger` (apply a transaction set on top of the LCL),
//! `value_externalized` (a value arrived from the network — close it, buffer
//! it, or decide that catchup is needed), and the snapshot installation used
//! by bucket-apply catchup. The manager also retains the header and
//! transaction history that the publish pipeline reads back out.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use super::{AccountEntry, LedgerCloseData, LedgerError, LedgerHeaderHistoryEntry, Operation, TxSet};
use crate::buckets::BucketManager;
use crate::checkpoint::{CheckpointFrequency, GENESIS_LEDGER};
use crate::hash::Hash256;

/// The account funding all `CreateAccount` operations.
pub const ROOT_ACCOUNT: &str = "root";
pub const ROOT_STARTING_BALANCE: i64 = 1_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerState {
    /// Fresh node; nothing closed beyond genesis.
    Booting,
    /// Closing externalized ledgers as they arrive.
    Synced,
    /// Out of sync; buffering externalized ledgers while catchup runs.
    CatchingUp,
    /// Catchup applied; waiting for a closing ledger to knit the buffer up.
    WaitingForClosingLedger,
}

/// What the caller should do with an externalized value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExternalizeOutcome {
    /// The buffer now starts at `lcl + 1`: close ledgers out of it.
    ShouldDrain,
    /// Buffered for later; nothing to do yet.
    Buffered,
    /// Enough of a new checkpoint has been seen; start online catchup.
    TriggerCatchup { target: u32 },
    /// At or below the LCL; dropped.
    Ignored,
}

pub struct LedgerManager {
    state: LedgerState,
    version: u32,
    frequency: CheckpointFrequency,
    lcl: LedgerHeaderHistoryEntry,
    accounts: FxHashMap<String, AccountEntry>,
    headers: FxHashMap<u32, LedgerHeaderHistoryEntry>,
    tx_history: FxHashMap<u32, LedgerCloseData>,
    buffered: BTreeMap<u32, LedgerCloseData>,
    catchup_triggered: bool,
}

impl LedgerManager {
    /// Start from the built-in genesis ledger.
    ///
    /// Genesis closes an empty transaction set over the root account; the
    /// root entry lands in the bucket list so a later bucket apply can
    /// rebuild it like any other account.
    pub fn genesis(
        frequency: CheckpointFrequency,
        version: u32,
        buckets: &mut BucketManager,
    ) -> Self {
        let root = AccountEntry {
            account: ROOT_ACCOUNT.to_string(),
            balance: ROOT_STARTING_BALANCE,
            seqnum: 0,
        };
        let bucket_list_hash = buckets.add_batch(GENESIS_LEDGER, std::slice::from_ref(&root));
        let lcl = LedgerHeaderHistoryEntry::new(
            GENESIS_LEDGER,
            Hash256::ZERO,
            bucket_list_hash,
            GENESIS_LEDGER as u64,
            version,
        );
        let genesis_close = LedgerCloseData {
            ledger_seq: GENESIS_LEDGER,
            close_time: GENESIS_LEDGER as u64,
            tx_set: TxSet::default(),
        };
        let mut accounts = FxHashMap::default();
        accounts.insert(root.account.clone(), root);
        Self {
            state: LedgerState::Booting,
            version,
            frequency,
            accounts,
            headers: FxHashMap::from_iter([(GENESIS_LEDGER, lcl.clone())]),
            tx_history: FxHashMap::from_iter([(GENESIS_LEDGER, genesis_close)]),
            buffered: BTreeMap::new(),
            catchup_triggered: false,
            lcl,
        }
    }

    /// Start from a trusted header and the account state rebuilt from its
    /// bucket list, instead of the built-in genesis.
    ///
    /// This is the `USE_CONFIG_FOR_GENESIS = false` path: the caller has
    /// already verified the header against an archive state and replayed
    /// its buckets into `accounts`.
    pub fn from_snapshot(
        frequency: CheckpointFrequency,
        version: u32,
        header: LedgerHeaderHistoryEntry,
        accounts: FxHashMap<String, AccountEntry>,
    ) -> Self {
        Self {
            state: LedgerState::Booting,
            version,
            frequency,
            accounts,
            headers: FxHashMap::from_iter([(header.ledger_seq, header.clone())]),
            tx_history: FxHashMap::default(),
            buffered: BTreeMap::new(),
            catchup_triggered: false,
            lcl: header,
        }
    }

    #[must_use]
    pub fn state(&self) -> LedgerState {
        self.state
    }

    pub fn set_state(&mut self, state: LedgerState) {
        if state != LedgerState::CatchingUp {
            self.catchup_triggered = false;
        }
        self.state = state;
    }

    #[must_use]
    pub fn last_closed(&self) -> &LedgerHeaderHistoryEntry {
        &self.lcl
    }

    #[must_use]
    pub fn protocol_version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn header(&self, ledger_seq: u32) -> Option<&LedgerHeaderHistoryEntry> {
        self.headers.get(&ledger_seq)
    }

    #[must_use]
    pub fn close_data(&self, ledger_seq: u32) -> Option<&LedgerCloseData> {
        self.tx_history.get(&ledger_seq)
    }

    #[must_use]
    pub fn account(&self, account: &str) -> Option<&AccountEntry> {
        self.accounts.get(account)
    }

    #[must_use]
    pub fn buffered_is_empty(&self) -> bool {
        self.buffered.is_empty()
    }

    /// Close one ledger on top of the LCL.
    pub fn close_ledger(
        &mut self,
        data: &LedgerCloseData,
        buckets: &mut BucketManager,
    ) -> Result<LedgerHeaderHistoryEntry, LedgerError> {
        let expected = self.lcl.ledger_seq + 1;
        if data.ledger_seq != expected {
            return Err(LedgerError::UnexpectedSequence {
                expected,
                got: data.ledger_seq,
            });
        }
        let changed = self.apply_tx_set(&data.tx_set)?;
        let bucket_list_hash = buckets.add_batch(data.ledger_seq, &changed);
        let header = LedgerHeaderHistoryEntry::new(
            data.ledger_seq,
            self.lcl.hash,
            bucket_list_hash,
            data.close_time,
            self.version,
        );
        debug!(ledger = data.ledger_seq, hash = %header.hash, "closed ledger");
        self.headers.insert(data.ledger_seq, header.clone());
        self.tx_history.insert(data.ledger_seq, data.clone());
        self.lcl = header.clone();
        if self.state == LedgerState::Booting {
            self.state = LedgerState::Synced;
        }
        Ok(header)
    }

    /// Apply a transaction set, all-or-nothing, returning the changed
    /// account post-states sorted by account id.
    fn apply_tx_set(&mut self, tx_set: &TxSet) -> Result<Vec<AccountEntry>, LedgerError> {
        let mut working = self.accounts.clone();
        let mut touched: Vec<String> = Vec::new();
        for op in &tx_set.ops {
            match op {
                Operation::CreateAccount { account, balance } => {
                    if working.contains_key(account) {
                        return Err(LedgerError::AccountExists {
                            account: account.clone(),
                        });
                    }
                    Self::debit(&mut working, ROOT_ACCOUNT, *balance)?;
                    working.insert(
                        account.clone(),
                        AccountEntry {
                            account: account.clone(),
                            balance: *balance,
                            seqnum: 0,
                        },
                    );
                    touched.push(ROOT_ACCOUNT.to_string());
                    touched.push(account.clone());
                }
                Operation::Payment { from, to, amount } => {
                    if !working.contains_key(to) {
                        return Err(LedgerError::NoSuchAccount { account: to.clone() });
                    }
                    Self::debit(&mut working, from, *amount)?;
                    if let Some(entry) = working.get_mut(to) {
                        entry.balance += amount;
                    }
                    touched.push(from.clone());
                    touched.push(to.clone());
                }
            }
        }
        touched.sort();
        touched.dedup();
        let changed: Vec<AccountEntry> = touched
            .iter()
            .filter_map(|account| working.get(account).cloned())
            .collect();
        self.accounts = working;
        Ok(changed)
    }

    fn debit(
        accounts: &mut FxHashMap<String, AccountEntry>,
        account: &str,
        amount: i64,
    ) -> Result<(), LedgerError> {
        let entry = accounts
            .get_mut(account)
            .ok_or_else(|| LedgerError::NoSuchAccount {
                account: account.to_string(),
            })?;
        if entry.balance < amount {
            return Err(LedgerError::InsufficientBalance {
                account: account.to_string(),
                have: entry.balance,
                need: amount,
            });
        }
        entry.balance -= amount;
        entry.seqnum += 1;
        Ok(())
    }

    /// A value arrived from the network.
    pub fn value_externalized(&mut self, data: LedgerCloseData) -> ExternalizeOutcome {
        let seq = data.ledger_seq;
        if seq <= self.lcl.ledger_seq {
            return ExternalizeOutcome::Ignored;
        }
        self.buffered.insert(seq, data);
        match self.state {
            LedgerState::Booting | LedgerState::Synced => {
                if seq == self.lcl.ledger_seq + 1 {
                    ExternalizeOutcome::ShouldDrain
                } else {
                    info!(
                        ledger = seq,
                        lcl = self.lcl.ledger_seq,
                        "externalized value ahead of LCL; buffering"
                    );
                    self.set_state(LedgerState::CatchingUp);
                    self.maybe_trigger_catchup()
                }
            }
            LedgerState::CatchingUp => self.maybe_trigger_catchup(),
            LedgerState::WaitingForClosingLedger => ExternalizeOutcome::ShouldDrain,
        }
    }

    /// Online catchup starts once the buffer proves a new checkpoint was cut
    /// on the network: the trigger is the ledger that opens the checkpoint
    /// after the one containing the first buffered ledger — which may be the
    /// first buffered ledger itself.
    fn maybe_trigger_catchup(&mut self) -> ExternalizeOutcome {
        if self.catchup_triggered {
            return ExternalizeOutcome::Buffered;
        }
        let (Some(first), Some(last)) = (
            self.buffered.keys().next().copied(),
            self.buffered.keys().next_back().copied(),
        ) else {
            return ExternalizeOutcome::Buffered;
        };
        let trigger = if self.frequency.is_first_ledger_in_checkpoint(first) {
            first
        } else {
            self.frequency.checkpoint_containing(first) + 1
        };
        if last >= trigger {
            self.catchup_triggered = true;
            ExternalizeOutcome::TriggerCatchup {
                target: trigger - 1,
            }
        } else {
            ExternalizeOutcome::Buffered
        }
    }

    /// Pop the buffered entry for `lcl + 1`, if present.
    pub fn take_next_buffered(&mut self) -> Option<LedgerCloseData> {
        let next = self.lcl.ledger_seq + 1;
        self.buffered.remove(&next)
    }

    /// Drop buffered entries at or below the LCL (stale after catchup).
    pub fn discard_stale_buffered(&mut self) {
        let lcl = self.lcl.ledger_seq;
        self.buffered.retain(|seq, _| *seq > lcl);
    }

    /// Atomic state jump used by bucket-apply catchup: adopt a verified
    /// header and the account state rebuilt from its bucket list.
    pub fn install_snapshot(
        &mut self,
        header: LedgerHeaderHistoryEntry,
        accounts: FxHashMap<String, AccountEntry>,
    ) {
        info!(ledger = header.ledger_seq, "installing bucket snapshot");
        self.headers.insert(header.ledger_seq, header.clone());
        self.lcl = header;
        self.accounts = accounts;
    }
}
