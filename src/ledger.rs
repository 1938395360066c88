// Local ledger view of one party: finalised transactions, the records they produced,
// and which of those records have since been consumed.

use crate::identity::Hash;
use crate::record::{LoanStatus, RecordRef, StateAndRef};
use crate::storage::JsonSnapshotStore;
use crate::transaction::NotarisedTransaction;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("transaction already recorded")]
    Duplicate,
    #[error("record {0} already consumed")]
    AlreadyConsumed(RecordRef),
    #[error("storage: {0}")]
    Storage(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RecordFilter {
    #[default]
    Unconsumed,
    Consumed,
    All,
}

#[derive(Debug, Default)]
pub struct LocalLedger {
    transactions: HashMap<Hash, NotarisedTransaction>,
    /// Recording order, for deterministic replay and listing.
    order: Vec<Hash>,
    records: BTreeMap<RecordRef, StateAndRef>,
    consumed: HashSet<RecordRef>,
}

impl LocalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a certified transaction:
    /// - reject a transaction id seen before
    /// - reject inputs already spent in this view
    /// - mark inputs consumed, add outputs as unconsumed
    pub fn try_record(&mut self, ntx: NotarisedTransaction) -> Result<Vec<RecordRef>, LedgerError> {
        let id = ntx.id();
        if self.transactions.contains_key(&id) {
            return Err(LedgerError::Duplicate);
        }
        let tx = ntx.tx();
        for input in tx.input_refs() {
            if self.consumed.contains(&input) {
                return Err(LedgerError::AlreadyConsumed(input));
            }
        }

        for input in tx.input_refs() {
            self.consumed.insert(input);
        }
        let refs = tx.output_refs();
        for (reference, state) in refs.iter().zip(tx.outputs.iter()) {
            self.records.insert(
                *reference,
                StateAndRef {
                    state: state.clone(),
                    reference: *reference,
                },
            );
        }
        self.order.push(id);
        self.transactions.insert(id, ntx);
        Ok(refs)
    }

    pub fn get_transaction(&self, id: &Hash) -> Option<&NotarisedTransaction> {
        self.transactions.get(id)
    }

    pub fn is_consumed(&self, reference: &RecordRef) -> bool {
        self.consumed.contains(reference)
    }

    pub fn records(&self, filter: RecordFilter) -> Vec<StateAndRef> {
        self.records
            .values()
            .filter(|r| match filter {
                RecordFilter::Unconsumed => !self.consumed.contains(&r.reference),
                RecordFilter::Consumed => self.consumed.contains(&r.reference),
                RecordFilter::All => true,
            })
            .cloned()
            .collect()
    }

    /// The unconsumed record with `status`, only when it is the single match.
    pub fn find_unconsumed(&self, status: &LoanStatus) -> Option<StateAndRef> {
        let mut found = self
            .records
            .values()
            .filter(|r| &r.state.status == status && !self.consumed.contains(&r.reference));
        let first = found.next()?;
        if found.next().is_some() {
            return None;
        }
        Some(first.clone())
    }

    /// Undoes the most recent `try_record` of `id`. Its inputs were unconsumed
    /// and its outputs unknown before, so removing them restores the prior view.
    fn forget_last(&mut self, id: &Hash) {
        if self.order.last() != Some(id) {
            return;
        }
        self.order.pop();
        if let Some(ntx) = self.transactions.remove(id) {
            let tx = ntx.tx();
            for input in tx.input_refs() {
                self.consumed.remove(&input);
            }
            for reference in tx.output_refs() {
                self.records.remove(&reference);
            }
        }
    }

    /// Finalised transactions in recording order.
    pub fn transactions(&self) -> Vec<NotarisedTransaction> {
        self.order
            .iter()
            .filter_map(|id| self.transactions.get(id).cloned())
            .collect()
    }
}

/// Persistence and query seam the flows call through.
pub trait RecordStore: Send + Sync {
    fn record_transaction(&self, ntx: &NotarisedTransaction) -> Result<Vec<RecordRef>, LedgerError>;

    fn find_unconsumed(&self, status: &LoanStatus) -> Option<StateAndRef>;

    fn records(&self, filter: RecordFilter) -> Vec<StateAndRef>;
}

#[derive(Serialize, Deserialize)]
struct PersistedVault {
    transactions: Vec<NotarisedTransaction>,
}

/// Thread-safe ledger with an optional JSON snapshot on disk.
#[derive(Debug, Default)]
pub struct Vault {
    ledger: RwLock<LocalLedger>,
    store: Option<JsonSnapshotStore>,
}

impl Vault {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens (or creates) a vault under `data_dir`, replaying any saved transactions.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, LedgerError> {
        let store = JsonSnapshotStore::new(data_dir, "vault_snapshot.json").map_err(LedgerError::Storage)?;
        let mut ledger = LocalLedger::new();
        if let Some(persisted) = store
            .load::<PersistedVault>()
            .map_err(LedgerError::Storage)?
        {
            for ntx in persisted.transactions {
                if ntx.verify().is_err() {
                    return Err(LedgerError::Storage(
                        "snapshot holds a transaction with invalid signatures".into(),
                    ));
                }
                ledger.try_record(ntx)?;
            }
            debug!(path = %store.path().display(), "vault restored from snapshot");
        }
        Ok(Self {
            ledger: RwLock::new(ledger),
            store: Some(store),
        })
    }

    pub fn get_transaction(&self, id: &Hash) -> Option<NotarisedTransaction> {
        self.ledger.read().get_transaction(id).cloned()
    }

    pub fn is_consumed(&self, reference: &RecordRef) -> bool {
        self.ledger.read().is_consumed(reference)
    }
}

impl RecordStore for Vault {
    fn record_transaction(&self, ntx: &NotarisedTransaction) -> Result<Vec<RecordRef>, LedgerError> {
        let mut ledger = self.ledger.write();
        let refs = ledger.try_record(ntx.clone())?;
        if let Some(store) = &self.store {
            let persisted = PersistedVault {
                transactions: ledger.transactions(),
            };
            if let Err(e) = store.save(&persisted) {
                ledger.forget_last(&ntx.id());
                warn!(error = %e, "vault snapshot save failed");
                return Err(LedgerError::Storage(e));
            }
        }
        Ok(refs)
    }

    fn find_unconsumed(&self, status: &LoanStatus) -> Option<StateAndRef> {
        self.ledger.read().find_unconsumed(status)
    }

    fn records(&self, filter: RecordFilter) -> Vec<StateAndRef> {
        self.ledger.read().records(filter)
    }
}
