// Notary: the single serialisation point for record consumption.
// A fully signed transaction is certified only if none of its inputs was consumed before.

use crate::identity::{Hash, LocalIdentity, Party, PublicKey};
use crate::record::RecordRef;
use crate::storage::JsonSnapshotStore;
use crate::transaction::{NotarisedTransaction, SignatureCheckError, SignedTransaction};
use hex::encode as hex_encode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// An input that another certified transaction already consumed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConflict {
    pub reference: RecordRef,
    pub consumed_by: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotaryError {
    #[error("{}", describe_conflict(.tx_id, .conflicts))]
    ConflictingInput {
        tx_id: Hash,
        conflicts: Vec<StateConflict>,
    },
    #[error("transaction is missing signatures from {0:?}")]
    MissingSignatures(Vec<String>),
    #[error("invalid signature from {0}")]
    InvalidSignature(String),
    #[error("transaction names notary {0}, not this notary")]
    WrongNotary(String),
    #[error("notary unavailable: {0}")]
    Unavailable(String),
}

fn describe_conflict(tx_id: &Hash, conflicts: &[StateConflict]) -> String {
    if conflicts.is_empty() {
        return format!("transaction {} was already notarised", hex_encode(tx_id));
    }
    let refs: Vec<String> = conflicts
        .iter()
        .map(|c| format!("{} consumed by {}", c.reference, hex_encode(c.consumed_by)))
        .collect();
    format!(
        "conflicting input in transaction {}: {}",
        hex_encode(tx_id),
        refs.join(", ")
    )
}

/// Something a flow can ask for certification.
pub trait NotaryService: Send + Sync {
    fn notary_party(&self) -> &Party;

    fn notarise(&self, stx: &SignedTransaction) -> Result<NotarisedTransaction, NotaryError>;
}

#[derive(Debug, Default)]
struct NotaryState {
    consumed: HashMap<RecordRef, Hash>,
    certified: HashSet<Hash>,
}

#[derive(Serialize, Deserialize)]
struct PersistedNotary {
    consumed: Vec<StateConflict>,
    certified: Vec<Hash>,
}

#[derive(Debug)]
pub struct Notary {
    identity: LocalIdentity,
    state: Mutex<NotaryState>,
    store: Option<JsonSnapshotStore>,
}

impl Notary {
    pub fn new(identity: LocalIdentity) -> Self {
        Self {
            identity,
            state: Mutex::new(NotaryState::default()),
            store: None,
        }
    }

    /// A notary whose consumed set survives restarts under `data_dir`.
    pub fn open<P: AsRef<Path>>(identity: LocalIdentity, data_dir: P) -> Result<Self, String> {
        let store = JsonSnapshotStore::new(data_dir, "notary_snapshot.json")?;
        let mut state = NotaryState::default();
        if let Some(persisted) = store.load::<PersistedNotary>()? {
            for c in persisted.consumed {
                state.consumed.insert(c.reference, c.consumed_by);
            }
            state.certified.extend(persisted.certified);
        }
        Ok(Self {
            identity,
            state: Mutex::new(state),
            store: Some(store),
        })
    }

    pub fn key(&self) -> PublicKey {
        self.identity.key()
    }

    pub fn is_consumed(&self, reference: &RecordRef) -> bool {
        self.state.lock().consumed.contains_key(reference)
    }

    fn check_signatures(&self, stx: &SignedTransaction) -> Result<(), NotaryError> {
        if stx.tx.notary != self.identity.key() {
            return Err(NotaryError::WrongNotary(hex_encode(stx.tx.notary)));
        }
        stx.verify_required_signatures().map_err(|e| match e {
            SignatureCheckError::Missing(keys) => {
                NotaryError::MissingSignatures(keys.iter().map(hex_encode).collect())
            }
            SignatureCheckError::Invalid(k) | SignatureCheckError::Unexpected(k) => {
                NotaryError::InvalidSignature(hex_encode(k))
            }
        })
    }

    fn persist(&self, state: &NotaryState) -> Result<(), String> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut consumed: Vec<StateConflict> = state
            .consumed
            .iter()
            .map(|(reference, consumed_by)| StateConflict {
                reference: *reference,
                consumed_by: *consumed_by,
            })
            .collect();
        consumed.sort_by_key(|c| c.reference);
        let mut certified: Vec<Hash> = state.certified.iter().copied().collect();
        certified.sort_unstable();
        store.save(&PersistedNotary {
            consumed,
            certified,
        })
    }
}

impl NotaryService for Notary {
    fn notary_party(&self) -> &Party {
        self.identity.party()
    }

    fn notarise(&self, stx: &SignedTransaction) -> Result<NotarisedTransaction, NotaryError> {
        self.check_signatures(stx)?;
        let tx_id = stx.id();
        let inputs = stx.tx.input_refs();

        // Check and commit under one lock: this is the at-most-one-winner guarantee.
        let mut state = self.state.lock();
        let conflicts: Vec<StateConflict> = inputs
            .iter()
            .filter_map(|r| {
                state.consumed.get(r).map(|by| StateConflict {
                    reference: *r,
                    consumed_by: *by,
                })
            })
            .collect();
        if !conflicts.is_empty() || state.certified.contains(&tx_id) {
            warn!(tx_id = %hex_encode(tx_id), conflicts = conflicts.len(), "notarisation rejected");
            return Err(NotaryError::ConflictingInput { tx_id, conflicts });
        }
        for r in &inputs {
            state.consumed.insert(*r, tx_id);
        }
        state.certified.insert(tx_id);
        // Nothing is certified unless the consumed set reached disk.
        if let Err(e) = self.persist(&state) {
            for r in &inputs {
                state.consumed.remove(r);
            }
            state.certified.remove(&tx_id);
            warn!(tx_id = %hex_encode(tx_id), error = %e, "notary snapshot save failed");
            return Err(NotaryError::Unavailable(format!("notary snapshot: {}", e)));
        }
        drop(state);

        info!(tx_id = %hex_encode(tx_id), "transaction notarised");
        Ok(NotarisedTransaction {
            stx: stx.clone(),
            notary_sig: self.identity.sign(&tx_id),
        })
    }
}
