use crate::identity::{Hash, LocalIdentity, PublicKey, TransactionSignature};
use crate::record::{LoanRecord, RecordRef, StateAndRef};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    Borrow,
    Lend,
    Confirm,
}

impl Command {
    fn tag(self) -> u8 {
        match self {
            Command::Borrow => 1,
            Command::Lend => 2,
            Command::Confirm => 3,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Command::Borrow => "Borrow",
            Command::Lend => "Lend",
            Command::Confirm => "Confirm",
        };
        f.write_str(s)
    }
}

/// A command together with the keys required to sign for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub command: Command,
    pub signers: Vec<PublicKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<StateAndRef>,
    pub outputs: Vec<LoanRecord>,
    pub commands: Vec<CommandEntry>,
    pub notary: PublicKey,
}

impl Transaction {
    pub fn id(&self) -> Hash {
        tx_id(self)
    }

    pub fn input_refs(&self) -> Vec<RecordRef> {
        self.inputs.iter().map(|i| i.reference).collect()
    }

    /// Union of all command signers, first-seen order.
    pub fn required_signers(&self) -> Vec<PublicKey> {
        let mut out: Vec<PublicKey> = Vec::new();
        for cmd in &self.commands {
            for k in &cmd.signers {
                if !out.contains(k) {
                    out.push(*k);
                }
            }
        }
        out
    }

    /// References of the produced records, by output index.
    pub fn output_refs(&self) -> Vec<RecordRef> {
        let id = self.id();
        (0..self.outputs.len() as u32)
            .map(|index| RecordRef { tx_id: id, index })
            .collect()
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

pub fn record_bytes(out: &mut Vec<u8>, r: &LoanRecord) {
    out.extend_from_slice(&r.id.0);
    out.extend_from_slice(&r.amount.to_le_bytes());
    out.extend_from_slice(&r.interest_rate.to_le_bytes());
    put_bytes(out, r.borrower.name.as_bytes());
    out.extend_from_slice(&r.borrower.key);
    out.extend_from_slice(&(r.lenders.len() as u32).to_le_bytes());
    for l in &r.lenders {
        put_bytes(out, l.name.as_bytes());
        out.extend_from_slice(&l.key);
    }
    put_bytes(out, r.status.as_str().as_bytes());
}

/// Canonical encoding hashed into the transaction id. Every party must derive identical bytes.
pub fn transaction_bytes(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&crate::PROTOCOL_VERSION.to_le_bytes());
    out.extend_from_slice(&(tx.inputs.len() as u32).to_le_bytes());
    for input in &tx.inputs {
        out.extend_from_slice(&input.reference.tx_id);
        out.extend_from_slice(&input.reference.index.to_le_bytes());
        record_bytes(&mut out, &input.state);
    }
    out.extend_from_slice(&(tx.outputs.len() as u32).to_le_bytes());
    for output in &tx.outputs {
        record_bytes(&mut out, output);
    }
    out.extend_from_slice(&(tx.commands.len() as u32).to_le_bytes());
    for cmd in &tx.commands {
        out.push(cmd.command.tag());
        out.extend_from_slice(&(cmd.signers.len() as u32).to_le_bytes());
        for k in &cmd.signers {
            out.extend_from_slice(k);
        }
    }
    out.extend_from_slice(&tx.notary);
    out
}

pub fn tx_id(tx: &Transaction) -> Hash {
    let mut h = Sha256::new();
    h.update(transaction_bytes(tx));
    h.finalize().into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureCheckError {
    /// Signature present but does not verify; carries the signer key.
    Invalid(PublicKey),
    /// Signature from a key that is not a required signer.
    Unexpected(PublicKey),
    /// Required signers with no signature yet.
    Missing(Vec<PublicKey>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx: Transaction,
    pub sigs: Vec<TransactionSignature>,
}

impl SignedTransaction {
    pub fn new(tx: Transaction) -> Self {
        Self {
            tx,
            sigs: Vec::new(),
        }
    }

    pub fn id(&self) -> Hash {
        self.tx.id()
    }

    pub fn id_hex(&self) -> String {
        hex_encode(self.id())
    }

    pub fn sign_with(mut self, identity: &LocalIdentity) -> Self {
        let sig = identity.sign(&self.id());
        self.add_signature(sig);
        self
    }

    /// Adds a signature, replacing an earlier one by the same key.
    pub fn add_signature(&mut self, sig: TransactionSignature) {
        self.sigs.retain(|s| s.by != sig.by);
        self.sigs.push(sig);
    }

    pub fn signed_by(&self, key: &PublicKey) -> bool {
        self.sigs.iter().any(|s| &s.by == key)
    }

    /// Required signers without a signature, in required order.
    pub fn missing_signers(&self) -> Vec<PublicKey> {
        self.tx
            .required_signers()
            .into_iter()
            .filter(|k| !self.signed_by(k))
            .collect()
    }

    /// Checks every present signature, allowing the listed keys to be absent.
    pub fn verify_signatures_except(&self, allowed_missing: &[PublicKey]) -> Result<(), SignatureCheckError> {
        let id = self.id();
        let required = self.tx.required_signers();
        for sig in &self.sigs {
            if !required.contains(&sig.by) {
                return Err(SignatureCheckError::Unexpected(sig.by));
            }
            if !sig.is_valid_for(&id) {
                return Err(SignatureCheckError::Invalid(sig.by));
            }
        }
        let missing: Vec<PublicKey> = self
            .missing_signers()
            .into_iter()
            .filter(|k| !allowed_missing.contains(k))
            .collect();
        if !missing.is_empty() {
            return Err(SignatureCheckError::Missing(missing));
        }
        Ok(())
    }

    pub fn verify_required_signatures(&self) -> Result<(), SignatureCheckError> {
        self.verify_signatures_except(&[])
    }
}

/// A fully signed transaction certified by the notary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotarisedTransaction {
    pub stx: SignedTransaction,
    pub notary_sig: TransactionSignature,
}

impl NotarisedTransaction {
    pub fn id(&self) -> Hash {
        self.stx.id()
    }

    pub fn tx(&self) -> &Transaction {
        &self.stx.tx
    }

    /// Notary signature by the transaction's named notary, plus every participant signature.
    pub fn verify(&self) -> Result<(), SignatureCheckError> {
        let id = self.id();
        if self.notary_sig.by != self.stx.tx.notary || !self.notary_sig.is_valid_for(&id) {
            return Err(SignatureCheckError::Invalid(self.notary_sig.by));
        }
        self.stx.verify_required_signatures()
    }
}
