// Loan records: one immutable version of a loan agreement between a borrower and its lenders.

use crate::identity::{Hash, Party, PublicKey};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Identifier shared by every version of the same evolving loan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinearId(pub [u8; 16]);

impl LinearId {
    /// Derives an id from arbitrary seed material (first 16 bytes of its SHA-256).
    pub fn derive(material: &[u8]) -> Self {
        let digest: Hash = Sha256::digest(material).into();
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        LinearId(out)
    }
}

impl fmt::Display for LinearId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_encode(self.0))
    }
}

/// Statuses compare by label, so `Other("Closed")` is `Closed`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LoanStatus {
    Active,
    InAuction,
    Closed,
    Other(String),
}

impl LoanStatus {
    pub fn as_str(&self) -> &str {
        match self {
            LoanStatus::Active => "Active",
            LoanStatus::InAuction => "InAuction",
            LoanStatus::Closed => "Closed",
            LoanStatus::Other(s) => s,
        }
    }
}

impl PartialEq for LoanStatus {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for LoanStatus {}

impl std::hash::Hash for LoanStatus {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl FromStr for LoanStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Active" => LoanStatus::Active,
            "InAuction" => LoanStatus::InAuction,
            "Closed" => LoanStatus::Closed,
            other => LoanStatus::Other(other.to_string()),
        })
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One version of a loan agreement. Validity is the contract's concern, not the record's.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanRecord {
    pub id: LinearId,
    pub amount: i64,
    pub interest_rate: i64,
    pub borrower: Party,
    pub lenders: Vec<Party>,
    pub status: LoanStatus,
}

impl LoanRecord {
    /// Borrower followed by the lenders in declaration order.
    pub fn participants(&self) -> Vec<&Party> {
        std::iter::once(&self.borrower)
            .chain(self.lenders.iter())
            .collect()
    }

    pub fn participant_keys(&self) -> Vec<PublicKey> {
        let mut keys: Vec<PublicKey> = Vec::with_capacity(1 + self.lenders.len());
        for p in self.participants() {
            if !keys.contains(&p.key) {
                keys.push(p.key);
            }
        }
        keys
    }

    pub fn primary_lender(&self) -> Option<&Party> {
        self.lenders.first()
    }

    pub fn is_participant(&self, key: &PublicKey) -> bool {
        self.participants().iter().any(|p| &p.key == key)
    }
}

/// Address of a produced record: the producing transaction and the output index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    pub tx_id: Hash,
    pub index: u32,
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", hex_encode(self.tx_id), self.index)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAndRef {
    pub state: LoanRecord,
    pub reference: RecordRef,
}
