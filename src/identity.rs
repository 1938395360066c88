// Party identities, the local signing capability and the network map.
// Keys are raw ed25519 bytes; signatures travel as hex strings.

use ed25519_dalek::{Keypair, PublicKey as DalekPublicKey, SecretKey, Signature, Signer, Verifier};
use hex::{decode as hex_decode, encode as hex_encode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub type PublicKey = [u8; 32];
pub type Hash = [u8; 32];

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    pub key: PublicKey,
}

impl Party {
    pub fn new(name: impl Into<String>, key: PublicKey) -> Self {
        Self {
            name: name.into(),
            key,
        }
    }

    pub fn key_hex(&self) -> String {
        hex_encode(self.key)
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A signature over a transaction id, tagged with the signing key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSignature {
    pub by: PublicKey,
    pub signature: String,
}

impl TransactionSignature {
    /// True iff `signature` is a valid ed25519 signature by `by` over `message`.
    pub fn is_valid_for(&self, message: &[u8]) -> bool {
        let Ok(pk) = DalekPublicKey::from_bytes(&self.by) else {
            return false;
        };
        let Some(sig) = sig_from_hex(&self.signature) else {
            return false;
        };
        pk.verify(message, &sig).is_ok()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("secret key must be 32 bytes")]
    InvalidSecret,
    #[error("public key is not a valid ed25519 point")]
    InvalidPublicKey,
}

/// The local party together with its signing key.
#[derive(Clone)]
pub struct LocalIdentity {
    party: Party,
    keypair: Arc<Keypair>,
}

impl LocalIdentity {
    pub fn from_secret(name: impl Into<String>, secret: &[u8; 32]) -> Result<Self, IdentityError> {
        let secret = SecretKey::from_bytes(secret).map_err(|_| IdentityError::InvalidSecret)?;
        let public: DalekPublicKey = (&secret).into();
        let keypair = Keypair { secret, public };
        Ok(Self {
            party: Party::new(name, public.to_bytes()),
            keypair: Arc::new(keypair),
        })
    }

    pub fn party(&self) -> &Party {
        &self.party
    }

    pub fn key(&self) -> PublicKey {
        self.party.key
    }

    pub fn sign(&self, message: &[u8]) -> TransactionSignature {
        let sig = self.keypair.sign(message);
        TransactionSignature {
            by: self.party.key,
            signature: sig_to_hex(&sig),
        }
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("party", &self.party)
            .finish_non_exhaustive()
    }
}

pub fn sig_to_hex(sig: &Signature) -> String {
    hex_encode(sig.to_bytes())
}

pub fn sig_from_hex(sig_hex: &str) -> Option<Signature> {
    let bytes = hex_decode(sig_hex).ok()?;
    if bytes.len() != 64 {
        return None;
    }
    Signature::try_from(&bytes[..]).ok()
}

pub fn parse_pubkey(hex_str: &str) -> Result<PublicKey, IdentityError> {
    let bytes = hex_decode(hex_str.trim()).map_err(|_| IdentityError::InvalidPublicKey)?;
    let key: PublicKey = bytes
        .try_into()
        .map_err(|_| IdentityError::InvalidPublicKey)?;
    DalekPublicKey::from_bytes(&key).map_err(|_| IdentityError::InvalidPublicKey)?;
    Ok(key)
}

/// Well-known parties of the network, resolvable by name or key.
#[derive(Clone, Debug, Default)]
pub struct NetworkMap {
    parties: Vec<Party>,
    by_name: HashMap<String, usize>,
    by_key: HashMap<PublicKey, usize>,
    notary: Option<Party>,
}

impl NetworkMap {
    pub fn new(parties: Vec<Party>, notary: Option<Party>) -> Self {
        let mut map = Self {
            notary,
            ..Self::default()
        };
        for party in parties {
            map.register(party);
        }
        map
    }

    /// Adds a party; a later registration under the same name replaces the key mapping.
    pub fn register(&mut self, party: Party) {
        if let Some(&idx) = self.by_name.get(&party.name) {
            self.by_key.remove(&self.parties[idx].key);
            self.by_key.insert(party.key, idx);
            self.parties[idx] = party;
            return;
        }
        let idx = self.parties.len();
        self.by_name.insert(party.name.clone(), idx);
        self.by_key.insert(party.key, idx);
        self.parties.push(party);
    }

    pub fn well_known_party(&self, name: &str) -> Option<&Party> {
        self.by_name.get(name).map(|&i| &self.parties[i])
    }

    pub fn party_from_key(&self, key: &PublicKey) -> Option<&Party> {
        if let Some(notary) = &self.notary {
            if &notary.key == key {
                return Some(notary);
            }
        }
        self.by_key.get(key).map(|&i| &self.parties[i])
    }

    pub fn notary(&self) -> Option<&Party> {
        self.notary.as_ref()
    }

    pub fn parties(&self) -> &[Party] {
        &self.parties
    }
}
