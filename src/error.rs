use crate::contract::ContractViolation;
use crate::ledger::LedgerError;
use crate::notary::NotaryError;
use crate::transaction::SignatureCheckError;
use hex::encode as hex_encode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("no route to party {0}")]
    UnknownPeer(String),
    #[error("party {0} is unreachable")]
    Disconnected(String),
    #[error("timed out after {waited_ms}ms waiting for {party}")]
    Timeout { party: String, waited_ms: u64 },
    #[error("notary unreachable: {0}")]
    NotaryUnavailable(String),
}

/// Terminal outcome of a failed flow attempt. None of these leave partial state behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error(transparent)]
    Validation(#[from] ContractViolation),
    #[error("party named {0} cannot be found")]
    IdentityResolution(String),
    #[error("{party} declined to sign: {reason}")]
    SignatureRejection { party: String, reason: String },
    #[error(transparent)]
    NotarisationConflict(NotaryError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("invalid signature from {0}")]
    InvalidSignature(String),
    #[error("notary refused transaction: {0}")]
    Notary(NotaryError),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

impl FlowError {
    /// Transient failures a caller may retry with a fresh transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlowError::Network(_) | FlowError::NotarisationConflict(_)
        )
    }
}

impl From<NotaryError> for FlowError {
    fn from(e: NotaryError) -> Self {
        match e {
            NotaryError::ConflictingInput { .. } => FlowError::NotarisationConflict(e),
            NotaryError::Unavailable(reason) => {
                FlowError::Network(NetworkError::NotaryUnavailable(reason))
            }
            other => FlowError::Notary(other),
        }
    }
}

impl From<SignatureCheckError> for FlowError {
    fn from(e: SignatureCheckError) -> Self {
        match e {
            SignatureCheckError::Invalid(k) | SignatureCheckError::Unexpected(k) => {
                FlowError::InvalidSignature(hex_encode(k))
            }
            SignatureCheckError::Missing(keys) => FlowError::Notary(NotaryError::MissingSignatures(
                keys.iter().map(hex_encode).collect(),
            )),
        }
    }
}
