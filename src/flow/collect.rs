// Signature collection, both sides.
// Aggregator: Building -> LocallyVerified -> AwaitingSignatures -> FullySigned | Aborted
// Responder:  Received -> Verifying -> Signed | Rejected

use crate::config::FlowConfig;
use crate::contract;
use crate::error::{FlowError, NetworkError};
use crate::flow::messages::{Envelope, FlowPayload, SessionId};
use crate::flow::transport::{send_with_retry, Transport};
use crate::identity::{LocalIdentity, Party, PublicKey};
use crate::transaction::{SignedTransaction, Transaction};
use hex::encode as hex_encode;
use std::sync::mpsc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AggregatorState {
    Building,
    LocallyVerified,
    AwaitingSignatures { outstanding: Vec<PublicKey> },
    FullySigned,
    Aborted { reason: String },
}

#[derive(Debug)]
pub struct SignatureAggregator {
    session: SessionId,
    stx: SignedTransaction,
    counterparties: Vec<Party>,
    state: AggregatorState,
}

impl SignatureAggregator {
    pub fn new(session: SessionId, tx: Transaction) -> Self {
        Self {
            session,
            stx: SignedTransaction::new(tx),
            counterparties: Vec::new(),
            state: AggregatorState::Building,
        }
    }

    pub fn state(&self) -> &AggregatorState {
        &self.state
    }

    pub fn transaction(&self) -> &SignedTransaction {
        &self.stx
    }

    fn abort(&mut self, err: FlowError) -> FlowError {
        self.state = AggregatorState::Aborted {
            reason: err.to_string(),
        };
        err
    }

    /// Runs the contract on the local proposal. Nothing has left the node yet.
    pub fn verify_locally(&mut self) -> Result<(), FlowError> {
        debug_assert_eq!(self.state, AggregatorState::Building);
        match contract::verify(&self.stx.tx) {
            Ok(()) => {
                self.state = AggregatorState::LocallyVerified;
                Ok(())
            }
            Err(violation) => Err(self.abort(violation.into())),
        }
    }

    pub fn sign(&mut self, identity: &LocalIdentity) {
        let sig = identity.sign(&self.stx.id());
        self.stx.add_signature(sig);
    }

    /// Keys still unsigned after the local signature, in participant order.
    pub fn required_counterparties(&self) -> Vec<PublicKey> {
        self.stx.missing_signers()
    }

    /// Sends the partially signed transaction to every counterparty.
    pub fn request_signatures(
        &mut self,
        me: &PublicKey,
        counterparties: Vec<Party>,
        transport: &dyn Transport,
        cfg: &FlowConfig,
    ) -> Result<(), FlowError> {
        if self.state != AggregatorState::LocallyVerified {
            return Err(self.abort(FlowError::InvalidSignature(
                "signature requested before local verification".into(),
            )));
        }
        let envelope = Envelope {
            session: self.session,
            sender: *me,
            payload: FlowPayload::Propose(self.stx.clone()),
        };
        for party in &counterparties {
            if let Err(e) = send_with_retry(transport, cfg, party, &envelope) {
                return Err(self.abort(e.into()));
            }
        }
        self.state = AggregatorState::AwaitingSignatures {
            outstanding: counterparties.iter().map(|p| p.key).collect(),
        };
        self.counterparties = counterparties;
        Ok(())
    }

    fn party_name(&self, key: &PublicKey) -> String {
        self.counterparties
            .iter()
            .find(|p| &p.key == key)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| hex_encode(key))
    }

    /// Applies one counterparty reply. `Ok(true)` once every signature is in.
    pub fn on_reply(&mut self, envelope: Envelope) -> Result<bool, FlowError> {
        let AggregatorState::AwaitingSignatures { outstanding } = &self.state else {
            return Ok(matches!(self.state, AggregatorState::FullySigned));
        };
        if envelope.session != self.session || !outstanding.contains(&envelope.sender) {
            debug!(session = %self.session, sender = %hex_encode(envelope.sender), "ignoring unexpected reply");
            return Ok(false);
        }
        let sender = envelope.sender;
        match envelope.payload {
            FlowPayload::Endorse(sig) => {
                if sig.by != sender || !sig.is_valid_for(&self.stx.id()) {
                    let name = self.party_name(&sender);
                    return Err(self.abort(FlowError::InvalidSignature(name)));
                }
                self.stx.add_signature(sig);
                let remaining: Vec<PublicKey> = outstanding
                    .iter()
                    .copied()
                    .filter(|k| k != &sender)
                    .collect();
                if remaining.is_empty() {
                    self.state = AggregatorState::FullySigned;
                    return Ok(true);
                }
                self.state = AggregatorState::AwaitingSignatures {
                    outstanding: remaining,
                };
                Ok(false)
            }
            FlowPayload::Reject { reason } => {
                let party = self.party_name(&sender);
                warn!(session = %self.session, %party, %reason, "counterparty rejected transaction");
                Err(self.abort(FlowError::SignatureRejection { party, reason }))
            }
            other => {
                debug!(session = %self.session, kind = other.kind(), "ignoring non-reply payload");
                Ok(false)
            }
        }
    }

    /// Blocks on `replies` until fully signed, rejected, or `cfg.response_timeout()` elapses.
    pub fn collect(
        &mut self,
        replies: &mpsc::Receiver<Envelope>,
        cfg: &FlowConfig,
    ) -> Result<SignedTransaction, FlowError> {
        if let AggregatorState::AwaitingSignatures { outstanding } = &self.state {
            if outstanding.is_empty() {
                self.state = AggregatorState::FullySigned;
            }
        }
        let deadline = Instant::now() + cfg.response_timeout();
        while !matches!(self.state, AggregatorState::FullySigned) {
            let AggregatorState::AwaitingSignatures { outstanding } = &self.state else {
                return Err(FlowError::InvalidSignature(
                    "collection started outside AwaitingSignatures".into(),
                ));
            };
            let waiting_on = outstanding
                .first()
                .map(|k| self.party_name(k))
                .unwrap_or_default();
            let timed_out = NetworkError::Timeout {
                party: waiting_on,
                waited_ms: cfg.response_timeout_ms,
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(self.abort(timed_out.into()));
            }
            match replies.recv_timeout(deadline - now) {
                Ok(envelope) => {
                    self.on_reply(envelope)?;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(self.abort(timed_out.into()));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    let err = NetworkError::Disconnected("local session".into());
                    return Err(self.abort(err.into()));
                }
            }
        }
        Ok(self.stx.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponderState {
    Received,
    Verifying,
    Signed,
    Rejected { reason: String },
}

/// Counterparty side: re-verifies the exact payload received and decides.
/// Never touches the local store; recording happens only on finality.
#[derive(Debug)]
pub struct SignatureResponder<'a> {
    identity: &'a LocalIdentity,
    expected_notary: Option<PublicKey>,
    state: ResponderState,
}

impl<'a> SignatureResponder<'a> {
    pub fn new(identity: &'a LocalIdentity, expected_notary: Option<PublicKey>) -> Self {
        Self {
            identity,
            expected_notary,
            state: ResponderState::Received,
        }
    }

    pub fn state(&self) -> &ResponderState {
        &self.state
    }

    fn check(&self, initiator: &PublicKey, stx: &SignedTransaction) -> Result<(), String> {
        if !stx.signed_by(initiator) {
            return Err("transaction is not signed by its initiator".into());
        }
        if stx.verify_signatures_except(&stx.missing_signers()).is_err() {
            return Err("transaction carries an invalid signature".into());
        }
        if let Some(notary) = self.expected_notary {
            if stx.tx.notary != notary {
                return Err("transaction names an unknown notary".into());
            }
        }
        contract::verify(&stx.tx).map_err(|v| v.reason.to_string())?;
        if !stx.tx.required_signers().contains(&self.identity.key()) {
            return Err("not a required signer".into());
        }
        Ok(())
    }

    /// Decides on `stx` and returns the reply to send back.
    pub fn respond(&mut self, initiator: &PublicKey, stx: &SignedTransaction) -> FlowPayload {
        self.state = ResponderState::Verifying;
        match self.check(initiator, stx) {
            Ok(()) => {
                self.state = ResponderState::Signed;
                FlowPayload::Endorse(self.identity.sign(&stx.id()))
            }
            Err(reason) => {
                self.state = ResponderState::Rejected {
                    reason: reason.clone(),
                };
                FlowPayload::Reject { reason }
            }
        }
    }
}
