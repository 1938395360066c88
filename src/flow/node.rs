// A party node: an inbox dispatcher thread serving counterparty and finality
// messages, plus the proposer flow run on the caller's thread.

use crate::config::FlowConfig;
use crate::error::FlowError;
use crate::flow::collect::{SignatureAggregator, SignatureResponder};
use crate::flow::messages::{decode_frame, Envelope, FlowPayload, SessionId};
use crate::flow::progress::{ProgressObserver, ProgressStep};
use crate::flow::transport::{send_with_retry, Transport};
use crate::identity::{Hash, LocalIdentity, NetworkMap, Party, PublicKey};
use crate::ledger::{LedgerError, RecordFilter, RecordStore};
use crate::notary::{NotaryError, NotaryService};
use crate::record::{LinearId, LoanRecord, LoanStatus, RecordRef, StateAndRef};
use crate::transaction::{Command, CommandEntry, NotarisedTransaction, SignedTransaction, Transaction};
use hex::encode as hex_encode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const INBOX_POLL: Duration = Duration::from_millis(10);

/// Everything a node needs from the outside world.
pub struct NodeContext {
    pub identity: LocalIdentity,
    pub network_map: NetworkMap,
    pub store: Arc<dyn RecordStore>,
    pub transport: Arc<dyn Transport>,
    pub notary: Arc<dyn NotaryService>,
    pub config: FlowConfig,
}

/// What the caller asks a proposer flow to build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposalRequest {
    pub command: Command,
    pub amount: i64,
    pub interest_rate: i64,
    /// Ignored for Borrow, which always produces an `Active` record.
    pub status: LoanStatus,
    /// Lender names, in declaration order.
    pub counterparties: Vec<String>,
}

impl ProposalRequest {
    pub fn borrow(amount: i64, interest_rate: i64, lenders: &[&str]) -> Self {
        Self {
            command: Command::Borrow,
            amount,
            interest_rate,
            status: LoanStatus::Active,
            counterparties: lenders.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn lend(amount: i64, interest_rate: i64, status: LoanStatus, acceptors: &[&str]) -> Self {
        Self {
            command: Command::Lend,
            amount,
            interest_rate,
            status,
            counterparties: acceptors.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn confirm(amount: i64, interest_rate: i64, status: LoanStatus, lender: &str) -> Self {
        Self {
            command: Command::Confirm,
            amount,
            interest_rate,
            status,
            counterparties: vec![lender.to_string()],
        }
    }
}

/// Result of a successful proposal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalisedRecord {
    pub tx_id: Hash,
    pub record: StateAndRef,
    pub consumed: Option<RecordRef>,
    pub transaction: NotarisedTransaction,
}

impl FinalisedRecord {
    pub fn tx_id_hex(&self) -> String {
        hex_encode(self.tx_id)
    }
}

struct NodeInner {
    ctx: NodeContext,
    sessions: Mutex<HashMap<SessionId, mpsc::Sender<Envelope>>>,
    next_seq: AtomicU64,
}

/// Removes the reply route of a proposer session when the flow ends, however it ends.
struct SessionGuard<'a> {
    sessions: &'a Mutex<HashMap<SessionId, mpsc::Sender<Envelope>>>,
    id: SessionId,
}

impl<'a> SessionGuard<'a> {
    fn open(
        sessions: &'a Mutex<HashMap<SessionId, mpsc::Sender<Envelope>>>,
        id: SessionId,
    ) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel();
        sessions.lock().insert(id, tx);
        (Self { sessions, id }, rx)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.sessions.lock().remove(&self.id);
    }
}

pub struct PartyNode {
    inner: Arc<NodeInner>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PartyNode {
    /// Starts the dispatcher on `inbox` and returns the running node.
    pub fn start(ctx: NodeContext, inbox: mpsc::Receiver<Vec<u8>>) -> Self {
        let inner = Arc::new(NodeInner {
            ctx,
            sessions: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let inner = Arc::clone(&inner);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match inbox.recv_timeout(INBOX_POLL) {
                    Ok(frame) => inner.handle_frame(&frame),
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            })
        };
        debug!(party = %inner.ctx.identity.party(), "party node started");
        Self {
            inner,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn party(&self) -> &Party {
        self.inner.ctx.identity.party()
    }

    pub fn network_map(&self) -> &NetworkMap {
        &self.inner.ctx.network_map
    }

    /// Read interface over this party's ledger view.
    pub fn records(&self, filter: RecordFilter) -> Vec<StateAndRef> {
        self.inner.ctx.store.records(filter)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Runs one proposer flow to completion. Blocks the calling thread only.
    pub fn propose(
        &self,
        request: ProposalRequest,
        progress: &dyn ProgressObserver,
    ) -> Result<FinalisedRecord, FlowError> {
        self.inner.propose(request, progress)
    }
}

impl Drop for PartyNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl NodeInner {
    fn me(&self) -> &Party {
        self.ctx.identity.party()
    }

    fn notary_key(&self) -> PublicKey {
        self.ctx.notary.notary_party().key
    }

    fn fresh_linear_id(&self, seq: u64) -> LinearId {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let mut material = Vec::with_capacity(32 + 8 + 16);
        material.extend_from_slice(&self.ctx.identity.key());
        material.extend_from_slice(&seq.to_le_bytes());
        material.extend_from_slice(&nanos.to_le_bytes());
        LinearId::derive(&material)
    }

    fn resolve(&self, names: &[String]) -> Result<Vec<Party>, FlowError> {
        names
            .iter()
            .map(|name| {
                self.ctx
                    .network_map
                    .well_known_party(name)
                    .cloned()
                    .ok_or_else(|| FlowError::IdentityResolution(name.clone()))
            })
            .collect()
    }

    fn propose(
        &self,
        request: ProposalRequest,
        progress: &dyn ProgressObserver,
    ) -> Result<FinalisedRecord, FlowError> {
        let lenders = self.resolve(&request.counterparties)?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let session = SessionId {
            initiator: self.ctx.identity.key(),
            seq,
        };

        progress.on_step(ProgressStep::GeneratingTransaction);
        let input = match request.command {
            Command::Confirm => self.ctx.store.find_unconsumed(&LoanStatus::InAuction),
            Command::Borrow | Command::Lend => None,
        };
        if request.command == Command::Confirm && input.is_none() {
            debug!(%session, "no single unconsumed InAuction record; confirming without input");
        }
        let status = match request.command {
            Command::Borrow => LoanStatus::Active,
            Command::Lend | Command::Confirm => request.status.clone(),
        };
        let output = LoanRecord {
            id: input
                .as_ref()
                .map(|s| s.state.id)
                .unwrap_or_else(|| self.fresh_linear_id(seq)),
            amount: request.amount,
            interest_rate: request.interest_rate,
            borrower: self.me().clone(),
            lenders,
            status,
        };
        let consumed = input.as_ref().map(|s| s.reference);
        let tx = Transaction {
            inputs: input.into_iter().collect(),
            commands: vec![CommandEntry {
                command: request.command,
                signers: output.participant_keys(),
            }],
            outputs: vec![output],
            notary: self.notary_key(),
        };
        debug!(%session, command = %request.command, tx_id = %hex_encode(tx.id()), "transaction generated");

        progress.on_step(ProgressStep::VerifyingTransaction);
        let mut aggregator = SignatureAggregator::new(session, tx);
        aggregator.verify_locally().map_err(|e| {
            warn!(%session, reason = %e, "proposal failed local verification");
            e
        })?;

        progress.on_step(ProgressStep::SigningTransaction);
        aggregator.sign(&self.ctx.identity);

        progress.on_step(ProgressStep::GatheringSignatures);
        let counterparties = aggregator
            .required_counterparties()
            .iter()
            .map(|key| {
                self.ctx
                    .network_map
                    .party_from_key(key)
                    .cloned()
                    .ok_or_else(|| FlowError::IdentityResolution(hex_encode(key)))
            })
            .collect::<Result<Vec<Party>, FlowError>>()?;
        let stx = {
            let (_guard, replies) = SessionGuard::open(&self.sessions, session);
            aggregator.request_signatures(
                &self.ctx.identity.key(),
                counterparties,
                self.ctx.transport.as_ref(),
                &self.ctx.config,
            )?;
            aggregator.collect(&replies, &self.ctx.config)?
        };

        progress.on_step(ProgressStep::Finalising);
        let ntx = self.notarise(&stx)?;
        self.ctx.store.record_transaction(&ntx)?;
        self.distribute(session, &ntx);

        let tx_id = ntx.id();
        let record = StateAndRef {
            state: ntx.tx().outputs[0].clone(),
            reference: RecordRef { tx_id, index: 0 },
        };
        info!(%session, tx_id = %hex_encode(tx_id), loan = %record.state.id, status = %record.state.status, "transaction finalised");
        Ok(FinalisedRecord {
            tx_id,
            record,
            consumed,
            transaction: ntx,
        })
    }

    /// Bounded retry while the notary reports itself unavailable; conflicts are final.
    fn notarise(&self, stx: &SignedTransaction) -> Result<NotarisedTransaction, FlowError> {
        let cfg = &self.ctx.config;
        let attempts = cfg.send_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.ctx.notary.notarise(stx) {
                Ok(ntx) => return Ok(ntx),
                Err(NotaryError::Unavailable(reason)) if attempt + 1 < attempts => {
                    warn!(tx_id = %stx.id_hex(), attempt, %reason, "notary unavailable; retrying");
                    thread::sleep(cfg.backoff(attempt));
                    attempt += 1;
                }
                Err(err) => {
                    warn!(tx_id = %stx.id_hex(), error = %err, "notarisation failed");
                    return Err(err.into());
                }
            }
        }
    }

    /// Sends the certified transaction to every other participant of its inputs and outputs.
    fn distribute(&self, session: SessionId, ntx: &NotarisedTransaction) {
        let me = self.ctx.identity.key();
        let mut recipients: Vec<PublicKey> = Vec::new();
        let tx = ntx.tx();
        let records = tx.inputs.iter().map(|s| &s.state).chain(tx.outputs.iter());
        for record in records {
            for key in record.participant_keys() {
                if key != me && !recipients.contains(&key) {
                    recipients.push(key);
                }
            }
        }
        let envelope = Envelope {
            session,
            sender: me,
            payload: FlowPayload::Finalised(ntx.clone()),
        };
        for key in recipients {
            let Some(party) = self.ctx.network_map.party_from_key(&key) else {
                warn!(%session, key = %hex_encode(key), "finalised transaction has an unknown participant");
                continue;
            };
            if let Err(err) = send_with_retry(self.ctx.transport.as_ref(), &self.ctx.config, party, &envelope) {
                warn!(%session, %party, ?err, "failed to deliver finalised transaction");
            }
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        let envelope = match decode_frame(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(party = %self.me(), error = %e, "dropping undecodable frame");
                return;
            }
        };
        match envelope.payload {
            FlowPayload::Propose(stx) => self.handle_proposal(envelope.session, envelope.sender, stx),
            FlowPayload::Endorse(_) | FlowPayload::Reject { .. } => {
                let route = self.sessions.lock().get(&envelope.session).cloned();
                match route {
                    Some(route) => {
                        let _ = route.send(envelope);
                    }
                    None => {
                        debug!(session = %envelope.session, "reply for a finished session");
                    }
                }
            }
            FlowPayload::Finalised(ntx) => self.accept_finalised(ntx),
        }
    }

    fn handle_proposal(&self, session: SessionId, sender: PublicKey, stx: SignedTransaction) {
        let Some(initiator) = self.ctx.network_map.party_from_key(&sender) else {
            warn!(%session, sender = %hex_encode(sender), "proposal from an unknown party");
            return;
        };
        let mut responder = SignatureResponder::new(&self.ctx.identity, Some(self.notary_key()));
        let payload = responder.respond(&sender, &stx);
        match &payload {
            FlowPayload::Reject { reason } => {
                warn!(%session, party = %initiator, tx_id = %stx.id_hex(), %reason, "refusing to sign");
            }
            _ => debug!(%session, party = %initiator, tx_id = %stx.id_hex(), "signed proposal"),
        }
        let reply = Envelope {
            session,
            sender: self.ctx.identity.key(),
            payload,
        };
        if let Err(err) = send_with_retry(self.ctx.transport.as_ref(), &self.ctx.config, initiator, &reply) {
            warn!(%session, party = %initiator, ?err, "failed to reply to proposer");
        }
    }

    fn accept_finalised(&self, ntx: NotarisedTransaction) {
        let tx_id = hex_encode(ntx.id());
        if ntx.tx().notary != self.notary_key() {
            warn!(%tx_id, "finalised transaction names an unknown notary");
            return;
        }
        if let Err(err) = ntx.verify() {
            warn!(%tx_id, ?err, "finalised transaction failed signature checks");
            return;
        }
        let me = self.ctx.identity.key();
        if !ntx.tx().outputs.iter().any(|o| o.is_participant(&me))
            && !ntx.tx().inputs.iter().any(|s| s.state.is_participant(&me))
        {
            debug!(%tx_id, "ignoring finalised transaction we take no part in");
            return;
        }
        match self.ctx.store.record_transaction(&ntx) {
            Ok(refs) => info!(party = %self.me(), %tx_id, outputs = refs.len(), "recorded finalised transaction"),
            Err(LedgerError::Duplicate) => debug!(%tx_id, "finalised transaction already recorded"),
            Err(err) => warn!(%tx_id, error = %err, "failed to record finalised transaction"),
        }
    }
}
