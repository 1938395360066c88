mod common;

use common::{build, build_with, flow_fast, wait_for_record, wait_until};
use loanledger_core::api::{LoanApi, ResponseStatus};
use loanledger_core::contract::{INPUTS_ON_CONFIRM, LENDER_IS_BORROWER, RATE_ABOVE_MAXIMUM};
use loanledger_core::error::FlowError;
use loanledger_core::flow::{NoProgress, ProgressStep, ProposalRequest};
use loanledger_core::identity::Party;
use loanledger_core::ledger::{LedgerError, RecordFilter, RecordStore, Vault};
use loanledger_core::notary::{NotaryError, NotaryService};
use loanledger_core::record::{LoanStatus, RecordRef, StateAndRef};
use loanledger_core::transaction::NotarisedTransaction;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

const PARTIES: [&str; 3] = ["PartyA", "PartyB", "PartyC"];

fn names(parties: &[Party]) -> Vec<&str> {
    parties.iter().map(|p| p.name.as_str()).collect()
}

#[test]
fn borrow_reaches_every_participant() {
    let net = build(&PARTIES);
    let a = net.node("PartyA");

    let steps = Mutex::new(Vec::new());
    let observer = |step: ProgressStep| steps.lock().unwrap().push(step);
    let done = a
        .propose(ProposalRequest::borrow(1000, 5, &["PartyB", "PartyC"]), &observer)
        .expect("borrow finalised");

    let record = &done.record.state;
    assert_eq!(record.amount, 1000);
    assert_eq!(record.interest_rate, 5);
    assert_eq!(record.status, LoanStatus::Active);
    assert_eq!(record.borrower.name, "PartyA");
    assert_eq!(names(&record.lenders), vec!["PartyB", "PartyC"]);
    assert!(done.consumed.is_none());
    assert_eq!(steps.into_inner().unwrap(), ProgressStep::ALL.to_vec());

    // Read-back equals the produced record of the certified transaction, on every participant.
    assert_eq!(done.transaction.tx().outputs[0], done.record.state);
    assert_eq!(a.records(RecordFilter::Unconsumed), vec![done.record.clone()]);
    for name in ["PartyB", "PartyC"] {
        assert!(wait_for_record(net.node(name), &done.record), "{} never recorded the loan", name);
    }
    assert!(done.transaction.verify().is_ok());
    net.shutdown();
}

#[test]
fn contract_violations_are_caught_before_any_message() {
    let net = build(&PARTIES);
    let a = net.node("PartyA");

    let err = a
        .propose(
            ProposalRequest::lend(500, 25, LoanStatus::InAuction, &["PartyB"]),
            &NoProgress,
        )
        .unwrap_err();
    assert_eq!(err.to_string(), RATE_ABOVE_MAXIMUM);
    assert!(matches!(err, FlowError::Validation(_)));
    assert!(!err.is_retryable());

    let err = a
        .propose(
            ProposalRequest::lend(500, 10, LoanStatus::InAuction, &["PartyA"]),
            &NoProgress,
        )
        .unwrap_err();
    assert_eq!(err.to_string(), LENDER_IS_BORROWER);

    let err = a
        .propose(
            ProposalRequest::borrow(0, 5, &["PartyB", "PartyC"]),
            &NoProgress,
        )
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));

    thread::sleep(Duration::from_millis(50));
    for name in PARTIES {
        assert!(net.node(name).records(RecordFilter::All).is_empty());
    }
    net.shutdown();
}

#[test]
fn confirm_without_auction_record_builds_with_no_inputs() {
    let net = build(&PARTIES);
    let a = net.node("PartyA");

    // Only an Active record exists, so the lookup finds nothing and the
    // transaction is built with zero inputs, which the contract refuses.
    a.propose(ProposalRequest::borrow(1000, 5, &["PartyB", "PartyC"]), &NoProgress)
        .expect("borrow finalised");
    let err = a
        .propose(
            ProposalRequest::confirm(500, 10, LoanStatus::Closed, "PartyB"),
            &NoProgress,
        )
        .unwrap_err();
    assert_eq!(err.to_string(), INPUTS_ON_CONFIRM);
    assert_eq!(a.records(RecordFilter::All).len(), 1);
    net.shutdown();
}

#[test]
fn lend_then_confirm_supersedes_the_auction_record() {
    let net = build(&PARTIES);
    let (a, b, c) = (net.node("PartyA"), net.node("PartyB"), net.node("PartyC"));

    let lend = a
        .propose(
            ProposalRequest::lend(500, 10, LoanStatus::InAuction, &["PartyB", "PartyC"]),
            &NoProgress,
        )
        .expect("lend finalised");
    assert_eq!(lend.record.state.status, LoanStatus::InAuction);
    assert!(wait_for_record(b, &lend.record));
    assert!(wait_for_record(c, &lend.record));

    let confirm = a
        .propose(
            ProposalRequest::confirm(500, 10, LoanStatus::Closed, "PartyB"),
            &NoProgress,
        )
        .expect("confirm finalised");
    assert_eq!(confirm.consumed, Some(lend.record.reference));
    assert_eq!(confirm.record.state.id, lend.record.state.id);
    assert_eq!(confirm.record.state.status, LoanStatus::Closed);
    assert_eq!(names(&confirm.record.state.lenders), vec!["PartyB"]);

    assert_eq!(a.records(RecordFilter::Unconsumed), vec![confirm.record.clone()]);
    assert_eq!(a.records(RecordFilter::Consumed), vec![lend.record.clone()]);
    assert!(wait_for_record(b, &confirm.record));
    // C took part in the consumed record only, and still learns it is spent.
    assert!(wait_until(Duration::from_secs(5), || {
        c.records(RecordFilter::Consumed) == vec![lend.record.clone()]
    }));
    assert_eq!(c.records(RecordFilter::Unconsumed), vec![confirm.record.clone()]);

    // Resubmitting the certified transaction is a conflict, never a second certification.
    let again = net.notary.notarise(&confirm.transaction.stx).unwrap_err();
    assert!(matches!(again, NotaryError::ConflictingInput { .. }));
    net.shutdown();
}

/// Vault wrapper that holds every Confirm lookup until two flows have both read.
struct BarrierStore {
    inner: Vault,
    armed: AtomicBool,
    barrier: Barrier,
}

impl RecordStore for BarrierStore {
    fn record_transaction(&self, ntx: &NotarisedTransaction) -> Result<Vec<RecordRef>, LedgerError> {
        self.inner.record_transaction(ntx)
    }

    fn find_unconsumed(&self, status: &LoanStatus) -> Option<StateAndRef> {
        let found = self.inner.find_unconsumed(status);
        if self.armed.load(Ordering::SeqCst) {
            self.barrier.wait();
        }
        found
    }

    fn records(&self, filter: RecordFilter) -> Vec<StateAndRef> {
        self.inner.records(filter)
    }
}

#[test]
fn concurrent_confirms_certify_exactly_once() {
    let a_store = Arc::new(BarrierStore {
        inner: Vault::in_memory(),
        armed: AtomicBool::new(false),
        barrier: Barrier::new(2),
    });
    let net = {
        let a_store = Arc::clone(&a_store);
        build_with(&PARTIES, flow_fast(), move |name| {
            if name == "PartyA" {
                Arc::clone(&a_store) as Arc<dyn RecordStore>
            } else {
                Arc::new(Vault::in_memory()) as Arc<dyn RecordStore>
            }
        })
    };
    let a = Arc::clone(net.node("PartyA"));

    let lend = a
        .propose(
            ProposalRequest::lend(500, 10, LoanStatus::InAuction, &["PartyB", "PartyC"]),
            &NoProgress,
        )
        .expect("lend finalised");

    a_store.armed.store(true, Ordering::SeqCst);
    let racers: Vec<_> = [("PartyB", 500), ("PartyC", 600)]
        .into_iter()
        .map(|(lender, amount)| {
            let a = Arc::clone(&a);
            thread::spawn(move || {
                a.propose(
                    ProposalRequest::confirm(amount, 10, LoanStatus::Closed, lender),
                    &NoProgress,
                )
            })
        })
        .collect();
    let results: Vec<_> = racers
        .into_iter()
        .map(|h| h.join().expect("racer thread"))
        .collect();
    a_store.armed.store(false, Ordering::SeqCst);

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let losers: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(winners.len(), 1, "results: {:?}", results);
    assert_eq!(losers.len(), 1);
    assert!(matches!(losers[0], FlowError::NotarisationConflict(_)));
    assert!(losers[0].is_retryable());
    assert_eq!(winners[0].consumed, Some(lend.record.reference));

    let closed: Vec<_> = a
        .records(RecordFilter::Unconsumed)
        .into_iter()
        .filter(|r| r.state.status == LoanStatus::Closed)
        .collect();
    assert_eq!(closed, vec![winners[0].record.clone()]);
    assert!(net.notary.is_consumed(&lend.record.reference));
    net.shutdown();
}

#[test]
fn api_maps_outcomes_to_status_codes() {
    let net = build(&PARTIES);
    let api = LoanApi::new(Arc::clone(net.node("PartyA")));

    assert_eq!(api.whoami(), "PartyA");
    assert_eq!(api.peers(), vec!["PartyB".to_string(), "PartyC".to_string()]);

    let rejected = api.create_loan(0, 5, &["PartyB", "PartyC"]);
    assert_eq!(rejected.status, ResponseStatus::BadRequest);
    assert_eq!(rejected.status.code(), 400);

    let one_lender = api.create_loan(1000, 5, &["PartyB"]);
    assert_eq!(one_lender.body, "borrow request requires at least two lenders");

    let unknown = api.create_loan(1000, 5, &["PartyB", "Nobody"]);
    assert_eq!(unknown.body, "Party named Nobody cannot be found.");

    let created = api.create_loan(1000, 5, &["PartyB", "PartyC"]);
    assert_eq!(created.status, ResponseStatus::Created);
    assert_eq!(created.status.code(), 201);
    assert!(created.body.starts_with("Transaction id "));
    assert!(created.body.ends_with(" committed to ledger."));

    let too_dear = api.lend_loan(500, 25, &["PartyB", "PartyC"]);
    assert_eq!(too_dear.status, ResponseStatus::BadRequest);
    assert_eq!(too_dear.body, RATE_ABOVE_MAXIMUM);

    assert!(api.lend_loan(500, 10, &["PartyB", "PartyC"]).is_created());
    assert!(api.confirm_lender(500, 10, "PartyC").is_created());

    let mut statuses: Vec<LoanStatus> = api.loan_requests().into_iter().map(|r| r.status).collect();
    statuses.sort_by(|x, y| x.as_str().cmp(y.as_str()));
    assert_eq!(statuses, vec![LoanStatus::Active, LoanStatus::Closed]);
    net.shutdown();
}
