mod common;

use common::{
    build, flow_fast, identities, identity, network_map, start_node, temp_dir, wait_for_record,
    NOTARY_SEED,
};
use loanledger_core::config::FlowConfig;
use loanledger_core::error::{FlowError, NetworkError};
use loanledger_core::flow::{InMemoryNetwork, NoProgress, ProposalRequest};
use loanledger_core::ledger::{RecordFilter, RecordStore, Vault};
use loanledger_core::notary::{Notary, NotaryError, NotaryService};
use loanledger_core::record::LoanStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn unknown_counterparty_fails_before_building() {
    let net = build(&["PartyA", "PartyB"]);
    let err = net
        .node("PartyA")
        .propose(
            ProposalRequest::lend(500, 10, LoanStatus::InAuction, &["PartyB", "Nobody"]),
            &NoProgress,
        )
        .unwrap_err();
    assert_eq!(err, FlowError::IdentityResolution("Nobody".into()));
    assert_eq!(err.to_string(), "party named Nobody cannot be found");
    net.shutdown();
}

#[test]
fn responder_with_a_different_notary_rejects() {
    let network = Arc::new(InMemoryNetwork::new());
    let ids = identities(&["PartyA", "PartyB"]);
    let notary = Arc::new(Notary::new(identity("Notary", NOTARY_SEED)));
    let rogue = Arc::new(Notary::new(identity("Rogue", 77)));
    let map = network_map(&ids, notary.notary_party());
    let mut ids = ids.into_iter();
    let a_id = ids.next().expect("PartyA");
    let b_id = ids.next().expect("PartyB");

    let a = start_node(
        &network,
        a_id,
        map.clone(),
        Arc::new(Vault::in_memory()),
        Arc::clone(&notary) as Arc<dyn NotaryService>,
        flow_fast(),
    );
    let b_store = Arc::new(Vault::in_memory());
    let b = start_node(
        &network,
        b_id,
        map,
        Arc::clone(&b_store) as Arc<dyn RecordStore>,
        rogue as Arc<dyn NotaryService>,
        flow_fast(),
    );

    let err = a
        .propose(
            ProposalRequest::lend(500, 10, LoanStatus::InAuction, &["PartyB"]),
            &NoProgress,
        )
        .unwrap_err();
    assert_eq!(
        err,
        FlowError::SignatureRejection {
            party: "PartyB".into(),
            reason: "transaction names an unknown notary".into()
        }
    );
    // No partial commit anywhere.
    assert!(a.records(RecordFilter::All).is_empty());
    assert!(b_store.records(RecordFilter::All).is_empty());
    a.shutdown();
    b.shutdown();
}

#[test]
fn silent_counterparty_times_out() {
    let network = Arc::new(InMemoryNetwork::new());
    let ids = identities(&["PartyA", "PartyB"]);
    let notary = Arc::new(Notary::new(identity("Notary", NOTARY_SEED)));
    let map = network_map(&ids, notary.notary_party());
    // B is reachable but nothing ever reads its inbox.
    let _b_inbox = network.register(ids[1].party());
    let cfg = FlowConfig {
        response_timeout_ms: 100,
        ..flow_fast()
    };
    let a = start_node(
        &network,
        ids[0].clone(),
        map,
        Arc::new(Vault::in_memory()),
        notary as Arc<dyn NotaryService>,
        cfg,
    );

    let started = Instant::now();
    let err = a
        .propose(
            ProposalRequest::lend(500, 10, LoanStatus::InAuction, &["PartyB"]),
            &NoProgress,
        )
        .unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(
        err,
        FlowError::Network(NetworkError::Timeout {
            party: "PartyB".into(),
            waited_ms: 100
        })
    );
    assert!(err.is_retryable());
    assert!(a.records(RecordFilter::All).is_empty());
    a.shutdown();
}

#[test]
fn unreachable_counterparty_surfaces_network_error() {
    let network = Arc::new(InMemoryNetwork::new());
    let ids = identities(&["PartyA", "PartyB"]);
    let notary = Arc::new(Notary::new(identity("Notary", NOTARY_SEED)));
    let map = network_map(&ids, notary.notary_party());
    let a = start_node(
        &network,
        ids[0].clone(),
        map,
        Arc::new(Vault::in_memory()),
        notary as Arc<dyn NotaryService>,
        flow_fast(),
    );

    let err = a
        .propose(
            ProposalRequest::lend(500, 10, LoanStatus::InAuction, &["PartyB"]),
            &NoProgress,
        )
        .unwrap_err();
    assert_eq!(err, FlowError::Network(NetworkError::UnknownPeer("PartyB".into())));
    a.shutdown();
}

/// Notary that is down for the first `failures` calls.
struct FlakyNotary {
    inner: Notary,
    failures: parking_lot::Mutex<u32>,
}

impl NotaryService for FlakyNotary {
    fn notary_party(&self) -> &loanledger_core::identity::Party {
        self.inner.notary_party()
    }

    fn notarise(
        &self,
        stx: &loanledger_core::transaction::SignedTransaction,
    ) -> Result<loanledger_core::transaction::NotarisedTransaction, NotaryError> {
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(NotaryError::Unavailable("restarting".into()));
        }
        drop(failures);
        self.inner.notarise(stx)
    }
}

#[test]
fn notary_outage_is_retried_then_surfaced() {
    for (failures, expect_ok) in [(2, true), (5, false)] {
        let network = Arc::new(InMemoryNetwork::new());
        let ids = identities(&["PartyA", "PartyB"]);
        let notary = Arc::new(FlakyNotary {
            inner: Notary::new(identity("Notary", NOTARY_SEED)),
            failures: parking_lot::Mutex::new(failures),
        });
        let map = network_map(&ids, notary.notary_party());
        let nodes: Vec<_> = ids
            .into_iter()
            .map(|id| {
                start_node(
                    &network,
                    id,
                    map.clone(),
                    Arc::new(Vault::in_memory()),
                    Arc::clone(&notary) as Arc<dyn NotaryService>,
                    flow_fast(),
                )
            })
            .collect();

        let result = nodes[0].propose(
            ProposalRequest::lend(500, 10, LoanStatus::InAuction, &["PartyB"]),
            &NoProgress,
        );
        if expect_ok {
            let done = result.expect("notarised after retries");
            assert!(wait_for_record(&nodes[1], &done.record));
        } else {
            assert_eq!(
                result.unwrap_err(),
                FlowError::Network(NetworkError::NotaryUnavailable("restarting".into()))
            );
            assert!(nodes[0].records(RecordFilter::All).is_empty());
        }
        for node in &nodes {
            node.shutdown();
        }
    }
}

#[test]
fn ledger_and_notary_survive_restart() {
    let dir = temp_dir("restart");
    let ids = identities(&["PartyA", "PartyB"]);
    let notary_id = identity("Notary", NOTARY_SEED);

    let (lend_record, lend_tx) = {
        let network = Arc::new(InMemoryNetwork::new());
        let notary = Arc::new(Notary::open(notary_id.clone(), dir.join("notary")).expect("notary"));
        let map = network_map(&ids, notary.notary_party());
        let nodes: Vec<_> = ids
            .iter()
            .map(|id| {
                let vault = Vault::open(dir.join(&id.party().name)).expect("vault");
                start_node(
                    &network,
                    id.clone(),
                    map.clone(),
                    Arc::new(vault),
                    Arc::clone(&notary) as Arc<dyn NotaryService>,
                    flow_fast(),
                )
            })
            .collect();
        let done = nodes[0]
            .propose(
                ProposalRequest::lend(500, 10, LoanStatus::InAuction, &["PartyB"]),
                &NoProgress,
            )
            .expect("lend finalised");
        assert!(wait_for_record(&nodes[1], &done.record));
        for node in &nodes {
            node.shutdown();
        }
        (done.record, done.transaction)
    };

    for id in &ids {
        let vault = Vault::open(dir.join(&id.party().name)).expect("reopen vault");
        assert_eq!(vault.records(RecordFilter::Unconsumed), vec![lend_record.clone()]);
    }
    let notary = Notary::open(notary_id, dir.join("notary")).expect("reopen notary");
    assert!(matches!(
        notary.notarise(&lend_tx.stx),
        Err(NotaryError::ConflictingInput { .. })
    ));
    let _ = std::fs::remove_dir_all(dir);
}
