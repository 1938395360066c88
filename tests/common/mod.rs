#![allow(dead_code)]

use loanledger_core::config::FlowConfig;
use loanledger_core::flow::{InMemoryNetwork, NodeContext, PartyNode, Transport};
use loanledger_core::identity::{LocalIdentity, NetworkMap, Party};
use loanledger_core::ledger::{RecordFilter, RecordStore, Vault};
use loanledger_core::notary::{Notary, NotaryService};
use loanledger_core::record::StateAndRef;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const NOTARY_SEED: u8 = 99;

pub struct TestNet {
    pub network: Arc<InMemoryNetwork>,
    pub notary: Arc<Notary>,
    pub map: NetworkMap,
    pub nodes: HashMap<String, Arc<PartyNode>>,
}

impl TestNet {
    pub fn node(&self, name: &str) -> &Arc<PartyNode> {
        self.nodes.get(name).expect("node in test net")
    }

    pub fn shutdown(&self) {
        for node in self.nodes.values() {
            node.shutdown();
        }
    }
}

pub fn identity(name: &str, seed: u8) -> LocalIdentity {
    LocalIdentity::from_secret(name, &[seed; 32]).expect("identity from seed")
}

/// Seeds are assigned by position: the first name gets seed 1.
pub fn identities(names: &[&str]) -> Vec<LocalIdentity> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| identity(name, i as u8 + 1))
        .collect()
}

pub fn flow_fast() -> FlowConfig {
    FlowConfig {
        response_timeout_ms: 2_000,
        send_attempts: 3,
        retry_backoff_ms: 5,
        backoff_num: 2,
        backoff_den: 1,
        backoff_cap_ms: 50,
    }
}

pub fn network_map(ids: &[LocalIdentity], notary: &Party) -> NetworkMap {
    NetworkMap::new(
        ids.iter().map(|i| i.party().clone()).collect(),
        Some(notary.clone()),
    )
}

pub fn start_node(
    network: &Arc<InMemoryNetwork>,
    identity: LocalIdentity,
    map: NetworkMap,
    store: Arc<dyn RecordStore>,
    notary: Arc<dyn NotaryService>,
    config: FlowConfig,
) -> Arc<PartyNode> {
    let inbox = network.register(identity.party());
    let ctx = NodeContext {
        identity,
        network_map: map,
        store,
        transport: Arc::clone(network) as Arc<dyn Transport>,
        notary,
        config,
    };
    Arc::new(PartyNode::start(ctx, inbox))
}

/// Every named party gets a running node with its own store from `store_for`.
pub fn build_with<F>(names: &[&str], config: FlowConfig, store_for: F) -> TestNet
where
    F: Fn(&str) -> Arc<dyn RecordStore>,
{
    let network = Arc::new(InMemoryNetwork::new());
    let notary = Arc::new(Notary::new(identity("Notary", NOTARY_SEED)));
    let ids = identities(names);
    let map = network_map(&ids, notary.notary_party());
    let mut nodes = HashMap::new();
    for id in ids {
        let name = id.party().name.clone();
        let store = store_for(&name);
        let node = start_node(
            &network,
            id,
            map.clone(),
            store,
            Arc::clone(&notary) as Arc<dyn NotaryService>,
            config.clone(),
        );
        nodes.insert(name, node);
    }
    TestNet {
        network,
        notary,
        map,
        nodes,
    }
}

pub fn build(names: &[&str]) -> TestNet {
    build_with(names, flow_fast(), |_| Arc::new(Vault::in_memory()) as Arc<dyn RecordStore>)
}

pub fn wait_until<F: Fn() -> bool>(timeout: Duration, f: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}

/// Waits for `node` to hold `expected` among its unconsumed records.
pub fn wait_for_record(node: &PartyNode, expected: &StateAndRef) -> bool {
    wait_until(Duration::from_secs(5), || {
        node.records(RecordFilter::Unconsumed).contains(expected)
    })
}

pub fn temp_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("loanledger-it-{}-{}-{}", tag, std::process::id(), nanos))
}
