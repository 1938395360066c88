use loanledger_core::config::{FlowConfig, NetworkConfig, PartyConfig, StorageConfig};
use loanledger_core::flow::{
    InMemoryNetwork, NodeContext, PartyNode, ProgressStep, ProposalRequest, Transport,
};
use loanledger_core::identity::LocalIdentity;
use loanledger_core::ledger::{RecordFilter, RecordStore, Vault};
use loanledger_core::notary::{Notary, NotaryService};
use loanledger_core::record::LoanStatus;
use sha2::{Digest, Sha256};
use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const NOTARY_NAME: &str = "Notary";

fn identity_for(name: &str) -> Result<LocalIdentity, String> {
    let secret: [u8; 32] = Sha256::digest(name.as_bytes()).into();
    LocalIdentity::from_secret(name, &secret).map_err(|e| format!("{}", e))
}

fn default_config(names: &[String]) -> Result<NetworkConfig, String> {
    let party = |name: &str| -> Result<PartyConfig, String> {
        Ok(PartyConfig {
            name: name.to_string(),
            pubkey_hex: identity_for(name)?.party().key_hex(),
        })
    };
    Ok(NetworkConfig {
        network_id: "loanledger-sim".into(),
        parties: names.iter().map(|n| party(n)).collect::<Result<_, _>>()?,
        notary: party(NOTARY_NAME)?,
        flow: FlowConfig::default(),
        storage: StorageConfig::default(),
    })
}

fn open_store(data_dir: Option<&str>, name: &str) -> Result<Arc<dyn RecordStore>, String> {
    match data_dir {
        Some(dir) => Vault::open(Path::new(dir).join(name))
            .map(|v| Arc::new(v) as Arc<dyn RecordStore>)
            .map_err(|e| format!("{}", e)),
        None => Ok(Arc::new(Vault::in_memory())),
    }
}

fn run() -> Result<(), String> {
    let mut parties_arg: Option<String> = None;
    let mut config_path: Option<String> = None;
    let mut data_dir_override: Option<String> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--parties" => parties_arg = args.next(),
            "--config" => config_path = args.next(),
            "--data-dir" => data_dir_override = args.next(),
            _ => return Err(format!("unknown arg {}", arg)),
        }
    }

    let config = match config_path {
        Some(path) => {
            let json = fs::read_to_string(&path).map_err(|e| format!("read config {}: {}", path, e))?;
            NetworkConfig::from_json(&json).map_err(|e| format!("{}", e))?
        }
        None => {
            let names: Vec<String> = parties_arg
                .as_deref()
                .unwrap_or("PartyA,PartyB,PartyC")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            default_config(&names)?
        }
    };
    if config.parties.len() < 3 {
        return Err("the borrow, lend and confirm round needs at least three parties".into());
    }
    let data_dir = data_dir_override.or_else(|| config.storage.data_dir.clone());
    let network_map = config.network_map().map_err(|e| format!("{}", e))?;

    // Local keys are derived from party names, so the configured keys must agree.
    let notary_identity = identity_for(&config.notary.name)?;
    let mut identities = Vec::with_capacity(config.parties.len());
    for p in &config.parties {
        let identity = identity_for(&p.name)?;
        if identity.party().key_hex() != p.pubkey_hex {
            return Err(format!("configured key for {} does not match its derived key", p.name));
        }
        identities.push(identity);
    }
    if notary_identity.party().key_hex() != config.notary.pubkey_hex {
        return Err("configured notary key does not match its derived key".into());
    }

    let notary: Arc<dyn NotaryService> = match &data_dir {
        Some(dir) => Arc::new(Notary::open(notary_identity, Path::new(dir).join(NOTARY_NAME))?),
        None => Arc::new(Notary::new(notary_identity)),
    };
    let network = Arc::new(InMemoryNetwork::new());
    let mut nodes = Vec::with_capacity(identities.len());
    for identity in identities {
        let inbox = network.register(identity.party());
        let store = open_store(data_dir.as_deref(), &identity.party().name)?;
        let ctx = NodeContext {
            identity,
            network_map: network_map.clone(),
            store,
            transport: Arc::clone(&network) as Arc<dyn Transport>,
            notary: Arc::clone(&notary),
            config: config.flow.clone(),
        };
        nodes.push(PartyNode::start(ctx, inbox));
    }

    let names: Vec<String> = nodes.iter().map(|n| n.party().name.clone()).collect();
    let borrower = &nodes[0];
    let print_step = |step: ProgressStep| println!(">> {}", step);

    let steps = [
        ProposalRequest::borrow(1000, 5, &[names[1].as_str(), names[2].as_str()]),
        ProposalRequest::lend(500, 10, LoanStatus::InAuction, &[names[1].as_str(), names[2].as_str()]),
        ProposalRequest::confirm(500, 10, LoanStatus::Closed, names[1].as_str()),
    ];
    for request in steps {
        let command = request.command;
        match borrower.propose(request, &print_step) {
            Ok(done) => println!(
                "{} by {}: transaction id {} committed to ledger.",
                command,
                borrower.party(),
                done.tx_id_hex()
            ),
            Err(e) => println!("{} by {} failed: {}", command, borrower.party(), e),
        }
    }

    // Finalised transactions reach counterparties asynchronously.
    std::thread::sleep(std::time::Duration::from_millis(200));
    for node in &nodes {
        println!("{}:", node.party());
        for record in node.records(RecordFilter::Unconsumed) {
            let lenders: Vec<&str> = record.state.lenders.iter().map(|l| l.name.as_str()).collect();
            println!(
                "  {} amount={} rate={} borrower={} lenders=[{}] status={}",
                record.state.id,
                record.state.amount,
                record.state.interest_rate,
                record.state.borrower,
                lenders.join(","),
                record.state.status
            );
        }
    }
    for node in &nodes {
        node.shutdown();
    }
    Ok(())
}

/// Logs go to stderr so they never interleave with the ledger listing; `RUST_LOG` overrides the level.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_logging();
    if let Err(e) = run() {
        eprintln!("{}", e);
        process::exit(1);
    }
}
