// Multi-party loan ledger: jointly signed, notarised transitions of loan records.

pub mod api;
pub mod config;
pub mod contract;
pub mod error;
pub mod flow;
pub mod identity;
pub mod ledger;
pub mod notary;
pub mod record;
pub mod storage;
pub mod transaction;

// Folded into every transaction id.
pub const PROTOCOL_VERSION: u8 = 1;
