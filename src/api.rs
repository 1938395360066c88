// Request/response facade over a party node: name-based inputs, status-coded replies.

use crate::flow::{NoProgress, PartyNode, ProposalRequest};
use crate::ledger::RecordFilter;
use crate::record::{LoanRecord, LoanStatus};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseStatus {
    Created,
    BadRequest,
}

impl ResponseStatus {
    pub fn code(&self) -> u16 {
        match self {
            ResponseStatus::Created => 201,
            ResponseStatus::BadRequest => 400,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: ResponseStatus,
    pub body: String,
}

impl ApiResponse {
    fn created(body: String) -> Self {
        Self {
            status: ResponseStatus::Created,
            body,
        }
    }

    fn bad_request(body: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::BadRequest,
            body: body.into(),
        }
    }

    pub fn is_created(&self) -> bool {
        self.status == ResponseStatus::Created
    }
}

pub struct LoanApi {
    node: Arc<PartyNode>,
}

impl LoanApi {
    pub fn new(node: Arc<PartyNode>) -> Self {
        Self { node }
    }

    pub fn whoami(&self) -> String {
        self.node.party().name.clone()
    }

    /// Known parties other than this node and the notary.
    pub fn peers(&self) -> Vec<String> {
        let me = &self.node.party().name;
        let map = self.node.network_map();
        let notary = map.notary().map(|n| &n.name);
        map.parties()
            .iter()
            .filter(|p| &p.name != me && Some(&p.name) != notary)
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn loan_requests(&self) -> Vec<LoanRecord> {
        self.node
            .records(RecordFilter::Unconsumed)
            .into_iter()
            .map(|s| s.state)
            .collect()
    }

    pub fn create_loan(&self, amount: i64, interest_rate: i64, lenders: &[&str]) -> ApiResponse {
        if amount <= 0 {
            return ApiResponse::bad_request("loan amount must be positive");
        }
        if lenders.len() < 2 {
            return ApiResponse::bad_request("borrow request requires at least two lenders");
        }
        if let Some(missing) = self.first_unknown(lenders) {
            return ApiResponse::bad_request(format!("Party named {} cannot be found.", missing));
        }
        self.run(ProposalRequest::borrow(amount, interest_rate, lenders))
    }

    pub fn lend_loan(&self, amount: i64, interest_rate: i64, acceptors: &[&str]) -> ApiResponse {
        if let Some(missing) = self.first_unknown(acceptors) {
            return ApiResponse::bad_request(format!("Party named {} cannot be found.", missing));
        }
        self.run(ProposalRequest::lend(amount, interest_rate, LoanStatus::InAuction, acceptors))
    }

    pub fn confirm_lender(&self, amount: i64, interest_rate: i64, lender: &str) -> ApiResponse {
        if let Some(missing) = self.first_unknown(&[lender]) {
            return ApiResponse::bad_request(format!("Party named {} cannot be found.", missing));
        }
        self.run(ProposalRequest::confirm(amount, interest_rate, LoanStatus::Closed, lender))
    }

    fn first_unknown<'a>(&self, names: &[&'a str]) -> Option<&'a str> {
        let map = self.node.network_map();
        names
            .iter()
            .copied()
            .find(|name| map.well_known_party(name).is_none())
    }

    fn run(&self, request: ProposalRequest) -> ApiResponse {
        let command = request.command;
        match self.node.propose(request, &NoProgress) {
            Ok(done) => ApiResponse::created(format!(
                "Transaction id {} committed to ledger.",
                done.tx_id_hex()
            )),
            Err(err) => {
                warn!(party = %self.node.party(), %command, error = %err, "loan request failed");
                ApiResponse::bad_request(err.to_string())
            }
        }
    }
}
