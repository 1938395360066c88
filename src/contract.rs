// Contract verification: deterministic, side-effect free, computed from the transaction alone.
// Every party runs the same rule table before signing; the first failing rule wins.

use crate::record::LoanRecord;
use crate::transaction::{Command, CommandEntry, Transaction};
use thiserror::Error;

/// Ceiling on `interest_rate` for Lend transitions, in percent.
pub const MAX_INTEREST_RATE: i64 = 20;

pub const SINGLE_COMMAND: &str = "single command required";
pub const NO_INPUTS_ON_BORROW: &str = "no inputs should be consumed when creating a borrow request";
pub const INPUTS_ON_CONFIRM: &str = "inputs should be consumed when confirming a lender";
pub const SINGLE_OUTPUT: &str = "only one output state should be created";
pub const LENDER_REQUIRED: &str = "at least one lender is required";
pub const LENDER_IS_BORROWER: &str = "lender and borrower cannot be same entity";
pub const PARTICIPANTS_MUST_SIGN: &str = "all of the participants must be signers";
pub const AMOUNT_NOT_POSITIVE: &str = "loan amount must be positive";
pub const RATE_ABOVE_MAXIMUM: &str = "interest rate exceeds maximum";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ContractViolation {
    pub command: Option<Command>,
    pub reason: &'static str,
}

impl ContractViolation {
    fn structural(reason: &'static str) -> Self {
        Self {
            command: None,
            reason,
        }
    }
}

/// Everything a rule may look at: the transaction and its single command.
pub struct RuleContext<'a> {
    pub tx: &'a Transaction,
    pub command: &'a CommandEntry,
}

impl RuleContext<'_> {
    /// The produced record. Rules after `SINGLE_OUTPUT` may rely on exactly one existing.
    fn output(&self) -> Option<&LoanRecord> {
        self.tx.outputs.first()
    }
}

struct Rule {
    reason: &'static str,
    holds: fn(&RuleContext<'_>) -> bool,
}

fn no_inputs(ctx: &RuleContext<'_>) -> bool {
    ctx.tx.inputs.is_empty()
}

fn has_inputs(ctx: &RuleContext<'_>) -> bool {
    !ctx.tx.inputs.is_empty()
}

fn single_output(ctx: &RuleContext<'_>) -> bool {
    ctx.tx.outputs.len() == 1
}

fn has_lender(ctx: &RuleContext<'_>) -> bool {
    ctx.output().is_some_and(|out| !out.lenders.is_empty())
}

fn lender_is_not_borrower(ctx: &RuleContext<'_>) -> bool {
    ctx.output()
        .and_then(|out| out.primary_lender().map(|l| l != &out.borrower))
        .unwrap_or(false)
}

fn participants_sign(ctx: &RuleContext<'_>) -> bool {
    ctx.output().is_some_and(|out| {
        out.participant_keys()
            .iter()
            .all(|k| ctx.command.signers.contains(k))
    })
}

fn amount_positive(ctx: &RuleContext<'_>) -> bool {
    ctx.output().is_some_and(|out| out.amount > 0)
}

fn rate_within_ceiling(ctx: &RuleContext<'_>) -> bool {
    ctx.output()
        .is_some_and(|out| out.interest_rate <= MAX_INTEREST_RATE)
}

// Lend leaves the input count open and only Lend carries the rate ceiling.
const BORROW_RULES: &[Rule] = &[
    Rule { reason: NO_INPUTS_ON_BORROW, holds: no_inputs },
    Rule { reason: SINGLE_OUTPUT, holds: single_output },
    Rule { reason: LENDER_REQUIRED, holds: has_lender },
    Rule { reason: PARTICIPANTS_MUST_SIGN, holds: participants_sign },
    Rule { reason: AMOUNT_NOT_POSITIVE, holds: amount_positive },
];

const LEND_RULES: &[Rule] = &[
    Rule { reason: SINGLE_OUTPUT, holds: single_output },
    Rule { reason: LENDER_REQUIRED, holds: has_lender },
    Rule { reason: LENDER_IS_BORROWER, holds: lender_is_not_borrower },
    Rule { reason: PARTICIPANTS_MUST_SIGN, holds: participants_sign },
    Rule { reason: AMOUNT_NOT_POSITIVE, holds: amount_positive },
    Rule { reason: RATE_ABOVE_MAXIMUM, holds: rate_within_ceiling },
];

const CONFIRM_RULES: &[Rule] = &[
    Rule { reason: INPUTS_ON_CONFIRM, holds: has_inputs },
    Rule { reason: SINGLE_OUTPUT, holds: single_output },
    Rule { reason: LENDER_REQUIRED, holds: has_lender },
    Rule { reason: LENDER_IS_BORROWER, holds: lender_is_not_borrower },
    Rule { reason: PARTICIPANTS_MUST_SIGN, holds: participants_sign },
    Rule { reason: AMOUNT_NOT_POSITIVE, holds: amount_positive },
];

fn rules_for(command: Command) -> &'static [Rule] {
    match command {
        Command::Borrow => BORROW_RULES,
        Command::Lend => LEND_RULES,
        Command::Confirm => CONFIRM_RULES,
    }
}

/// Accepts or rejects `tx`. Never panics and touches nothing outside `tx`.
pub fn verify(tx: &Transaction) -> Result<(), ContractViolation> {
    let [command] = tx.commands.as_slice() else {
        return Err(ContractViolation::structural(SINGLE_COMMAND));
    };
    let ctx = RuleContext { tx, command };
    for rule in rules_for(command.command) {
        if !(rule.holds)(&ctx) {
            return Err(ContractViolation {
                command: Some(command.command),
                reason: rule.reason,
            });
        }
    }
    Ok(())
}
