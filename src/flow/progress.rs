use std::fmt;

/// Checkpoints a proposer flow passes through, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStep {
    GeneratingTransaction,
    VerifyingTransaction,
    SigningTransaction,
    GatheringSignatures,
    Finalising,
}

impl ProgressStep {
    pub const ALL: [ProgressStep; 5] = [
        ProgressStep::GeneratingTransaction,
        ProgressStep::VerifyingTransaction,
        ProgressStep::SigningTransaction,
        ProgressStep::GatheringSignatures,
        ProgressStep::Finalising,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ProgressStep::GeneratingTransaction => "Generating transaction based on new loan request.",
            ProgressStep::VerifyingTransaction => "Verifying contract constraints.",
            ProgressStep::SigningTransaction => "Signing transaction with our private key.",
            ProgressStep::GatheringSignatures => "Gathering the counterparties' signatures.",
            ProgressStep::Finalising => "Obtaining notary signature and recording transaction.",
        }
    }
}

impl fmt::Display for ProgressStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub trait ProgressObserver {
    fn on_step(&self, step: ProgressStep);
}

impl<F: Fn(ProgressStep)> ProgressObserver for F {
    fn on_step(&self, step: ProgressStep) {
        self(step)
    }
}

/// Observer that discards every step.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_step(&self, _step: ProgressStep) {}
}
