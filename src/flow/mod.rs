pub mod collect;
pub mod messages;
pub mod node;
pub mod progress;
pub mod transport;

pub use collect::{AggregatorState, ResponderState, SignatureAggregator, SignatureResponder};
pub use messages::{Envelope, FlowPayload, SessionId};
pub use node::{FinalisedRecord, NodeContext, PartyNode, ProposalRequest};
pub use progress::{NoProgress, ProgressObserver, ProgressStep};
pub use transport::{send_with_retry, InMemoryNetwork, Transport};
