use crate::identity::{PublicKey, TransactionSignature};
use crate::transaction::{NotarisedTransaction, SignedTransaction};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Frames larger than this are refused on decode.
pub const MAX_FRAME_BYTES: usize = 8_000_000;

/// One proposer flow instance; unique per initiator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub initiator: PublicKey,
    pub seq: u64,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", &hex_encode(self.initiator)[..8], self.seq)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowPayload {
    /// Partially signed transaction sent to a counterparty for endorsement.
    Propose(SignedTransaction),
    Endorse(TransactionSignature),
    Reject { reason: String },
    /// Certified transaction distributed to participants after notarisation.
    Finalised(NotarisedTransaction),
}

impl FlowPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            FlowPayload::Propose(_) => "propose",
            FlowPayload::Endorse(_) => "endorse",
            FlowPayload::Reject { .. } => "reject",
            FlowPayload::Finalised(_) => "finalised",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub session: SessionId,
    pub sender: PublicKey,
    pub payload: FlowPayload,
}

/// Length-prefixed (u32 LE) JSON frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, String> {
    let data = serde_json::to_vec(envelope).map_err(|e| format!("{}", e))?;
    let mut out = Vec::with_capacity(4 + data.len());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&data);
    Ok(out)
}

pub fn decode_frame(frame: &[u8]) -> Result<Envelope, String> {
    if frame.len() < 4 {
        return Err("short frame".into());
    }
    let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err("invalid message length".into());
    }
    if frame.len() != 4 + len {
        return Err("frame length mismatch".into());
    }
    serde_json::from_slice(&frame[4..]).map_err(|e| format!("{}", e))
}
