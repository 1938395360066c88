// Point-to-point messaging between identified parties.

use crate::config::FlowConfig;
use crate::error::NetworkError;
use crate::flow::messages::{encode_frame, Envelope};
use crate::identity::{Party, PublicKey};
use hex::encode as hex_encode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc;
use std::thread;
use tracing::warn;

pub trait Transport: Send + Sync {
    fn send(&self, to: &PublicKey, envelope: &Envelope) -> Result<(), NetworkError>;
}

/// In-process network: one frame channel per registered party.
#[derive(Default)]
pub struct InMemoryNetwork {
    peers: Mutex<HashMap<PublicKey, (String, mpsc::Sender<Vec<u8>>)>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `party` and returns its inbox. Re-registering replaces the old inbox.
    pub fn register(&self, party: &Party) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel();
        self.peers.lock().insert(party.key, (party.name.clone(), tx));
        rx
    }

    pub fn disconnect(&self, key: &PublicKey) {
        self.peers.lock().remove(key);
    }
}

impl Transport for InMemoryNetwork {
    fn send(&self, to: &PublicKey, envelope: &Envelope) -> Result<(), NetworkError> {
        let frame = encode_frame(envelope).map_err(|_| NetworkError::Disconnected(hex_encode(to)))?;
        let peers = self.peers.lock();
        let Some((name, sender)) = peers.get(to) else {
            return Err(NetworkError::UnknownPeer(hex_encode(to)));
        };
        sender
            .send(frame)
            .map_err(|_| NetworkError::Disconnected(name.clone()))
    }
}

/// Sends with bounded retries, sleeping `cfg.backoff(n)` between attempts.
pub fn send_with_retry(
    transport: &dyn Transport,
    cfg: &FlowConfig,
    to: &Party,
    envelope: &Envelope,
) -> Result<(), NetworkError> {
    let attempts = cfg.send_attempts.max(1);
    let mut attempt = 0;
    loop {
        match transport.send(&to.key, envelope) {
            Ok(()) => return Ok(()),
            Err(err) if attempt + 1 < attempts => {
                warn!(party = %to, attempt, ?err, kind = envelope.payload.kind(), "send failed; retrying");
                thread::sleep(cfg.backoff(attempt));
                attempt += 1;
            }
            Err(NetworkError::UnknownPeer(_)) => return Err(NetworkError::UnknownPeer(to.name.clone())),
            Err(err) => return Err(err),
        }
    }
}
