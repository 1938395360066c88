use crate::identity::{parse_pubkey, NetworkMap, Party};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid pubkey hex for {0} (expected 32-byte ed25519 key)")]
    InvalidPubkey(String),
    #[error("duplicate party name {0}")]
    DuplicateParty(String),
    #[error("config parse: {0}")]
    Parse(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_id: String,
    pub parties: Vec<PartyConfig>,
    pub notary: PartyConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartyConfig {
    pub name: String,
    pub pubkey_hex: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_send_attempts")]
    pub send_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_backoff_num")]
    pub backoff_num: u64,
    #[serde(default = "default_backoff_den")]
    pub backoff_den: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,
}

fn default_response_timeout() -> u64 {
    5_000
}

fn default_send_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    50
}

fn default_backoff_num() -> u64 {
    3
}

fn default_backoff_den() -> u64 {
    2
}

fn default_backoff_cap() -> u64 {
    2_000
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout(),
            send_attempts: default_send_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            backoff_num: default_backoff_num(),
            backoff_den: default_backoff_den(),
            backoff_cap_ms: default_backoff_cap(),
        }
    }
}

impl FlowConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Delay before retry number `attempt` (0-based): base * (num/den)^attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let mut base = self.retry_backoff_ms as u128;
        let num = self.backoff_num as u128;
        let den = self.backoff_den.max(1) as u128;
        for _ in 0..attempt {
            base = base.saturating_mul(num) / den;
        }
        let capped = base.min(self.backoff_cap_ms as u128);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for per-party vault and notary snapshots; `None` keeps everything in memory.
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl PartyConfig {
    pub fn party(&self) -> Result<Party, ConfigError> {
        let key = parse_pubkey(&self.pubkey_hex)
            .map_err(|_| ConfigError::InvalidPubkey(self.name.clone()))?;
        Ok(Party::new(self.name.clone(), key))
    }
}

impl NetworkConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(format!("{}", e)))
    }

    pub fn party_infos(&self) -> Result<Vec<Party>, ConfigError> {
        let mut out: Vec<Party> = Vec::with_capacity(self.parties.len());
        for p in &self.parties {
            let party = p.party()?;
            if out.iter().any(|o| o.name == party.name) || party.name == self.notary.name {
                return Err(ConfigError::DuplicateParty(party.name));
            }
            out.push(party);
        }
        Ok(out)
    }

    pub fn network_map(&self) -> Result<NetworkMap, ConfigError> {
        let notary = self.notary.party()?;
        Ok(NetworkMap::new(self.party_infos()?, Some(notary)))
    }
}
