//! Pipeline configuration.

use serde::{Deserialize, Serialize};

use crate::types::DEFAULT_TTL_MS;

/// Which storage-node network messages are submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

/// Outbound message settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// TTL for message kinds without a fixed one.
    pub default_ttl_ms: u64,
    /// Proof-of-work difficulty multiplier; 0 disables the work.
    pub pow_nonce_trials: u64,
    /// Nonces tried before giving up on proof of work.
    pub max_pow_iterations: u64,
    /// Storage nodes raced per send.
    pub target_node_count: usize,
    /// Whether to ping the push server after storing a message.
    pub notify_push_server: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: DEFAULT_TTL_MS,
            pow_nonce_trials: 1,
            max_pow_iterations: 1 << 26,
            target_node_count: 3,
            notify_push_server: true,
        }
    }
}

/// Inbound message settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Accept visible messages that fail validation only because they have
    /// no body yet carry attachments.
    pub allow_attachment_only_visible_messages: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            allow_attachment_only_visible_messages: true,
        }
    }
}

/// Top-level configuration for the message pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub network: Network,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
}

impl PipelineConfig {
    /// Production network with full proof-of-work difficulty.
    pub fn mainnet() -> Self {
        Self::default()
    }

    /// Testnet nodes expect bare hex keys and accept cheaper proof of work.
    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            sender: SenderConfig {
                max_pow_iterations: 1 << 20,
                ..SenderConfig::default()
            },
            receiver: ReceiverConfig::default(),
        }
    }

    /// Load from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Whether node-facing recipients drop the identity prefix.
    pub fn strips_identity_prefix(&self) -> bool {
        self.network == Network::Testnet
    }
}
