//! Transport interfaces for storage nodes and open-group servers.
//!
//! The pipeline does not route bytes itself. It hands a [`SnodeMessage`] to
//! a [`SnodeTransport`] implementation, racing several target nodes and
//! settling on the first one that accepts.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::pow;
use crate::types::{SendError, SendResult};

/// A storage node endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Snode {
    pub address: String,
    pub port: u16,
}

impl Snode {
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
        }
    }
}

impl fmt::Display for Snode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A message as submitted to a storage node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnodeMessage {
    /// Recipient identity (prefix stripped on testnet).
    pub recipient: String,
    /// Base64 encoded envelope.
    pub data: String,
    pub ttl: u64,
    pub timestamp: u64,
    /// Base64 proof-of-work nonce.
    pub nonce: String,
}

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Contact {
        public_key: String,
    },
    ClosedGroup {
        group_public_key: String,
    },
    /// A public room; content is sent unencrypted over the room's own channel.
    OpenGroup {
        server: String,
        room: String,
    },
    /// A blinded 1:1 message through a room server's inbox.
    OpenGroupInbox {
        server: String,
        server_public_key: [u8; 32],
        blinded_public_key: String,
    },
}

/// Client for the storage-node network.
#[async_trait::async_trait]
pub trait SnodeTransport: Send + Sync {
    /// Nodes responsible for storing messages for `public_key`.
    async fn target_nodes(&self, public_key: &str) -> SendResult<Vec<Snode>>;

    /// Store a message on one node.
    async fn store(&self, node: &Snode, message: &SnodeMessage) -> SendResult<()>;
}

/// Client for open-group room servers.
#[async_trait::async_trait]
pub trait OpenGroupTransport: Send + Sync {
    /// Post to a room; returns the server-assigned message id.
    async fn send_message(&self, server: &str, room: &str, data: &[u8]) -> SendResult<u64>;

    /// Deliver to a blinded recipient's inbox on the server.
    async fn send_inbox(&self, server: &str, recipient: &str, data: &[u8]) -> SendResult<u64>;
}

/// Submit `message` to every node concurrently.
///
/// Resolves with the first node that accepts. Fails only when every node
/// has failed; the remaining in-flight requests are dropped on success.
pub async fn store_first_success(
    transport: &dyn SnodeTransport,
    nodes: &[Snode],
    message: &SnodeMessage,
) -> SendResult<Snode> {
    if nodes.is_empty() {
        return Err(SendError::Transport("No target nodes".into()));
    }

    let mut pending: FuturesUnordered<_> = nodes
        .iter()
        .map(|node| async move { (node, transport.store(node, message).await) })
        .collect();

    let mut last_error = None;
    while let Some((node, result)) = pending.next().await {
        match result {
            Ok(()) => {
                debug!(node = %node, recipient = %message.recipient, "Message stored");
                return Ok(node.clone());
            }
            Err(e) => {
                warn!(node = %node, error = %e, "Couldn't store message on node");
                last_error = Some(e);
            }
        }
    }

    Err(SendError::Transport(format!(
        "All {} nodes failed, last error: {}",
        nodes.len(),
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

// ============================================================================
// In-memory swarm
// ============================================================================

/// In-process stand-in for a storage-node swarm.
///
/// Every node shares one replicated store; identical submissions for the
/// same recipient are kept once. Individual nodes can be marked as failing.
#[derive(Default)]
pub struct InMemorySwarm {
    nodes: Vec<Snode>,
    failing: Arc<RwLock<HashSet<Snode>>>,
    stored: Arc<RwLock<HashMap<String, Vec<SnodeMessage>>>>,
    nonce_trials: u64,
}

impl InMemorySwarm {
    /// A swarm of `node_count` healthy nodes.
    pub fn new(node_count: usize) -> Self {
        Self {
            nodes: (0..node_count)
                .map(|i| Snode::new(&format!("10.0.0.{}", i + 1), 22021))
                .collect(),
            ..Default::default()
        }
    }

    /// Require proof of work at `nonce_trials` difficulty before storing.
    pub fn with_nonce_trials(mut self, nonce_trials: u64) -> Self {
        self.nonce_trials = nonce_trials;
        self
    }

    pub fn nodes(&self) -> &[Snode] {
        &self.nodes
    }

    /// Make `node` refuse every store.
    pub async fn fail_node(&self, node: &Snode) {
        self.failing.write().await.insert(node.clone());
    }

    pub async fn fail_all(&self) {
        self.failing.write().await.extend(self.nodes.iter().cloned());
    }

    /// Messages stored for `recipient`, oldest first.
    pub async fn fetch(&self, recipient: &str) -> Vec<SnodeMessage> {
        let stored = self.stored.read().await;
        stored.get(recipient).cloned().unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl SnodeTransport for InMemorySwarm {
    async fn target_nodes(&self, _public_key: &str) -> SendResult<Vec<Snode>> {
        Ok(self.nodes.clone())
    }

    async fn store(&self, node: &Snode, message: &SnodeMessage) -> SendResult<()> {
        if self.failing.read().await.contains(node) {
            return Err(SendError::Transport(format!("{} unreachable", node)));
        }
        let valid_pow = pow::verify(
            &message.nonce,
            message.timestamp,
            message.ttl,
            &message.recipient,
            &message.data,
            self.nonce_trials,
        );
        if !valid_pow {
            return Err(SendError::Transport(format!("{} rejected proof of work", node)));
        }
        let mut stored = self.stored.write().await;
        let inbox = stored.entry(message.recipient.clone()).or_default();
        if !inbox.iter().any(|m| m.data == message.data) {
            inbox.push(message.clone());
        }
        Ok(())
    }
}
