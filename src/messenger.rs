//! High-level client tying the receiver and sender together.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::warn;

use crate::config::PipelineConfig;
use crate::keys::{blinded_key_pair, UserKeys};
use crate::message::{Message, MessageKind, VisibleMessage};
use crate::receiver::{MessageReceiver, ReceiveContext};
use crate::sender::MessageSender;
use crate::storage::Services;
use crate::transport::Destination;
use crate::types::{KeyError, Result, SendResult};

/// The pipeline for one local identity.
///
/// Owns the user's keys and hands the shared collaborators to both halves
/// of the pipeline.
pub struct Messenger {
    keys: UserKeys,
    sender: Arc<MessageSender>,
    receiver: MessageReceiver,
}

impl Messenger {
    pub fn new(keys: UserKeys, config: PipelineConfig, services: Services) -> Self {
        let receiver_config = config.receiver.clone();
        let sender = Arc::new(MessageSender::new(keys.clone(), config, services.clone()));
        let receiver =
            MessageReceiver::new(keys.clone(), receiver_config, services, Arc::clone(&sender));

        Self {
            keys,
            sender,
            receiver,
        }
    }

    /// Restore an identity from its 32-byte seed.
    pub fn from_seed(
        seed: &[u8],
        config: PipelineConfig,
        services: Services,
    ) -> std::result::Result<Self, KeyError> {
        Ok(Self::new(UserKeys::from_seed(seed)?, config, services))
    }

    /// This user's hex session identity.
    pub fn session_id(&self) -> String {
        self.keys.session_id()
    }

    /// Our blinded identity on the room server with `server_public_key`.
    pub fn blinded_id(&self, server_public_key: &[u8]) -> String {
        blinded_key_pair(server_public_key, self.keys.signing_key()).blinded_id()
    }

    /// Lower-level sending operations, such as an explicit key rotation.
    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }

    /// Offset of network time from local time, applied to node timestamps.
    pub fn set_clock_offset(&self, offset_ms: i64) {
        self.sender.set_clock_offset(offset_ms);
    }

    /// Process one raw envelope.
    pub async fn receive(&self, data: &[u8], context: &ReceiveContext) -> Result<Message> {
        self.receiver.receive(data, context).await
    }

    /// Process a batch of envelopes in order.
    ///
    /// A failing envelope does not stop the rest of the batch.
    pub async fn receive_all(
        &self,
        envelopes: &[Vec<u8>],
        context: &ReceiveContext,
    ) -> Vec<Result<Message>> {
        let mut results = Vec::with_capacity(envelopes.len());
        for data in envelopes {
            let result = self.receiver.receive(data, context).await;
            if let Err(e) = &result {
                if e.is_retryable() {
                    warn!(error = %e, "Envelope can't be processed yet");
                }
            }
            results.push(result);
        }
        results
    }

    /// Send `message` and return it with its routing fields filled in.
    pub async fn send(&self, message: Message, destination: &Destination) -> SendResult<Message> {
        self.sender.send(message, destination).await
    }

    pub async fn send_text(&self, text: &str, destination: &Destination) -> SendResult<Message> {
        let message = Message::new(MessageKind::Visible(VisibleMessage::text(text)));
        self.send(message, destination).await
    }

    /// Form a closed group; returns its public key.
    pub async fn create_closed_group(
        &self,
        name: &str,
        members: impl IntoIterator<Item = String>,
    ) -> SendResult<String> {
        self.sender.create_closed_group(name, members).await
    }

    /// Rename the group and reconcile its member list.
    pub async fn update_closed_group(
        &self,
        group: &str,
        members: BTreeSet<String>,
        name: &str,
    ) -> SendResult<()> {
        self.sender.update(group, members, name).await
    }

    pub async fn leave_closed_group(&self, group: &str) -> SendResult<()> {
        self.sender.leave(group).await
    }
}
