//! Inbound half of the pipeline.
//!
//! [`MessageReceiver::receive`] turns raw envelope bytes into a validated,
//! deduplicated [`Message`] and dispatches it to its handler. Errors carry
//! [`ReceiveError::is_retryable`] so callers can park envelopes whose key
//! material has not arrived yet.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ReceiverConfig;
use crate::content::Content;
use crate::crypto::{decrypt_blinded, decrypt_session};
use crate::envelope::{Envelope, EnvelopeType};
use crate::groups::GroupKeyPair;
use crate::keys::{parse_session_id, UserKeys};
use crate::message::{ClosedGroupControlMessage, Message, MessageKind};
use crate::sender::MessageSender;
use crate::storage::Services;
use crate::types::{now_ms, ReceiveError, Result};

/// Where an envelope was fetched from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReceiveSource {
    /// The user's own swarm or a closed group's swarm.
    #[default]
    Swarm,
    /// A public room; content arrives unencrypted.
    OpenGroup { server: String, room: String },
    /// A blinded 1:1 message from a room server's inbox.
    OpenGroupInbox {
        server_public_key: [u8; 32],
        other_blinded_id: String,
        is_outgoing: bool,
    },
}

/// Per-envelope receive options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveContext {
    /// Skip the duplicate check; set when reprocessing a parked envelope.
    pub is_retry: bool,
    pub source: ReceiveSource,
}

impl ReceiveContext {
    /// Reprocess an envelope that already went through the ledger.
    pub fn retry() -> Self {
        Self {
            is_retry: true,
            ..Default::default()
        }
    }
}

/// Decrypts, validates and dispatches inbound envelopes.
pub struct MessageReceiver {
    pub(crate) keys: UserKeys,
    pub(crate) config: ReceiverConfig,
    pub(crate) services: Services,
    pub(crate) sender: Arc<MessageSender>,
}

impl MessageReceiver {
    pub fn new(
        keys: UserKeys,
        config: ReceiverConfig,
        services: Services,
        sender: Arc<MessageSender>,
    ) -> Self {
        Self {
            keys,
            config,
            services,
            sender,
        }
    }

    pub(crate) fn session_id(&self) -> String {
        self.keys.session_id()
    }

    /// Process one envelope end to end.
    pub async fn receive(&self, data: &[u8], context: &ReceiveContext) -> Result<Message> {
        let message = self.parse(data, context).await?;
        self.handle(&message).await?;
        Ok(message)
    }

    /// Decode, decrypt and validate an envelope without dispatching it.
    ///
    /// The envelope timestamp is recorded in the dedup ledger on success.
    pub async fn parse(&self, data: &[u8], context: &ReceiveContext) -> Result<Message> {
        let user_id = self.session_id();

        let envelope = Envelope::decode(data)?;
        if envelope.content.is_empty() {
            return Err(ReceiveError::NoData);
        }

        let (plaintext, sender, group_public_key) = match &context.source {
            ReceiveSource::OpenGroup { .. } => {
                (envelope.content.clone(), envelope.source.clone(), None)
            }
            ReceiveSource::OpenGroupInbox {
                server_public_key,
                other_blinded_id,
                is_outgoing,
            } => {
                let (plaintext, sender) = decrypt_blinded(
                    &envelope.content,
                    *is_outgoing,
                    other_blinded_id,
                    server_public_key,
                    &self.keys,
                )?;
                (plaintext, sender, None)
            }
            ReceiveSource::Swarm => match envelope.envelope_type {
                EnvelopeType::SessionMessage => {
                    let (plaintext, sender) = decrypt_session(
                        &envelope.content,
                        self.keys.x25519_private_key(),
                        self.keys.x25519_public_key(),
                    )?;
                    (plaintext, sender, None)
                }
                EnvelopeType::ClosedGroupMessage => {
                    let group = envelope.source.clone();
                    let (plaintext, sender) =
                        self.decrypt_with_key_history(&envelope.content, &group).await?;
                    (plaintext, sender, Some(group))
                }
                EnvelopeType::Unknown(tag) => {
                    debug!(tag, "Unknown envelope type");
                    return Err(ReceiveError::UnknownEnvelopeType);
                }
            },
        };

        if self.services.blocklist.is_blocked(&sender).await? {
            return Err(ReceiveError::SenderBlocked);
        }

        let content = Content::from_padded_bytes(&plaintext)?;
        let mut message = Message::from_content(&content).ok_or(ReceiveError::UnknownMessage)?;

        if sender == user_id && !message.is_self_send_valid() {
            return Err(ReceiveError::SelfSend);
        }

        let is_open_group = matches!(context.source, ReceiveSource::OpenGroup { .. });
        if is_open_group && !matches!(message.kind, MessageKind::Visible(_)) {
            return Err(ReceiveError::InvalidMessage);
        }

        message.sender = Some(sender);
        message.recipient = Some(match &context.source {
            ReceiveSource::OpenGroup { room, .. } => room.clone(),
            _ => user_id,
        });
        message.sent_timestamp = Some(envelope.timestamp);
        message.received_timestamp = Some(now_ms());
        message.group_public_key = group_public_key;
        message.open_group_server_message_id = envelope.server_message_id;

        if !message.is_valid() && !self.is_tolerated_attachment_message(&message) {
            return Err(ReceiveError::InvalidMessage);
        }

        let tolerate_duplicate = context.is_retry || message.is_new_closed_group();
        let first_seen = self.services.ledger.insert(envelope.timestamp).await?;
        if !first_seen && !tolerate_duplicate {
            return Err(ReceiveError::DuplicateMessage);
        }

        Ok(message)
    }

    /// Try the group's keys newest first; the last failure is returned.
    async fn decrypt_with_key_history(
        &self,
        ciphertext: &[u8],
        group: &str,
    ) -> Result<(Vec<u8>, String)> {
        if parse_session_id(group).is_err() {
            return Err(ReceiveError::InvalidGroupPublicKey);
        }
        let key_history = self.services.groups.key_history(group).await?;
        if key_history.is_empty() {
            return Err(ReceiveError::NoGroupKeyPair);
        }

        let mut last_error = ReceiveError::NoGroupKeyPair;
        for key_pair in key_history.iter().rev() {
            match decrypt_session(ciphertext, &key_pair.secret(), &key_pair.public()) {
                Ok(decrypted) => return Ok(decrypted),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    /// Visible messages may carry only attachments.
    fn is_tolerated_attachment_message(&self, message: &Message) -> bool {
        if !self.config.allow_attachment_only_visible_messages {
            return false;
        }
        match &message.kind {
            MessageKind::Visible(visible) => {
                !visible.attachments.is_empty() && message.has_valid_routing()
            }
            _ => false,
        }
    }

    /// Run the handler for a parsed message.
    pub async fn handle(&self, message: &Message) -> Result<()> {
        let sender = message.sender.clone().unwrap_or_default();
        let from_self = sender == self.session_id();

        match &message.kind {
            MessageKind::ClosedGroupControl(control) => {
                self.handle_closed_group_control(message, control).await
            }
            MessageKind::ExpirationTimerUpdate {
                duration_seconds, ..
            } => {
                if let Some(group) = &message.group_public_key {
                    if let Some(mut membership) = self.services.groups.membership(group).await? {
                        membership.expiration_timer = *duration_seconds;
                        self.services.groups.set_membership(membership).await?;
                    }
                }
                self.services.messages.record(message).await?;
                Ok(())
            }
            MessageKind::Configuration(configuration) => {
                if !from_self {
                    debug!(sender = %sender, "Ignoring configuration message from another user");
                    return Ok(());
                }
                for contact in &configuration.contacts {
                    if contact.is_approved {
                        self.services
                            .contacts
                            .set_approved(&contact.public_key, true)
                            .await?;
                    }
                }
                let known = self.services.groups.group_public_keys().await?;
                for group in &configuration.closed_groups {
                    if known.contains(&group.public_key) {
                        continue;
                    }
                    let key_pair = match GroupKeyPair::from_proto(&group.encryption_key_pair) {
                        Ok(key_pair) => key_pair,
                        Err(_) => {
                            warn!(group = %group.public_key, "Skipping group with malformed key pair");
                            continue;
                        }
                    };
                    let new_group = ClosedGroupControlMessage::New {
                        public_key: group.public_key.clone(),
                        name: group.name.clone(),
                        key_pair,
                        members: group.members.clone(),
                        admins: group.admins.clone(),
                        expiration_timer: group.expiration_timer,
                    };
                    self.handle_closed_group_control(message, &new_group).await?;
                }
                self.services.messages.record(message).await?;
                Ok(())
            }
            MessageKind::UnsendRequest { timestamp, author } => {
                if sender != *author && !from_self {
                    warn!(sender = %sender, author = %author, "Ignoring unsend request for another author");
                    return Ok(());
                }
                if self.services.messages.remove(author, *timestamp).await? {
                    info!(author = %author, timestamp, "Deleted message on request");
                }
                Ok(())
            }
            MessageKind::MessageRequestResponse { is_approved } => {
                if from_self {
                    return Ok(());
                }
                if *is_approved {
                    self.services.contacts.set_approved(&sender, true).await?;
                }
                self.services.messages.record(message).await?;
                Ok(())
            }
            MessageKind::ReadReceipt { .. }
            | MessageKind::TypingIndicator { .. }
            | MessageKind::DataExtractionNotification { .. }
            | MessageKind::Visible(_) => {
                debug!(kind = message.kind.name(), sender = %sender, "Recording message");
                self.services.messages.record(message).await?;
                Ok(())
            }
        }
    }
}
