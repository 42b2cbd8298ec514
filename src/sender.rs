//! Outbound half of the pipeline.
//!
//! A send validates the message, serializes and pads its content, encrypts
//! it for the destination, wraps it in an envelope, attaches proof of work
//! and races the result across several storage nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::crypto::{encrypt_blinded, encrypt_session};
use crate::envelope::{Envelope, EnvelopeType};
use crate::groups::GroupKeyPair;
use crate::keys::{parse_session_id, UserKeys};
use crate::message::{Message, MessageKind};
use crate::pow;
use crate::storage::Services;
use crate::transport::{store_first_success, Destination, SnodeMessage};
use crate::types::{now_ms, SendError, SendResult, STANDARD_ID_PREFIX};

/// Encrypts and submits messages on behalf of the local user.
pub struct MessageSender {
    pub(crate) keys: UserKeys,
    pub(crate) config: PipelineConfig,
    pub(crate) services: Services,
    /// Offset between the local clock and network time, in milliseconds.
    clock_offset_ms: AtomicI64,
    last_timestamp: AtomicU64,
    /// Key pairs broadcast to a group but not yet persisted, per group.
    pub(crate) distributing: RwLock<HashMap<String, Vec<GroupKeyPair>>>,
}

impl MessageSender {
    pub fn new(keys: UserKeys, config: PipelineConfig, services: Services) -> Self {
        Self {
            keys,
            config,
            services,
            clock_offset_ms: AtomicI64::new(0),
            last_timestamp: AtomicU64::new(0),
            distributing: RwLock::new(HashMap::new()),
        }
    }

    /// Session identity messages are sent from.
    pub fn session_id(&self) -> String {
        self.keys.session_id()
    }

    /// Set the measured offset of network time from local time.
    pub fn set_clock_offset(&self, offset_ms: i64) {
        self.clock_offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    /// A sent timestamp strictly greater than any handed out before.
    pub(crate) fn next_timestamp(&self) -> u64 {
        let now = now_ms();
        let previous = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }

    fn network_timestamp(&self, sent_timestamp: u64) -> u64 {
        let offset = self.clock_offset_ms.load(Ordering::Relaxed);
        sent_timestamp.saturating_add_signed(offset)
    }

    /// Send `message` and, where applicable, a sync copy to the local user.
    ///
    /// Returns the message with its routing fields filled in.
    pub async fn send(&self, message: Message, destination: &Destination) -> SendResult<Message> {
        let sent = self.send_message(message, destination, false).await?;

        let Destination::Contact { public_key } = destination else {
            return Ok(sent);
        };
        let wants_sync = matches!(
            sent.kind,
            MessageKind::Visible(_) | MessageKind::ExpirationTimerUpdate { .. }
        );
        if wants_sync && *public_key != self.session_id() {
            let mut sync = sent.clone();
            sync.set_sync_target(public_key.clone());
            let own = Destination::Contact {
                public_key: self.session_id(),
            };
            if let Err(e) = self.send_message(sync, &own, true).await {
                warn!(error = %e, "Couldn't send sync message");
            }
        }

        Ok(sent)
    }

    pub(crate) async fn send_message(
        &self,
        message: Message,
        destination: &Destination,
        is_sync: bool,
    ) -> SendResult<Message> {
        match destination {
            Destination::Contact { .. } | Destination::ClosedGroup { .. } => {
                self.send_to_snode(message, destination, is_sync).await
            }
            Destination::OpenGroup { server, room } => {
                self.send_to_open_group(message, server, room).await
            }
            Destination::OpenGroupInbox {
                server,
                server_public_key,
                blinded_public_key,
            } => {
                self.send_to_inbox(message, server, server_public_key, blinded_public_key)
                    .await
            }
        }
    }

    async fn send_to_snode(
        &self,
        mut message: Message,
        destination: &Destination,
        is_sync: bool,
    ) -> SendResult<Message> {
        let user_id = self.session_id();
        if message.sent_timestamp.is_none() {
            message.sent_timestamp = Some(self.next_timestamp());
        }
        message.sender = Some(user_id.clone());
        let recipient = match destination {
            Destination::Contact { public_key } => public_key.clone(),
            Destination::ClosedGroup { group_public_key } => {
                message.group_public_key = Some(group_public_key.clone());
                group_public_key.clone()
            }
            _ => return Err(SendError::InvalidMessage),
        };
        message.recipient = Some(recipient.clone());

        if !message.is_valid() {
            return Err(SendError::InvalidMessage);
        }

        let must_transmit = matches!(
            message.kind,
            MessageKind::Configuration(_) | MessageKind::UnsendRequest { .. }
        ) || is_sync
            || message.is_new_closed_group();
        if recipient == user_id && !must_transmit {
            debug!(kind = message.kind.name(), "Self-send handled locally");
            return Ok(message);
        }

        let plaintext = message
            .to_content()
            .to_padded_bytes()
            .map_err(|_| SendError::ProtoConversionFailed)?;

        let (envelope_type, source, ciphertext) = match destination {
            Destination::ClosedGroup { group_public_key } => {
                let key_pair = self
                    .services
                    .groups
                    .latest_key(group_public_key)
                    .await?
                    .ok_or(SendError::NoKeyPair)?;
                let ciphertext = encrypt_session(&plaintext, &key_pair.public_key, &self.keys)?;
                (
                    EnvelopeType::ClosedGroupMessage,
                    group_public_key.clone(),
                    ciphertext,
                )
            }
            _ => {
                let recipient_key =
                    parse_session_id(&recipient).map_err(|_| SendError::NoUserPublicKey)?;
                let ciphertext = encrypt_session(&plaintext, &recipient_key, &self.keys)?;
                (EnvelopeType::SessionMessage, String::new(), ciphertext)
            }
        };

        let sent_timestamp = message.sent_timestamp.unwrap_or_default();
        let envelope = Envelope {
            envelope_type,
            source,
            content: ciphertext,
            timestamp: sent_timestamp,
            server_timestamp: None,
            server_message_id: None,
        };
        let data = STANDARD.encode(envelope.encode()?);

        let ttl = message.ttl(self.config.sender.default_ttl_ms);
        let timestamp = self.network_timestamp(sent_timestamp);
        let node_recipient = if self.config.strips_identity_prefix() {
            recipient
                .strip_prefix(STANDARD_ID_PREFIX)
                .unwrap_or(&recipient)
                .to_string()
        } else {
            recipient.clone()
        };

        let nonce = self
            .proof_of_work(timestamp, ttl, &node_recipient, &data)
            .await?;

        let snode_message = SnodeMessage {
            recipient: node_recipient,
            data,
            ttl,
            timestamp,
            nonce,
        };

        let mut nodes = self.services.snodes.target_nodes(&recipient).await?;
        nodes.truncate(self.config.sender.target_node_count.max(1));
        store_first_success(self.services.snodes.as_ref(), &nodes, &snode_message).await?;

        // Polling our own swarm or the group's must not process this again.
        self.services.ledger.add(sent_timestamp).await?;

        let should_notify = matches!(
            message.kind,
            MessageKind::Visible(_) | MessageKind::UnsendRequest { .. }
        ) && !is_sync
            && self.config.sender.notify_push_server;
        if should_notify {
            let push = Arc::clone(&self.services.push);
            let data = snode_message.data;
            tokio::spawn(async move {
                if let Err(e) = push.notify(&recipient, &data).await {
                    warn!(recipient = %recipient, error = %e, "Couldn't notify push server");
                }
            });
        }

        Ok(message)
    }

    async fn proof_of_work(
        &self,
        timestamp: u64,
        ttl: u64,
        recipient: &str,
        data: &str,
    ) -> SendResult<String> {
        let recipient = recipient.to_string();
        let data = data.to_string();
        let trials = self.config.sender.pow_nonce_trials;
        let max_iterations = self.config.sender.max_pow_iterations;

        let nonce = tokio::task::spawn_blocking(move || {
            pow::calculate(timestamp, ttl, &recipient, &data, trials, max_iterations)
        })
        .await
        .ok()
        .flatten();

        nonce.ok_or_else(|| {
            warn!(timestamp, ttl, "Proof of work calculation failed");
            SendError::ProofOfWorkCalculationFailed
        })
    }

    async fn send_to_open_group(
        &self,
        mut message: Message,
        server: &str,
        room: &str,
    ) -> SendResult<Message> {
        if !matches!(message.kind, MessageKind::Visible(_)) {
            return Err(SendError::InvalidMessage);
        }
        if message.sent_timestamp.is_none() {
            message.sent_timestamp = Some(self.next_timestamp());
        }
        message.sender = Some(self.session_id());
        message.recipient = Some(room.to_string());
        if !message.is_valid() {
            return Err(SendError::InvalidMessage);
        }

        let plaintext = message
            .to_content()
            .to_padded_bytes()
            .map_err(|_| SendError::ProtoConversionFailed)?;
        let transport = self
            .services
            .open_groups
            .as_ref()
            .ok_or_else(|| SendError::Transport("No open group transport".into()))?;

        let server_id = transport.send_message(server, room, &plaintext).await?;
        message.open_group_server_message_id = Some(server_id);
        Ok(message)
    }

    async fn send_to_inbox(
        &self,
        mut message: Message,
        server: &str,
        server_public_key: &[u8; 32],
        blinded_public_key: &str,
    ) -> SendResult<Message> {
        if message.sent_timestamp.is_none() {
            message.sent_timestamp = Some(self.next_timestamp());
        }
        message.sender = Some(self.session_id());
        message.recipient = Some(blinded_public_key.to_string());
        if !message.is_valid() {
            return Err(SendError::InvalidMessage);
        }

        let plaintext = message
            .to_content()
            .to_padded_bytes()
            .map_err(|_| SendError::ProtoConversionFailed)?;
        let ciphertext =
            encrypt_blinded(&plaintext, blinded_public_key, server_public_key, &self.keys)?;
        let transport = self
            .services
            .open_groups
            .as_ref()
            .ok_or_else(|| SendError::Transport("No open group transport".into()))?;

        let server_id = transport
            .send_inbox(server, blinded_public_key, &ciphertext)
            .await?;
        message.open_group_server_message_id = Some(server_id);
        Ok(message)
    }
}
