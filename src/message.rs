//! Typed messages decoded from, and encoded to, [`Content`].
//!
//! Decoding tries each variant in a fixed priority order and the first one
//! that matches wins:
//!
//! 1. ReadReceipt
//! 2. TypingIndicator
//! 3. ClosedGroupControl
//! 4. DataExtractionNotification
//! 5. ExpirationTimerUpdate
//! 6. Configuration
//! 7. UnsendRequest
//! 8. MessageRequestResponse
//! 9. Visible

use crate::content::{
    AttachmentPointer, ClosedGroupControlProto, ClosedGroupControlType, ConfigClosedGroup,
    ConfigContact, ConfigurationProto, Content, DataExtractionProto, DataExtractionType,
    DataMessage, KeyPairWrapperProto, MessageRequestResponseProto, ReceiptMessage, ReceiptType,
    TypingAction, TypingMessage, UnsendProto, EXPIRATION_TIMER_UPDATE_FLAG,
};
use crate::groups::GroupKeyPair;
use crate::types::{CONFIGURATION_TTL_MS, TYPING_INDICATOR_TTL_MS};

/// A decoded message plus the routing fields the receiver fills in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub sent_timestamp: Option<u64>,
    pub received_timestamp: Option<u64>,
    pub group_public_key: Option<String>,
    pub thread_id: Option<String>,
    pub open_group_server_message_id: Option<u64>,
    pub kind: MessageKind,
}

/// Closed set of message variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    ReadReceipt { timestamps: Vec<u64> },
    TypingIndicator { action: TypingAction },
    ClosedGroupControl(ClosedGroupControlMessage),
    DataExtractionNotification { kind: DataExtractionType },
    ExpirationTimerUpdate {
        duration_seconds: u32,
        sync_target: Option<String>,
    },
    Configuration(ConfigurationMessage),
    UnsendRequest { timestamp: u64, author: String },
    MessageRequestResponse { is_approved: bool },
    Visible(VisibleMessage),
}

/// Group lifecycle control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosedGroupControlMessage {
    New {
        public_key: String,
        name: String,
        key_pair: GroupKeyPair,
        members: Vec<String>,
        admins: Vec<String>,
        expiration_timer: u32,
    },
    /// `public_key` is set when the message is sent 1:1 rather than to the group.
    EncryptionKeyPair {
        public_key: Option<String>,
        wrappers: Vec<KeyPairWrapper>,
    },
    NameChange { name: String },
    MembersAdded { members: Vec<String> },
    MembersRemoved { members: Vec<String> },
    MemberLeft,
    EncryptionKeyPairRequest,
}

/// A group key pair sealed to one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairWrapper {
    pub public_key: String,
    pub encrypted_key_pair: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationMessage {
    pub closed_groups: Vec<ConfigClosedGroup>,
    pub display_name: Option<String>,
    pub contacts: Vec<ConfigContact>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibleMessage {
    pub text: Option<String>,
    pub attachments: Vec<AttachmentPointer>,
    pub sync_target: Option<String>,
}

impl Message {
    /// A message with no routing fields filled in yet.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            sender: None,
            recipient: None,
            sent_timestamp: None,
            received_timestamp: None,
            group_public_key: None,
            thread_id: None,
            open_group_server_message_id: None,
            kind,
        }
    }

    /// Decode content into the first matching variant.
    pub fn from_content(content: &Content) -> Option<Self> {
        MessageKind::from_content(content).map(Self::new)
    }

    pub fn to_content(&self) -> Content {
        self.kind.to_content()
    }

    /// Whether the routing fields and variant payload are well formed.
    pub fn is_valid(&self) -> bool {
        self.has_valid_routing() && self.kind.is_valid()
    }

    /// Sender and recipient are set and no timestamp is zero.
    pub fn has_valid_routing(&self) -> bool {
        self.sent_timestamp != Some(0)
            && self.received_timestamp != Some(0)
            && self.sender.is_some()
            && self.recipient.is_some()
    }

    /// Whether this message may arrive from our own identity.
    pub fn is_self_send_valid(&self) -> bool {
        self.kind.is_self_send_valid()
    }

    /// Time-to-live on the storage nodes, in milliseconds.
    pub fn ttl(&self, default_ttl_ms: u64) -> u64 {
        self.kind.ttl(default_ttl_ms)
    }

    /// Whether this is the `new` group control message.
    pub fn is_new_closed_group(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::ClosedGroupControl(ClosedGroupControlMessage::New { .. })
        )
    }

    /// The sync target, for message kinds that carry one.
    pub fn sync_target(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Visible(visible) => visible.sync_target.as_deref(),
            MessageKind::ExpirationTimerUpdate { sync_target, .. } => sync_target.as_deref(),
            _ => None,
        }
    }

    /// Mark this as a copy for our other devices of a message sent to `target`.
    pub fn set_sync_target(&mut self, target: String) {
        match &mut self.kind {
            MessageKind::Visible(visible) => visible.sync_target = Some(target),
            MessageKind::ExpirationTimerUpdate { sync_target, .. } => *sync_target = Some(target),
            _ => {}
        }
    }
}

impl MessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::ReadReceipt { .. } => "ReadReceipt",
            MessageKind::TypingIndicator { .. } => "TypingIndicator",
            MessageKind::ClosedGroupControl(_) => "ClosedGroupControlMessage",
            MessageKind::DataExtractionNotification { .. } => "DataExtractionNotification",
            MessageKind::ExpirationTimerUpdate { .. } => "ExpirationTimerUpdate",
            MessageKind::Configuration(_) => "ConfigurationMessage",
            MessageKind::UnsendRequest { .. } => "UnsendRequest",
            MessageKind::MessageRequestResponse { .. } => "MessageRequestResponse",
            MessageKind::Visible(_) => "VisibleMessage",
        }
    }

    /// Decode the first variant that matches, in priority order.
    pub fn from_content(content: &Content) -> Option<Self> {
        read_receipt(content)
            .or_else(|| typing_indicator(content))
            .or_else(|| closed_group_control(content))
            .or_else(|| data_extraction_notification(content))
            .or_else(|| expiration_timer_update(content))
            .or_else(|| configuration(content))
            .or_else(|| unsend_request(content))
            .or_else(|| message_request_response(content))
            .or_else(|| visible(content))
    }

    pub fn is_valid(&self) -> bool {
        match self {
            MessageKind::ReadReceipt { timestamps } => !timestamps.is_empty(),
            MessageKind::ClosedGroupControl(control) => control.is_valid(),
            MessageKind::UnsendRequest { timestamp, author } => {
                *timestamp > 0 && !author.is_empty()
            }
            MessageKind::Visible(visible) => visible.is_valid(),
            _ => true,
        }
    }

    pub fn is_self_send_valid(&self) -> bool {
        matches!(
            self,
            MessageKind::ClosedGroupControl(_)
                | MessageKind::ExpirationTimerUpdate { .. }
                | MessageKind::Configuration(_)
                | MessageKind::UnsendRequest { .. }
                | MessageKind::Visible(_)
        )
    }

    /// Storage lifetime on the nodes, in milliseconds.
    pub fn ttl(&self, default_ttl_ms: u64) -> u64 {
        match self {
            MessageKind::TypingIndicator { .. } => TYPING_INDICATOR_TTL_MS,
            MessageKind::Configuration(_) => CONFIGURATION_TTL_MS,
            MessageKind::ClosedGroupControl(
                ClosedGroupControlMessage::New { .. }
                | ClosedGroupControlMessage::EncryptionKeyPair { .. },
            ) => crate::types::DEFAULT_TTL_MS,
            _ => default_ttl_ms,
        }
    }

    pub fn to_content(&self) -> Content {
        let mut content = Content::default();
        match self {
            MessageKind::ReadReceipt { timestamps } => {
                content.receipt_message = Some(ReceiptMessage {
                    receipt_type: ReceiptType::Read,
                    timestamps: timestamps.clone(),
                });
            }
            MessageKind::TypingIndicator { action } => {
                content.typing_message = Some(TypingMessage {
                    timestamp: 0,
                    action: *action,
                });
            }
            MessageKind::ClosedGroupControl(control) => {
                content.data_message = Some(DataMessage {
                    closed_group_control_message: Some(control.to_proto()),
                    ..Default::default()
                });
            }
            MessageKind::DataExtractionNotification { kind } => {
                content.data_extraction_notification = Some(DataExtractionProto {
                    extraction_type: *kind,
                    timestamp: None,
                });
            }
            MessageKind::ExpirationTimerUpdate {
                duration_seconds,
                sync_target,
            } => {
                content.data_message = Some(DataMessage {
                    flags: EXPIRATION_TIMER_UPDATE_FLAG,
                    expire_timer: Some(*duration_seconds),
                    sync_target: sync_target.clone(),
                    ..Default::default()
                });
            }
            MessageKind::Configuration(configuration) => {
                content.configuration_message = Some(ConfigurationProto {
                    closed_groups: configuration.closed_groups.clone(),
                    display_name: configuration.display_name.clone(),
                    contacts: configuration.contacts.clone(),
                });
            }
            MessageKind::UnsendRequest { timestamp, author } => {
                content.unsend_request = Some(UnsendProto {
                    timestamp: *timestamp,
                    author: author.clone(),
                });
            }
            MessageKind::MessageRequestResponse { is_approved } => {
                content.message_request_response = Some(MessageRequestResponseProto {
                    is_approved: *is_approved,
                });
            }
            MessageKind::Visible(visible) => {
                content.data_message = Some(DataMessage {
                    body: visible.text.clone(),
                    attachments: visible.attachments.clone(),
                    sync_target: visible.sync_target.clone(),
                    ..Default::default()
                });
            }
        }
        content
    }
}

fn read_receipt(content: &Content) -> Option<MessageKind> {
    let receipt = content.receipt_message.as_ref()?;
    if receipt.receipt_type != ReceiptType::Read {
        return None;
    }
    Some(MessageKind::ReadReceipt {
        timestamps: receipt.timestamps.clone(),
    })
}

fn typing_indicator(content: &Content) -> Option<MessageKind> {
    let typing = content.typing_message.as_ref()?;
    Some(MessageKind::TypingIndicator {
        action: typing.action,
    })
}

fn closed_group_control(content: &Content) -> Option<MessageKind> {
    let proto = content
        .data_message
        .as_ref()?
        .closed_group_control_message
        .as_ref()?;
    ClosedGroupControlMessage::from_proto(proto).map(MessageKind::ClosedGroupControl)
}

fn data_extraction_notification(content: &Content) -> Option<MessageKind> {
    let notification = content.data_extraction_notification.as_ref()?;
    Some(MessageKind::DataExtractionNotification {
        kind: notification.extraction_type,
    })
}

fn expiration_timer_update(content: &Content) -> Option<MessageKind> {
    let data_message = content.data_message.as_ref()?;
    if data_message.flags & EXPIRATION_TIMER_UPDATE_FLAG == 0 {
        return None;
    }
    Some(MessageKind::ExpirationTimerUpdate {
        duration_seconds: data_message.expire_timer.unwrap_or(0),
        sync_target: data_message.sync_target.clone(),
    })
}

fn configuration(content: &Content) -> Option<MessageKind> {
    let proto = content.configuration_message.as_ref()?;
    Some(MessageKind::Configuration(ConfigurationMessage {
        closed_groups: proto.closed_groups.clone(),
        display_name: proto.display_name.clone(),
        contacts: proto.contacts.clone(),
    }))
}

fn unsend_request(content: &Content) -> Option<MessageKind> {
    let proto = content.unsend_request.as_ref()?;
    Some(MessageKind::UnsendRequest {
        timestamp: proto.timestamp,
        author: proto.author.clone(),
    })
}

fn message_request_response(content: &Content) -> Option<MessageKind> {
    let proto = content.message_request_response.as_ref()?;
    Some(MessageKind::MessageRequestResponse {
        is_approved: proto.is_approved,
    })
}

fn visible(content: &Content) -> Option<MessageKind> {
    let data_message = content.data_message.as_ref()?;
    Some(MessageKind::Visible(VisibleMessage {
        text: data_message.body.clone(),
        attachments: data_message.attachments.clone(),
        sync_target: data_message.sync_target.clone(),
    }))
}

impl ClosedGroupControlMessage {
    pub fn from_proto(proto: &ClosedGroupControlProto) -> Option<Self> {
        let message = match proto.control_type {
            ClosedGroupControlType::New => ClosedGroupControlMessage::New {
                public_key: proto.public_key.clone()?,
                name: proto.name.clone()?,
                key_pair: GroupKeyPair::from_proto(proto.encryption_key_pair.as_ref()?).ok()?,
                members: proto.members.clone(),
                admins: proto.admins.clone(),
                expiration_timer: proto.expiration_timer.unwrap_or(0),
            },
            ClosedGroupControlType::EncryptionKeyPair => {
                ClosedGroupControlMessage::EncryptionKeyPair {
                    public_key: proto.public_key.clone(),
                    wrappers: proto
                        .wrappers
                        .iter()
                        .map(|w| KeyPairWrapper {
                            public_key: w.public_key.clone(),
                            encrypted_key_pair: w.encrypted_key_pair.clone(),
                        })
                        .collect(),
                }
            }
            ClosedGroupControlType::NameChange => ClosedGroupControlMessage::NameChange {
                name: proto.name.clone()?,
            },
            ClosedGroupControlType::MembersAdded => ClosedGroupControlMessage::MembersAdded {
                members: proto.members.clone(),
            },
            ClosedGroupControlType::MembersRemoved => ClosedGroupControlMessage::MembersRemoved {
                members: proto.members.clone(),
            },
            ClosedGroupControlType::MemberLeft => ClosedGroupControlMessage::MemberLeft,
            ClosedGroupControlType::EncryptionKeyPairRequest => {
                ClosedGroupControlMessage::EncryptionKeyPairRequest
            }
        };
        Some(message)
    }

    pub fn to_proto(&self) -> ClosedGroupControlProto {
        match self {
            ClosedGroupControlMessage::New {
                public_key,
                name,
                key_pair,
                members,
                admins,
                expiration_timer,
            } => ClosedGroupControlProto {
                public_key: Some(public_key.clone()),
                name: Some(name.clone()),
                encryption_key_pair: Some(key_pair.to_proto()),
                members: members.clone(),
                admins: admins.clone(),
                expiration_timer: Some(*expiration_timer),
                ..ClosedGroupControlProto::new(ClosedGroupControlType::New)
            },
            ClosedGroupControlMessage::EncryptionKeyPair {
                public_key,
                wrappers,
            } => ClosedGroupControlProto {
                public_key: public_key.clone(),
                wrappers: wrappers
                    .iter()
                    .map(|w| KeyPairWrapperProto {
                        public_key: w.public_key.clone(),
                        encrypted_key_pair: w.encrypted_key_pair.clone(),
                    })
                    .collect(),
                ..ClosedGroupControlProto::new(ClosedGroupControlType::EncryptionKeyPair)
            },
            ClosedGroupControlMessage::NameChange { name } => ClosedGroupControlProto {
                name: Some(name.clone()),
                ..ClosedGroupControlProto::new(ClosedGroupControlType::NameChange)
            },
            ClosedGroupControlMessage::MembersAdded { members } => ClosedGroupControlProto {
                members: members.clone(),
                ..ClosedGroupControlProto::new(ClosedGroupControlType::MembersAdded)
            },
            ClosedGroupControlMessage::MembersRemoved { members } => ClosedGroupControlProto {
                members: members.clone(),
                ..ClosedGroupControlProto::new(ClosedGroupControlType::MembersRemoved)
            },
            ClosedGroupControlMessage::MemberLeft => {
                ClosedGroupControlProto::new(ClosedGroupControlType::MemberLeft)
            }
            ClosedGroupControlMessage::EncryptionKeyPairRequest => {
                ClosedGroupControlProto::new(ClosedGroupControlType::EncryptionKeyPairRequest)
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            ClosedGroupControlMessage::New {
                public_key,
                name,
                members,
                admins,
                ..
            } => !public_key.is_empty() && !name.is_empty() && !members.is_empty() && !admins.is_empty(),
            ClosedGroupControlMessage::EncryptionKeyPair { .. } => true,
            ClosedGroupControlMessage::NameChange { name } => !name.is_empty(),
            ClosedGroupControlMessage::MembersAdded { members }
            | ClosedGroupControlMessage::MembersRemoved { members } => !members.is_empty(),
            ClosedGroupControlMessage::MemberLeft
            | ClosedGroupControlMessage::EncryptionKeyPairRequest => true,
        }
    }
}

impl VisibleMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// A visible message needs a non-empty body; attachments are resolved
    /// later and do not count here.
    pub fn is_valid(&self) -> bool {
        self.text.as_deref().map_or(false, |t| !t.is_empty())
    }
}
