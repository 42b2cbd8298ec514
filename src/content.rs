//! Logical content schema carried inside encrypted envelopes.
//!
//! The structures mirror the protobuf `Content` message field for field and
//! are serialized as JSON. Bodies are padded before encryption so that
//! ciphertext length only reveals a coarse size class.

use serde::{Deserialize, Serialize};

use crate::types::{ReceiveError, Result, PADDING_BLOCK_SIZE};

/// `DataMessage.flags` bit marking an expiration timer update.
pub const EXPIRATION_TIMER_UPDATE_FLAG: u32 = 2;

const PADDING_TERMINATOR: u8 = 0x80;

/// Top-level content; exactly one sub-message is normally present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_message: Option<DataMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_message: Option<ReceiptMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typing_message: Option<TypingMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_message: Option<ConfigurationProto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_extraction_notification: Option<DataExtractionProto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsend_request: Option<UnsendProto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_request_response: Option<MessageRequestResponseProto>,
}

impl Content {
    /// Serialize and pad for encryption.
    pub fn to_padded_bytes(&self) -> serde_json::Result<Vec<u8>> {
        Ok(pad(&serde_json::to_vec(self)?))
    }

    /// Strip padding and parse decrypted bytes.
    pub fn from_padded_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(unpad(data)).map_err(|_| ReceiveError::InvalidMessage)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPointer>,
    pub flags: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_timer: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_group_control_message: Option<ClosedGroupControlProto>,
    /// Set on copies a user sends to their own other devices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_target: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachmentPointer {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptType {
    Delivery,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptMessage {
    #[serde(rename = "type")]
    pub receipt_type: ReceiptType,
    #[serde(default)]
    pub timestamps: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TypingAction {
    Started,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingMessage {
    pub timestamp: u64,
    pub action: TypingAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClosedGroupControlType {
    New,
    EncryptionKeyPair,
    NameChange,
    MembersAdded,
    MembersRemoved,
    MemberLeft,
    EncryptionKeyPairRequest,
}

/// Raw key pair as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairProto {
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub private_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairWrapperProto {
    /// Identity of the member this copy is sealed to.
    pub public_key: String,
    #[serde(with = "base64_bytes")]
    pub encrypted_key_pair: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedGroupControlProto {
    #[serde(rename = "type")]
    pub control_type: ClosedGroupControlType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_pair: Option<KeyPairProto>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admins: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wrappers: Vec<KeyPairWrapperProto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_timer: Option<u32>,
}

impl ClosedGroupControlProto {
    pub fn new(control_type: ClosedGroupControlType) -> Self {
        Self {
            control_type,
            public_key: None,
            name: None,
            encryption_key_pair: None,
            members: Vec::new(),
            admins: Vec::new(),
            wrappers: Vec::new(),
            expiration_timer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigClosedGroup {
    pub public_key: String,
    pub name: String,
    pub encryption_key_pair: KeyPairProto,
    pub members: Vec<String>,
    pub admins: Vec<String>,
    #[serde(default)]
    pub expiration_timer: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigContact {
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub is_approved: bool,
    #[serde(default)]
    pub is_blocked: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigurationProto {
    pub closed_groups: Vec<ConfigClosedGroup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub contacts: Vec<ConfigContact>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataExtractionType {
    Screenshot,
    MediaSaved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataExtractionProto {
    #[serde(rename = "type")]
    pub extraction_type: DataExtractionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsendProto {
    pub timestamp: u64,
    pub author: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequestResponseProto {
    pub is_approved: bool,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Append a `0x80` terminator and zero-fill to the next block boundary.
pub fn pad(data: &[u8]) -> Vec<u8> {
    let padded_len = (data.len() / PADDING_BLOCK_SIZE + 1) * PADDING_BLOCK_SIZE;
    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(data);
    padded.push(PADDING_TERMINATOR);
    padded.resize(padded_len, 0);
    padded
}

/// Strip trailing zeros and the terminator; unpadded input is returned as is.
pub fn unpad(data: &[u8]) -> &[u8] {
    match data.iter().rposition(|&b| b != 0) {
        Some(index) if data[index] == PADDING_TERMINATOR => &data[..index],
        _ => data,
    }
}
