//! Type definitions and protocol constants for the message pipeline.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of an Ed25519 public key in bytes.
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Size of an X25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of the authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Size of the ChaCha20-Poly1305 nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the XChaCha20-Poly1305 nonce used by blinded messages.
pub const BLINDED_NONCE_SIZE: usize = 24;

/// Overhead added by the anonymous box (ephemeral key + tag).
pub const SEALED_BOX_OVERHEAD: usize = PUBLIC_KEY_SIZE + TAG_SIZE;

/// Only accepted version byte of a blinded message.
pub const BLINDED_MESSAGE_VERSION: u8 = 0x00;

/// Identity prefix for standard (unblinded) session identities.
pub const STANDARD_ID_PREFIX: &str = "05";

/// Identity prefix for blinded identities.
pub const BLINDED_ID_PREFIX: &str = "15";

/// Key derivation info for the anonymous box.
pub const SEALED_BOX_INFO: &[u8] = b"SessionPipeline-v1-seal";

/// Key derivation info prefix for blinded shared keys.
pub const BLINDED_KEY_INFO_PREFIX: &[u8] = b"SessionPipeline-v1-blinded";

/// Current envelope encoding version.
pub const ENVELOPE_VERSION: u8 = 0x01;

/// Fixed envelope header: version, type, timestamp, flags.
pub const ENVELOPE_HEADER_SIZE: usize = 11;

/// Block size message bodies are padded to before encryption.
pub const PADDING_BLOCK_SIZE: usize = 160;

/// Default message time-to-live (14 days) in milliseconds.
pub const DEFAULT_TTL_MS: u64 = 14 * 24 * 60 * 60 * 1000;

/// Time-to-live for typing indicators in milliseconds.
pub const TYPING_INDICATOR_TTL_MS: u64 = 20 * 1000;

/// Time-to-live for configuration messages (4 days) in milliseconds.
pub const CONFIGURATION_TTL_MS: u64 = 4 * 24 * 60 * 60 * 1000;

/// Errors raised while receiving an envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("Duplicate message")]
    DuplicateMessage,

    #[error("Invalid message")]
    InvalidMessage,

    #[error("Unknown message type")]
    UnknownMessage,

    #[error("Unknown envelope type")]
    UnknownEnvelopeType,

    #[error("Couldn't find user X25519 key pair")]
    NoUserX25519KeyPair,

    #[error("Couldn't find user ED25519 key pair")]
    NoUserEd25519KeyPair,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Received an empty envelope")]
    NoData,

    #[error("Received a message from a blocked user")]
    SenderBlocked,

    #[error("Couldn't find thread for message")]
    NoThread,

    #[error("Message addressed at self")]
    SelfSend,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Invalid group public key")]
    InvalidGroupPublicKey,

    #[error("No closed group key pair")]
    NoGroupKeyPair,

    /// A collaborator (ledger, store) failed.
    #[error("Storage failed: {0}")]
    Storage(String),
}

impl ReceiveError {
    /// Whether reprocessing the same envelope later could succeed.
    ///
    /// Missing key material may still arrive; malformed, forged or replayed
    /// envelopes never become valid.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReceiveError::NoUserX25519KeyPair
                | ReceiveError::NoUserEd25519KeyPair
                | ReceiveError::NoThread
                | ReceiveError::InvalidGroupPublicKey
                | ReceiveError::NoGroupKeyPair
                | ReceiveError::Storage(_)
        )
    }
}

/// Errors raised while sending a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Invalid message")]
    InvalidMessage,

    #[error("Couldn't convert message to proto")]
    ProtoConversionFailed,

    #[error("Couldn't calculate proof of work")]
    ProofOfWorkCalculationFailed,

    #[error("Couldn't find user public key")]
    NoUserPublicKey,

    #[error("Couldn't sign message")]
    SigningFailed,

    #[error("Couldn't encrypt message")]
    EncryptionFailed,

    #[error("Couldn't find a key pair for the group")]
    NoKeyPair,

    #[error("Invalid closed group update")]
    InvalidClosedGroupUpdate,

    #[error("Couldn't find thread")]
    NoThread,

    /// Every target node rejected the message.
    #[error("Transport failed: {0}")]
    Transport(String),

    /// A collaborator (ledger, store) failed.
    #[error("Storage failed: {0}")]
    Storage(String),
}

/// Errors raised while deriving or parsing key material.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid seed length: expected 32 bytes, got {0}")]
    InvalidSeedLength(usize),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// Errors surfaced by storage collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage failed: {0}")]
    Failed(String),
}

impl From<StorageError> for ReceiveError {
    fn from(e: StorageError) -> Self {
        ReceiveError::Storage(e.to_string())
    }
}

impl From<StorageError> for SendError {
    fn from(e: StorageError) -> Self {
        SendError::Storage(e.to_string())
    }
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

pub type Result<T, E = ReceiveError> = std::result::Result<T, E>;

pub type SendResult<T> = std::result::Result<T, SendError>;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ReceiveError::NoGroupKeyPair.is_retryable());
        assert!(ReceiveError::NoUserX25519KeyPair.is_retryable());
        assert!(!ReceiveError::InvalidSignature.is_retryable());
        assert!(!ReceiveError::DuplicateMessage.is_retryable());
        assert!(!ReceiveError::SelfSend.is_retryable());
        assert!(!ReceiveError::SenderBlocked.is_retryable());
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: SendError = StorageError::Failed("disk".into()).into();
        assert!(matches!(err, SendError::Storage(_)));
    }
}
