//! Closed-group key pairs and membership state.

use std::collections::BTreeSet;

use x25519_dalek::{PublicKey, StaticSecret};

use crate::content::KeyPairProto;
use crate::keys::{generate_x25519_keypair, session_id_from_x25519};
use crate::types::{ReceiveError, Result};

/// One generation of a closed group's encryption key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct GroupKeyPair {
    pub public_key: [u8; 32],
    pub private_key: [u8; 32],
}

impl GroupKeyPair {
    /// Generate a fresh key pair for a rotation.
    pub fn generate() -> Self {
        let (private_key, public_key) = generate_x25519_keypair();
        Self {
            public_key: *public_key.as_bytes(),
            private_key: private_key.to_bytes(),
        }
    }

    /// X25519 secret used to open group messages.
    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.private_key)
    }

    pub fn public(&self) -> PublicKey {
        PublicKey::from(self.public_key)
    }

    /// Identity string derived from the public key (`05` prefix).
    pub fn identity(&self) -> String {
        session_id_from_x25519(&self.public_key)
    }

    /// Wire form carried inside `new` control messages.
    pub fn to_proto(&self) -> KeyPairProto {
        KeyPairProto {
            public_key: self.public_key.to_vec(),
            private_key: self.private_key.to_vec(),
        }
    }

    pub fn from_proto(proto: &KeyPairProto) -> Result<Self> {
        let public_key: [u8; 32] = proto
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| ReceiveError::InvalidMessage)?;
        let private_key: [u8; 32] = proto
            .private_key
            .as_slice()
            .try_into()
            .map_err(|_| ReceiveError::InvalidMessage)?;
        Ok(Self {
            public_key,
            private_key,
        })
    }

    /// Serialized form sealed inside an `encryptionKeyPair` wrapper.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.to_proto())
    }

    /// Parse a key pair decrypted from an `encryptionKeyPair` wrapper.
    pub fn from_payload(data: &[u8]) -> Result<Self> {
        let proto: KeyPairProto =
            serde_json::from_slice(data).map_err(|_| ReceiveError::InvalidMessage)?;
        Self::from_proto(&proto)
    }
}

impl std::fmt::Debug for GroupKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// Membership state of a closed group.
///
/// `admins` keeps insertion order; the first entry is the primary admin.
/// `zombies` are members who announced they left but have not yet been
/// removed by an admin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    pub group_public_key: String,
    pub name: String,
    pub members: BTreeSet<String>,
    pub admins: Vec<String>,
    pub zombies: BTreeSet<String>,
    /// Milliseconds; control messages older than this are ignored.
    pub formation_timestamp: u64,
    pub expiration_timer: u32,
}

impl GroupMembership {
    /// A freshly formed group with no zombies.
    pub fn new(
        group_public_key: impl Into<String>,
        name: impl Into<String>,
        members: impl IntoIterator<Item = String>,
        admins: Vec<String>,
        formation_timestamp: u64,
    ) -> Self {
        Self {
            group_public_key: group_public_key.into(),
            name: name.into(),
            members: members.into_iter().collect(),
            admins,
            zombies: BTreeSet::new(),
            formation_timestamp,
            expiration_timer: 0,
        }
    }

    pub fn is_admin(&self, identity: &str) -> bool {
        self.admins.iter().any(|a| a == identity)
    }

    pub fn is_member(&self, identity: &str) -> bool {
        self.members.contains(identity)
    }

    /// The first admin, who can never be removed by others.
    pub fn primary_admin(&self) -> Option<&str> {
        self.admins.first().map(String::as_str)
    }

    /// A disbanded group keeps its record but has no members left.
    pub fn is_active(&self) -> bool {
        !self.members.is_empty()
    }
}

/// Info events surfaced to the application when group state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    Created { group: String, name: String },
    NameChanged { group: String, name: String },
    MembersAdded { group: String, members: Vec<String> },
    MembersRemoved { group: String, members: Vec<String> },
    MemberLeft { group: String, member: String },
    /// The local user was removed from the group.
    Removed { group: String },
    /// An admin left and the group no longer exists.
    Disbanded { group: String },
    KeyPairReceived { group: String },
}
