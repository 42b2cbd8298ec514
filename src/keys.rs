//! Key derivation and management for user identities, groups and blinding.

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::types::{
    KeyError, BLINDED_ID_PREFIX, BLINDED_KEY_INFO_PREFIX, PUBLIC_KEY_SIZE, STANDARD_ID_PREFIX,
};

/// The local user's long-term key material.
///
/// The X25519 pair is derived from the Ed25519 seed so a single 32-byte
/// seed is enough to restore an account.
#[derive(Clone)]
pub struct UserKeys {
    ed25519: SigningKey,
    x25519_private: StaticSecret,
    x25519_public: PublicKey,
}

impl UserKeys {
    /// Derive the full identity from a 32-byte Ed25519 seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self, KeyError> {
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| KeyError::InvalidSeedLength(seed.len()))?;

        Ok(Self::from_seed_bytes(&seed))
    }

    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut seed);
        Self::from_seed_bytes(&seed)
    }

    fn from_seed_bytes(seed: &[u8; 32]) -> Self {
        let ed25519 = SigningKey::from_bytes(seed);
        let x25519_private = x25519_secret_from_seed(seed);
        let x25519_public = PublicKey::from(&x25519_private);

        Self {
            ed25519,
            x25519_private,
            x25519_public,
        }
    }

    /// The long-term Ed25519 key; signs every outgoing Session message.
    pub fn signing_key(&self) -> &SigningKey {
        &self.ed25519
    }

    /// Public half of [`UserKeys::signing_key`], embedded in sealed payloads.
    pub fn ed25519_public_key(&self) -> [u8; 32] {
        self.ed25519.verifying_key().to_bytes()
    }

    /// X25519 secret derived from the seed; opens boxes sealed to us.
    pub fn x25519_private_key(&self) -> &StaticSecret {
        &self.x25519_private
    }

    /// Encryption public key. Its hex form is the session identity.
    pub fn x25519_public_key(&self) -> &PublicKey {
        &self.x25519_public
    }

    /// The hex session identity (`05` prefix) of this user.
    pub fn session_id(&self) -> String {
        session_id_from_x25519(self.x25519_public.as_bytes())
    }
}

impl std::fmt::Debug for UserKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserKeys")
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

/// X25519 secret matching an Ed25519 seed (clamped first half of SHA-512).
fn x25519_secret_from_seed(seed: &[u8; 32]) -> StaticSecret {
    let hash = Sha512::digest(seed);
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&hash[..32]);
    clamp(&mut scalar);
    StaticSecret::from(scalar)
}

/// Ed25519 secret scalar (clamped, reduced) for a signing key.
fn ed25519_secret_scalar(signing_key: &SigningKey) -> Scalar {
    let hash = Sha512::digest(signing_key.to_bytes());
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&hash[..32]);
    clamp(&mut scalar);
    Scalar::from_bytes_mod_order(scalar)
}

fn clamp(bytes: &mut [u8; 32]) {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
}

/// Generate a random X25519 key pair.
///
/// # Returns
/// Tuple of (private_key, public_key)
pub fn generate_x25519_keypair() -> (StaticSecret, PublicKey) {
    let private_key = StaticSecret::random_from_rng(rand::thread_rng());
    let public_key = PublicKey::from(&private_key);
    (private_key, public_key)
}

/// Perform X25519 ECDH key exchange.
pub fn x25519_ecdh(private_key: &StaticSecret, public_key: &PublicKey) -> [u8; 32] {
    private_key.diffie_hellman(public_key).to_bytes()
}

/// Convert an Ed25519 public key to its X25519 (Montgomery) equivalent.
///
/// Returns `None` if the bytes are not a valid Edwards point.
pub fn ed25519_to_x25519(ed25519_public_key: &[u8; 32]) -> Option<[u8; 32]> {
    let point = CompressedEdwardsY(*ed25519_public_key).decompress()?;
    Some(point.to_montgomery().to_bytes())
}

/// Format an X25519 public key as a standard session identity.
pub fn session_id_from_x25519(public_key: &[u8; 32]) -> String {
    format!("{}{}", STANDARD_ID_PREFIX, hex::encode(public_key))
}

/// Parse a standard session identity (or bare hex key) into key bytes.
pub fn parse_session_id(id: &str) -> Result<[u8; 32], KeyError> {
    parse_prefixed_key(id, STANDARD_ID_PREFIX)
}

/// Parse a blinded identity (`15` prefix) into key bytes.
pub fn parse_blinded_id(id: &str) -> Result<[u8; 32], KeyError> {
    parse_prefixed_key(id, BLINDED_ID_PREFIX)
}

fn parse_prefixed_key(id: &str, prefix: &str) -> Result<[u8; 32], KeyError> {
    let hex_key = match id.len() {
        66 if id.starts_with(prefix) => &id[prefix.len()..],
        64 => id,
        _ => {
            return Err(KeyError::InvalidPublicKey(format!(
                "Unexpected identity length {}",
                id.len()
            )))
        }
    };

    let bytes = hex::decode(hex_key)
        .map_err(|e| KeyError::InvalidPublicKey(format!("Invalid hex: {}", e)))?;

    bytes
        .try_into()
        .map_err(|_| KeyError::InvalidPublicKey("Key must be 32 bytes".into()))
}

// ============================================================================
// Blinding
// ============================================================================

/// A per-room blinded key pair.
#[derive(Clone)]
pub struct BlindedKeyPair {
    /// Blinded secret scalar `k·a`.
    pub secret: Scalar,
    /// Blinded public key `k·A`.
    pub public_key: [u8; 32],
}

impl BlindedKeyPair {
    /// The blinded identity (`15` prefix) for this pair.
    pub fn blinded_id(&self) -> String {
        format!("{}{}", BLINDED_ID_PREFIX, hex::encode(self.public_key))
    }
}

/// Compute the blinding factor `k` for a room's server public key.
pub fn blinding_factor(server_public_key: &[u8]) -> Scalar {
    let hash = Sha512::digest(server_public_key);
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hash);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Derive the local blinded key pair for a room.
pub fn blinded_key_pair(server_public_key: &[u8], signing_key: &SigningKey) -> BlindedKeyPair {
    let k = blinding_factor(server_public_key);
    let secret = k * ed25519_secret_scalar(signing_key);
    let public_key = EdwardsPoint::mul_base(&secret).compress().to_bytes();
    BlindedKeyPair { secret, public_key }
}

/// Combine a blinding factor with an Ed25519 public key, yielding `k·A`.
pub fn combine_keys(blinding_factor: &Scalar, ed25519_public_key: &[u8; 32]) -> Option<[u8; 32]> {
    let point = CompressedEdwardsY(*ed25519_public_key).decompress()?;
    Some((blinding_factor * point).compress().to_bytes())
}

/// Derive the symmetric key shared between two blinded identities.
///
/// `from` is always the sender's blinded key and `to` the recipient's, so
/// both ends derive the same key regardless of who computes it.
pub fn shared_blinded_key(
    local_secret: &Scalar,
    other_blinded_public_key: &[u8; 32],
    from_blinded_public_key: &[u8; 32],
    to_blinded_public_key: &[u8; 32],
) -> Option<[u8; 32]> {
    let other = CompressedEdwardsY(*other_blinded_public_key).decompress()?;
    let shared_point = (local_secret * other).compress();

    let mut info = Vec::with_capacity(BLINDED_KEY_INFO_PREFIX.len() + 2 * PUBLIC_KEY_SIZE);
    info.extend_from_slice(BLINDED_KEY_INFO_PREFIX);
    info.extend_from_slice(from_blinded_public_key);
    info.extend_from_slice(to_blinded_public_key);

    let hkdf = Hkdf::<Sha256>::new(None, shared_point.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(&info, &mut key).ok()?;
    Some(key)
}
