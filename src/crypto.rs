//! Session protocol encryption and the blinded open-group inbox protocol.
//!
//! Direct and closed-group messages are signed with the sender's Ed25519 key
//! and then sealed in an anonymous box addressed to an X25519 public key.
//! The box itself carries no sender information; the sender is recovered from
//! the verified signature.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce, XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::keys::{
    blinded_key_pair, blinding_factor, combine_keys, ed25519_to_x25519, generate_x25519_keypair,
    parse_blinded_id, session_id_from_x25519, shared_blinded_key, x25519_ecdh, UserKeys,
};
use crate::types::{
    ReceiveError, Result, SendError, SendResult, BLINDED_MESSAGE_VERSION, BLINDED_NONCE_SIZE,
    ED25519_PUBLIC_KEY_SIZE, NONCE_SIZE, PUBLIC_KEY_SIZE, SEALED_BOX_INFO, SEALED_BOX_OVERHEAD,
    SIGNATURE_SIZE,
};

/// Derive the key and nonce of an anonymous box from the ephemeral exchange.
fn sealed_box_cipher(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Option<(ChaCha20Poly1305, [u8; NONCE_SIZE])> {
    let mut info = Vec::with_capacity(SEALED_BOX_INFO.len() + 2 * PUBLIC_KEY_SIZE);
    info.extend_from_slice(SEALED_BOX_INFO);
    info.extend_from_slice(ephemeral_public);
    info.extend_from_slice(recipient_public);

    let hkdf = Hkdf::<Sha256>::new(Some(ephemeral_public), shared_secret);
    let mut okm = [0u8; 32 + NONCE_SIZE];
    hkdf.expand(&info, &mut okm).ok()?;

    let cipher = ChaCha20Poly1305::new_from_slice(&okm[..32]).ok()?;
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&okm[32..]);
    Some((cipher, nonce))
}

/// Seal `plaintext` so that only the holder of `recipient`'s secret can open it.
///
/// Format: ephemeralPublicKey (32 bytes) ‖ ciphertext ‖ tag (16 bytes)
pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> SendResult<Vec<u8>> {
    let (ephemeral_private, ephemeral_public) = generate_x25519_keypair();
    let shared_secret = x25519_ecdh(&ephemeral_private, recipient);

    let (cipher, nonce) =
        sealed_box_cipher(&shared_secret, ephemeral_public.as_bytes(), recipient.as_bytes())
            .ok_or(SendError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| SendError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(PUBLIC_KEY_SIZE + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open an anonymous box addressed to `my_public_key`.
pub fn open(
    sealed: &[u8],
    my_private_key: &StaticSecret,
    my_public_key: &PublicKey,
) -> Result<Vec<u8>> {
    if sealed.len() < SEALED_BOX_OVERHEAD {
        return Err(ReceiveError::DecryptionFailed);
    }

    let mut ephemeral_bytes = [0u8; PUBLIC_KEY_SIZE];
    ephemeral_bytes.copy_from_slice(&sealed[..PUBLIC_KEY_SIZE]);
    let shared_secret = x25519_ecdh(my_private_key, &PublicKey::from(ephemeral_bytes));

    let (cipher, nonce) =
        sealed_box_cipher(&shared_secret, &ephemeral_bytes, my_public_key.as_bytes())
            .ok_or(ReceiveError::DecryptionFailed)?;

    cipher
        .decrypt(Nonce::from_slice(&nonce), &sealed[PUBLIC_KEY_SIZE..])
        .map_err(|_| ReceiveError::DecryptionFailed)
}

/// Encrypt a message with the Session protocol.
///
/// # Arguments
/// * `plaintext` - Padded content bytes
/// * `recipient_x25519_public_key` - Recipient's (or group's) X25519 public key
/// * `keys` - Local identity used to sign the message
pub fn encrypt_session(
    plaintext: &[u8],
    recipient_x25519_public_key: &[u8; 32],
    keys: &UserKeys,
) -> SendResult<Vec<u8>> {
    let sender_ed_public = keys.ed25519_public_key();

    let mut signed = Vec::with_capacity(plaintext.len() + 2 * PUBLIC_KEY_SIZE);
    signed.extend_from_slice(plaintext);
    signed.extend_from_slice(&sender_ed_public);
    signed.extend_from_slice(recipient_x25519_public_key);

    let signature = keys
        .signing_key()
        .try_sign(&signed)
        .map_err(|_| SendError::SigningFailed)?;

    let mut payload =
        Vec::with_capacity(plaintext.len() + ED25519_PUBLIC_KEY_SIZE + SIGNATURE_SIZE);
    payload.extend_from_slice(plaintext);
    payload.extend_from_slice(&sender_ed_public);
    payload.extend_from_slice(&signature.to_bytes());

    seal(&payload, &PublicKey::from(*recipient_x25519_public_key))
}

/// Decrypt a Session protocol message.
///
/// # Returns
/// The inner plaintext and the sender's session identity.
pub fn decrypt_session(
    ciphertext: &[u8],
    my_private_key: &StaticSecret,
    my_public_key: &PublicKey,
) -> Result<(Vec<u8>, String)> {
    let opened = open(ciphertext, my_private_key, my_public_key)?;

    if opened.len() <= SIGNATURE_SIZE + ED25519_PUBLIC_KEY_SIZE {
        return Err(ReceiveError::DecryptionFailed);
    }

    let signature_start = opened.len() - SIGNATURE_SIZE;
    let key_start = signature_start - ED25519_PUBLIC_KEY_SIZE;

    let plaintext = &opened[..key_start];
    let mut sender_ed_public = [0u8; ED25519_PUBLIC_KEY_SIZE];
    sender_ed_public.copy_from_slice(&opened[key_start..signature_start]);
    let mut signature_bytes = [0u8; SIGNATURE_SIZE];
    signature_bytes.copy_from_slice(&opened[signature_start..]);

    let mut signed = Vec::with_capacity(plaintext.len() + 2 * PUBLIC_KEY_SIZE);
    signed.extend_from_slice(plaintext);
    signed.extend_from_slice(&sender_ed_public);
    signed.extend_from_slice(my_public_key.as_bytes());

    let verifying_key =
        VerifyingKey::from_bytes(&sender_ed_public).map_err(|_| ReceiveError::InvalidSignature)?;
    verifying_key
        .verify(&signed, &Signature::from_bytes(&signature_bytes))
        .map_err(|_| ReceiveError::InvalidSignature)?;

    let sender_x25519 =
        ed25519_to_x25519(&sender_ed_public).ok_or(ReceiveError::DecryptionFailed)?;

    Ok((plaintext.to_vec(), session_id_from_x25519(&sender_x25519)))
}

// ============================================================================
// Blinded messages
// ============================================================================

/// Seal an already assembled blinded payload.
///
/// Format: version (1 byte) ‖ ciphertext ‖ nonce (24 bytes)
fn seal_blinded(inner: &[u8], key: &[u8; 32]) -> SendResult<Vec<u8>> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| SendError::EncryptionFailed)?;

    let mut nonce_bytes = [0u8; BLINDED_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), inner)
        .map_err(|_| SendError::EncryptionFailed)?;

    let mut data = Vec::with_capacity(1 + ciphertext.len() + BLINDED_NONCE_SIZE);
    data.push(BLINDED_MESSAGE_VERSION);
    data.extend_from_slice(&ciphertext);
    data.extend_from_slice(&nonce_bytes);
    Ok(data)
}

/// Encrypt a message to a blinded identity in an open-group room.
pub fn encrypt_blinded(
    plaintext: &[u8],
    recipient_blinded_id: &str,
    server_public_key: &[u8],
    keys: &UserKeys,
) -> SendResult<Vec<u8>> {
    let local = blinded_key_pair(server_public_key, keys.signing_key());
    let recipient =
        parse_blinded_id(recipient_blinded_id).map_err(|_| SendError::EncryptionFailed)?;

    let key = shared_blinded_key(&local.secret, &recipient, &local.public_key, &recipient)
        .ok_or(SendError::EncryptionFailed)?;

    let mut inner = Vec::with_capacity(plaintext.len() + ED25519_PUBLIC_KEY_SIZE);
    inner.extend_from_slice(plaintext);
    inner.extend_from_slice(&keys.ed25519_public_key());

    seal_blinded(&inner, &key)
}

/// Decrypt a blinded open-group inbox message.
///
/// # Arguments
/// * `data` - Raw message bytes
/// * `is_outgoing` - Whether the local user sent this message
/// * `other_blinded_id` - The blinded identity of the other participant
/// * `server_public_key` - The room server's public key
/// * `keys` - Local identity
///
/// # Returns
/// The plaintext and the sender's unblinded session identity.
pub fn decrypt_blinded(
    data: &[u8],
    is_outgoing: bool,
    other_blinded_id: &str,
    server_public_key: &[u8],
    keys: &UserKeys,
) -> Result<(Vec<u8>, String)> {
    if data.len() <= BLINDED_NONCE_SIZE + 2 {
        return Err(ReceiveError::DecryptionFailed);
    }

    let local = blinded_key_pair(server_public_key, keys.signing_key());
    let other = parse_blinded_id(other_blinded_id).map_err(|_| ReceiveError::DecryptionFailed)?;

    let (from, to) = if is_outgoing {
        (local.public_key, other)
    } else {
        (other, local.public_key)
    };
    let key = shared_blinded_key(&local.secret, &other, &from, &to)
        .ok_or(ReceiveError::DecryptionFailed)?;

    if data[0] != BLINDED_MESSAGE_VERSION {
        return Err(ReceiveError::DecryptionFailed);
    }

    let nonce_start = data.len() - BLINDED_NONCE_SIZE;
    let cipher =
        XChaCha20Poly1305::new_from_slice(&key).map_err(|_| ReceiveError::DecryptionFailed)?;
    let inner = cipher
        .decrypt(XNonce::from_slice(&data[nonce_start..]), &data[1..nonce_start])
        .map_err(|_| ReceiveError::DecryptionFailed)?;

    if inner.len() <= ED25519_PUBLIC_KEY_SIZE {
        return Err(ReceiveError::DecryptionFailed);
    }

    let key_start = inner.len() - ED25519_PUBLIC_KEY_SIZE;
    let mut sender_ed_public = [0u8; ED25519_PUBLIC_KEY_SIZE];
    sender_ed_public.copy_from_slice(&inner[key_start..]);

    // The claimed unblinded key must blind to the sender's blinded key.
    let k = blinding_factor(server_public_key);
    let blinded_sender =
        combine_keys(&k, &sender_ed_public).ok_or(ReceiveError::InvalidSignature)?;
    let expected = if is_outgoing { local.public_key } else { other };
    if blinded_sender != expected {
        return Err(ReceiveError::InvalidSignature);
    }

    let sender_x25519 =
        ed25519_to_x25519(&sender_ed_public).ok_or(ReceiveError::DecryptionFailed)?;

    Ok((inner[..key_start].to_vec(), session_id_from_x25519(&sender_x25519)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::parse_session_id;

    const ALICE_SEED_HEX: &str = "0000000000000000000000000000000000000000000000000000000000000001";
    const BOB_SEED_HEX: &str = "0000000000000000000000000000000000000000000000000000000000000002";
    const CAROL_SEED_HEX: &str = "0000000000000000000000000000000000000000000000000000000000000003";
    const SERVER_PUBLIC_KEY: [u8; 32] = [7u8; 32];

    fn keys(seed_hex: &str) -> UserKeys {
        UserKeys::from_seed(&hex::decode(seed_hex).unwrap()).unwrap()
    }

    fn blinded_id(user: &UserKeys) -> String {
        blinded_key_pair(&SERVER_PUBLIC_KEY, user.signing_key()).blinded_id()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let alice = keys(ALICE_SEED_HEX);
        let bob = keys(BOB_SEED_HEX);

        let ciphertext =
            encrypt_session(b"Hello from Rust!", bob.x25519_public_key().as_bytes(), &alice)
                .unwrap();
        let (plaintext, sender) =
            decrypt_session(&ciphertext, bob.x25519_private_key(), bob.x25519_public_key())
                .unwrap();

        assert_eq!(plaintext, b"Hello from Rust!");
        assert_eq!(sender, alice.session_id());
    }

    #[test]
    fn test_wrong_recipient_cannot_decrypt() {
        let alice = keys(ALICE_SEED_HEX);
        let bob = keys(BOB_SEED_HEX);
        let carol = keys(CAROL_SEED_HEX);

        let ciphertext =
            encrypt_session(b"for bob", bob.x25519_public_key().as_bytes(), &alice).unwrap();
        let result =
            decrypt_session(&ciphertext, carol.x25519_private_key(), carol.x25519_public_key());

        assert_eq!(result, Err(ReceiveError::DecryptionFailed));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let alice = keys(ALICE_SEED_HEX);
        let bob = keys(BOB_SEED_HEX);

        let ciphertext =
            encrypt_session(b"payload", bob.x25519_public_key().as_bytes(), &alice).unwrap();

        for index in [0, PUBLIC_KEY_SIZE, ciphertext.len() - 1] {
            let mut tampered = ciphertext.clone();
            tampered[index] ^= 0x01;
            let result =
                decrypt_session(&tampered, bob.x25519_private_key(), bob.x25519_public_key());
            assert!(matches!(
                result,
                Err(ReceiveError::DecryptionFailed) | Err(ReceiveError::InvalidSignature)
            ));
        }
    }

    #[test]
    fn test_tampered_inner_payload_rejected() {
        let alice = keys(ALICE_SEED_HEX);
        let bob = keys(BOB_SEED_HEX);

        let ciphertext =
            encrypt_session(b"payload", bob.x25519_public_key().as_bytes(), &alice).unwrap();
        let opened = open(&ciphertext, bob.x25519_private_key(), bob.x25519_public_key()).unwrap();
        let key_start = opened.len() - SIGNATURE_SIZE - ED25519_PUBLIC_KEY_SIZE;

        // Plaintext, embedded sender key, signature.
        for index in [0, key_start, key_start + 5, opened.len() - 1] {
            let mut tampered = opened.clone();
            tampered[index] ^= 0x01;
            let sealed = seal(&tampered, bob.x25519_public_key()).unwrap();
            let result =
                decrypt_session(&sealed, bob.x25519_private_key(), bob.x25519_public_key());
            assert_eq!(result, Err(ReceiveError::InvalidSignature), "byte {index}");
        }
    }

    #[test]
    fn test_forged_signature_rejected() {
        let alice = keys(ALICE_SEED_HEX);
        let bob = keys(BOB_SEED_HEX);

        let mut payload = b"forged".to_vec();
        payload.extend_from_slice(&alice.ed25519_public_key());
        payload.extend_from_slice(&[0x42u8; SIGNATURE_SIZE]);
        let sealed = seal(&payload, bob.x25519_public_key()).unwrap();

        let result = decrypt_session(&sealed, bob.x25519_private_key(), bob.x25519_public_key());
        assert_eq!(result, Err(ReceiveError::InvalidSignature));
    }

    #[test]
    fn test_signature_bound_to_recipient() {
        let alice = keys(ALICE_SEED_HEX);
        let bob = keys(BOB_SEED_HEX);
        let carol = keys(CAROL_SEED_HEX);

        // Signed for Carol, re-sealed to Bob.
        let mut signed = b"relayed".to_vec();
        signed.extend_from_slice(&alice.ed25519_public_key());
        signed.extend_from_slice(carol.x25519_public_key().as_bytes());
        let signature = alice.signing_key().sign(&signed);

        let mut payload = b"relayed".to_vec();
        payload.extend_from_slice(&alice.ed25519_public_key());
        payload.extend_from_slice(&signature.to_bytes());
        let sealed = seal(&payload, bob.x25519_public_key()).unwrap();

        let result = decrypt_session(&sealed, bob.x25519_private_key(), bob.x25519_public_key());
        assert_eq!(result, Err(ReceiveError::InvalidSignature));
    }

    #[test]
    fn test_opened_payload_too_short() {
        let bob = keys(BOB_SEED_HEX);
        let sealed = seal(&[0u8; SIGNATURE_SIZE + ED25519_PUBLIC_KEY_SIZE], bob.x25519_public_key())
            .unwrap();

        let result = decrypt_session(&sealed, bob.x25519_private_key(), bob.x25519_public_key());
        assert_eq!(result, Err(ReceiveError::DecryptionFailed));

        let result = decrypt_session(&[1, 2, 3], bob.x25519_private_key(), bob.x25519_public_key());
        assert_eq!(result, Err(ReceiveError::DecryptionFailed));
    }

    #[test]
    fn test_sender_identity_is_parseable() {
        let alice = keys(ALICE_SEED_HEX);
        let bob = keys(BOB_SEED_HEX);

        let ciphertext =
            encrypt_session(b"hi", bob.x25519_public_key().as_bytes(), &alice).unwrap();
        let (_, sender) =
            decrypt_session(&ciphertext, bob.x25519_private_key(), bob.x25519_public_key())
                .unwrap();

        assert_eq!(&parse_session_id(&sender).unwrap(), alice.x25519_public_key().as_bytes());
    }

    #[test]
    fn test_blinded_roundtrip_both_directions() {
        let alice = keys(ALICE_SEED_HEX);
        let bob = keys(BOB_SEED_HEX);

        let data =
            encrypt_blinded(b"blinded hello", &blinded_id(&bob), &SERVER_PUBLIC_KEY, &alice)
                .unwrap();

        // Bob receives it.
        let (plaintext, sender) =
            decrypt_blinded(&data, false, &blinded_id(&alice), &SERVER_PUBLIC_KEY, &bob).unwrap();
        assert_eq!(plaintext, b"blinded hello");
        assert_eq!(sender, alice.session_id());

        // Alice reads back her own outgoing copy.
        let (plaintext, sender) =
            decrypt_blinded(&data, true, &blinded_id(&bob), &SERVER_PUBLIC_KEY, &alice).unwrap();
        assert_eq!(plaintext, b"blinded hello");
        assert_eq!(sender, alice.session_id());
    }

    #[test]
    fn test_blinded_spoofed_sender_rejected() {
        let alice = keys(ALICE_SEED_HEX);
        let bob = keys(BOB_SEED_HEX);
        let carol = keys(CAROL_SEED_HEX);

        // Alice encrypts correctly but claims to be Carol.
        let local = blinded_key_pair(&SERVER_PUBLIC_KEY, alice.signing_key());
        let bob_blinded = parse_blinded_id(&blinded_id(&bob)).unwrap();
        let key =
            shared_blinded_key(&local.secret, &bob_blinded, &local.public_key, &bob_blinded)
                .unwrap();
        let mut inner = b"spoof".to_vec();
        inner.extend_from_slice(&carol.ed25519_public_key());
        let data = seal_blinded(&inner, &key).unwrap();

        let result = decrypt_blinded(&data, false, &blinded_id(&alice), &SERVER_PUBLIC_KEY, &bob);
        assert_eq!(result, Err(ReceiveError::InvalidSignature));
    }

    #[test]
    fn test_blinded_rejects_bad_version_and_short_input() {
        let alice = keys(ALICE_SEED_HEX);
        let bob = keys(BOB_SEED_HEX);

        let mut data =
            encrypt_blinded(b"hi", &blinded_id(&bob), &SERVER_PUBLIC_KEY, &alice).unwrap();
        data[0] = 0x01;
        let result = decrypt_blinded(&data, false, &blinded_id(&alice), &SERVER_PUBLIC_KEY, &bob);
        assert_eq!(result, Err(ReceiveError::DecryptionFailed));

        let short = vec![0u8; BLINDED_NONCE_SIZE + 2];
        let result = decrypt_blinded(&short, false, &blinded_id(&alice), &SERVER_PUBLIC_KEY, &bob);
        assert_eq!(result, Err(ReceiveError::DecryptionFailed));
    }
}
