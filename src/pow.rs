//! Proof of work attached to messages stored on storage nodes.
//!
//! ```text
//! initial = SHA-512(timestamp ‖ ttl ‖ recipient ‖ payload)
//! trial   = SHA-512(nonce_be ‖ initial)
//! valid   = u64_be(trial[..8]) < target
//! target  = u64::MAX / (nonce_trials · (len + ttl_secs · len / 2^16))
//! ```
//!
//! `len` is the payload length plus the 8-byte nonce. Longer-lived and
//! larger messages require proportionally more work.

use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha512};

const NONCE_LENGTH: u64 = 8;

/// Compute the difficulty target for a payload.
pub fn target(payload_len: usize, ttl_ms: u64, nonce_trials: u64) -> u64 {
    if nonce_trials == 0 {
        return u64::MAX;
    }
    let total_len = payload_len as u128 + NONCE_LENGTH as u128;
    let ttl_secs = (ttl_ms / 1000) as u128;
    let ttl_mult = ttl_secs * total_len / (1u128 << 16);
    let denominator = nonce_trials as u128 * (total_len + ttl_mult);
    (u64::MAX as u128 / denominator.max(1)) as u64
}

fn initial_hash(timestamp: u64, ttl_ms: u64, recipient: &str, payload: &str) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(ttl_ms.to_string().as_bytes());
    hasher.update(recipient.as_bytes());
    hasher.update(payload.as_bytes());
    hasher.finalize().into()
}

fn trial_value(nonce: u64, initial: &[u8; 64]) -> u64 {
    let mut hasher = Sha512::new();
    hasher.update(nonce.to_be_bytes());
    hasher.update(initial);
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Search for a nonce meeting the target.
///
/// Returns the base64 encoded nonce, or `None` if `max_iterations` nonces
/// were tried without success. CPU bound; async callers should run it on
/// `tokio::task::spawn_blocking`.
pub fn calculate(
    timestamp: u64,
    ttl_ms: u64,
    recipient: &str,
    payload: &str,
    nonce_trials: u64,
    max_iterations: u64,
) -> Option<String> {
    let target = target(payload.len(), ttl_ms, nonce_trials);
    let initial = initial_hash(timestamp, ttl_ms, recipient, payload);

    (0..max_iterations)
        .find(|nonce| trial_value(*nonce, &initial) < target)
        .map(|nonce| STANDARD.encode(nonce.to_be_bytes()))
}

/// Check a base64 nonce against the payload it was computed for.
pub fn verify(
    nonce: &str,
    timestamp: u64,
    ttl_ms: u64,
    recipient: &str,
    payload: &str,
    nonce_trials: u64,
) -> bool {
    let Ok(bytes) = STANDARD.decode(nonce) else {
        return false;
    };
    let Ok(bytes) = <[u8; 8]>::try_from(bytes.as_slice()) else {
        return false;
    };
    let initial = initial_hash(timestamp, ttl_ms, recipient, payload);
    trial_value(u64::from_be_bytes(bytes), &initial) < target(payload.len(), ttl_ms, nonce_trials)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_shrinks_with_size_and_ttl() {
        let small = target(100, 60_000, 1);
        let large = target(10_000, 60_000, 1);
        let long_lived = target(100, 14 * 24 * 3600 * 1000, 1);
        assert!(large < small);
        assert!(long_lived < small);
        assert_eq!(target(100, 60_000, 0), u64::MAX);
    }

    #[test]
    fn test_calculate_and_verify() {
        let nonce = calculate(1_650_000_000_000, 60_000, "05ab", "cGF5bG9hZA==", 1, 1 << 20)
            .expect("easy target is met");
        assert!(verify(&nonce, 1_650_000_000_000, 60_000, "05ab", "cGF5bG9hZA==", 1));
    }

    #[test]
    fn test_zero_trials_accepts_first_nonce() {
        let nonce = calculate(1, 60_000, "05ab", "payload", 0, 1).unwrap();
        assert_eq!(nonce, STANDARD.encode(0u64.to_be_bytes()));
    }

    #[test]
    fn test_gives_up_after_max_iterations() {
        assert_eq!(calculate(1, 60_000, "05ab", "payload", u64::MAX, 16), None);
    }

    #[test]
    fn test_verify_rejects_malformed_nonce() {
        assert!(!verify("not base64!", 1, 60_000, "05ab", "payload", 1));
        assert!(!verify("AAAA", 1, 60_000, "05ab", "payload", 1));
    }
}
