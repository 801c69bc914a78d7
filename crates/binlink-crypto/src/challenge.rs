//! Challenge/response helpers for client session authentication.
//!
//! A client proves knowledge of the pre-shared key by returning
//! `hex(HMAC-SHA256(key, "<challenge>:<client_id>"))`.

use crate::constant_time::verify_hex;
use crate::random::random_hex;
use crate::{CryptoError, EnvelopeKey};

/// Random bytes in a challenge (rendered as 32 hex characters)
pub const CHALLENGE_BYTES: usize = 16;

/// Random bytes in a session key (rendered as 64 hex characters)
pub const SESSION_KEY_BYTES: usize = 32;

/// Draw a fresh challenge.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
pub fn generate_challenge() -> Result<String, CryptoError> {
    random_hex(CHALLENGE_BYTES)
}

/// Draw a fresh session key.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
pub fn generate_session_key() -> Result<String, CryptoError> {
    random_hex(SESSION_KEY_BYTES)
}

/// Compute the expected response for `challenge` issued to `client_id`.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKeyLength`] if the MAC rejects the key.
pub fn challenge_response(
    key: &EnvelopeKey,
    challenge: &str,
    client_id: &str,
) -> Result<String, CryptoError> {
    Ok(hex::encode(challenge_tag(key, challenge, client_id)?))
}

/// Check a client's response in constant time.
#[must_use]
pub fn verify_challenge_response(
    key: &EnvelopeKey,
    challenge: &str,
    client_id: &str,
    response: &str,
) -> bool {
    match challenge_tag(key, challenge, client_id) {
        Ok(expected) => verify_hex(&expected, response),
        Err(_) => false,
    }
}

fn challenge_tag(key: &EnvelopeKey, challenge: &str, client_id: &str) -> Result<[u8; 32], CryptoError> {
    key.mac(&[challenge.as_bytes(), b":", client_id.as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_format() {
        let c = generate_challenge().unwrap();
        assert_eq!(c.len(), 32);
        assert_ne!(c, generate_challenge().unwrap());
        assert_eq!(generate_session_key().unwrap().len(), 64);
    }

    #[test]
    fn test_response_verifies() {
        let key = EnvelopeKey::from_passphrase("K");
        let response = challenge_response(&key, "c0ffee", "app-1").unwrap();
        assert!(verify_challenge_response(&key, "c0ffee", "app-1", &response));
    }

    #[test]
    fn test_response_bound_to_client() {
        let key = EnvelopeKey::from_passphrase("K");
        let response = challenge_response(&key, "c0ffee", "app-1").unwrap();
        assert!(!verify_challenge_response(&key, "c0ffee", "app-2", &response));
        assert!(!verify_challenge_response(&key, "c0ffef", "app-1", &response));
    }

    #[test]
    fn test_response_bound_to_key() {
        let response =
            challenge_response(&EnvelopeKey::from_passphrase("K"), "c0ffee", "app-1").unwrap();
        let other = EnvelopeKey::from_passphrase("not-K");
        assert!(!verify_challenge_response(&other, "c0ffee", "app-1", &response));
    }
}
