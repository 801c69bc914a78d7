//! Pre-shared key handling.
//!
//! Every party on a link holds the same passphrase. It is hashed once with
//! SHA-256 into a fixed 32-byte key that drives both the cipher and the MAC,
//! which keeps the wire format readable by existing bin firmware.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, KEY_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// Fixed-length symmetric key derived from the pre-shared passphrase.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EnvelopeKey([u8; KEY_SIZE]);

impl EnvelopeKey {
    /// Derive the key from a passphrase.
    #[must_use]
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest);
        Self(key)
    }

    /// Wrap raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] unless `bytes` is exactly
    /// [`KEY_SIZE`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_SIZE] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self(key))
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// HMAC-SHA256 over the concatenation of `parts`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the MAC rejects the key.
    pub fn mac(&self, parts: &[&[u8]]) -> Result<[u8; 32], CryptoError> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.0).map_err(|_| {
                CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: self.0.len(),
                }
            })?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac.finalize().into_bytes().into())
    }
}

impl std::fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EnvelopeKey([REDACTED])")
    }
}
