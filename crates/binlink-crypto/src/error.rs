//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Signature did not match the envelope contents
    #[error("invalid signature")]
    InvalidSignature,

    /// Ciphertext could not be decrypted or unpadded
    #[error("decryption failed")]
    DecryptionFailed,

    /// Timestamp outside the accepted freshness window
    #[error("stale message: {age}s old, window {window}s")]
    Stale {
        /// Absolute distance between sender and receiver clocks, in seconds
        age: u64,
        /// Accepted window, in seconds
        window: u64,
    },

    /// Envelope or payload does not follow the wire format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}

impl CryptoError {
    /// Whether the failure means the message was modified or forged
    #[must_use]
    pub fn is_tamper(&self) -> bool {
        matches!(self, Self::InvalidSignature | Self::DecryptionFailed)
    }

    /// Whether the failure is a freshness (replay) rejection
    #[must_use]
    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}
