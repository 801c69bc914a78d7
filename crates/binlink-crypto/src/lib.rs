//! # BINLINK Crypto
//!
//! Cryptographic primitives for the BINLINK secure messaging layer.
//!
//! This crate provides:
//! - The sealed message [`Envelope`] (encrypt-then-MAC with a freshness window)
//! - Pre-shared key derivation into a fixed-length [`EnvelopeKey`]
//! - Challenge/response helpers for client session authentication
//! - Constant-time comparison and OS randomness
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Notes |
//! |----------|-----------|-------|
//! | Cipher | AES-256-CBC | PKCS7 padding, random 16-byte IV per message |
//! | MAC | HMAC-SHA256 | over IV ‖ ciphertext, verified before decryption |
//! | Key derivation | SHA-256 | pre-shared passphrase hashed once at startup |
//! | Freshness | unix timestamp | embedded in the encrypted payload |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod challenge;
pub mod constant_time;
pub mod envelope;
pub mod error;
pub mod key;
pub mod random;

pub use envelope::{Envelope, open, open_at, seal, seal_at};
pub use error::CryptoError;
pub use key::EnvelopeKey;

/// Cipher block and IV size in bytes
pub const NONCE_SIZE: usize = 16;

/// Symmetric key size in bytes
pub const KEY_SIZE: usize = 32;

/// HMAC-SHA256 tag size in bytes
pub const SIGNATURE_SIZE: usize = 32;

/// Default replay window in seconds
pub const DEFAULT_REPLAY_WINDOW_SECS: u64 = 30;

/// Current unix time in whole seconds.
///
/// A clock set before the epoch reads as zero.
#[must_use]
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
