//! Sealed message envelope.
//!
//! Every message that crosses a link after discovery is wrapped in an
//! envelope:
//!
//! ```text
//! plaintext ──► {"message": m, "timestamp": t} ──► AES-256-CBC(key, iv) ──► ciphertext
//!                                                                            │
//!                     signature = HMAC-SHA256(key, iv ‖ ciphertext) ◄────────┘
//!
//! wire: {"iv": base64(iv), "data": base64(ciphertext), "signature": hex(signature)}
//! ```
//!
//! Opening runs in the reverse order: the signature is recomputed and
//! compared in constant time before any decryption happens, then the
//! embedded timestamp is checked against the replay window.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::constant_time::verify_32;
use crate::random::random_16;
use crate::{CryptoError, EnvelopeKey, NONCE_SIZE, SIGNATURE_SIZE, unix_now};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Encrypted, signed, timestamped message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Random IV, fresh for every seal
    pub nonce: [u8; NONCE_SIZE],
    /// AES-256-CBC ciphertext of the JSON payload
    pub ciphertext: Vec<u8>,
    /// HMAC-SHA256 over `nonce ‖ ciphertext`
    pub signature: [u8; SIGNATURE_SIZE],
}

#[derive(Serialize, Deserialize)]
struct Payload {
    message: String,
    timestamp: u64,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    iv: String,
    data: String,
    signature: String,
}

impl Envelope {
    /// Encode as the compact JSON wire object.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let wire = WireEnvelope {
            iv: BASE64.encode(self.nonce),
            data: BASE64.encode(&self.ciphertext),
            signature: hex::encode(self.signature),
        };
        // Three string fields always serialize.
        serde_json::to_string(&wire).unwrap_or_default()
    }

    /// Decode the JSON wire object.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidMessage`] if the bytes are not a wire
    /// envelope or a field has the wrong encoding or length.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, CryptoError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| CryptoError::InvalidMessage(format!("envelope json: {e}")))?;

        let nonce: [u8; NONCE_SIZE] = BASE64
            .decode(wire.iv.as_bytes())
            .map_err(|e| CryptoError::InvalidMessage(format!("iv: {e}")))?
            .try_into()
            .map_err(|_| CryptoError::InvalidMessage("iv length".into()))?;

        let ciphertext = BASE64
            .decode(wire.data.as_bytes())
            .map_err(|e| CryptoError::InvalidMessage(format!("data: {e}")))?;

        let signature: [u8; SIGNATURE_SIZE] = hex::decode(wire.signature.as_bytes())
            .map_err(|e| CryptoError::InvalidMessage(format!("signature: {e}")))?
            .try_into()
            .map_err(|_| CryptoError::InvalidMessage("signature length".into()))?;

        Ok(Self {
            nonce,
            ciphertext,
            signature,
        })
    }
}

/// Seal `plaintext` stamped with the current time.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if no IV can be drawn.
pub fn seal(plaintext: &str, key: &EnvelopeKey) -> Result<Envelope, CryptoError> {
    seal_at(plaintext, key, unix_now())
}

/// Seal `plaintext` stamped with an explicit unix `timestamp`.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if no IV can be drawn, or
/// [`CryptoError::InvalidMessage`] if the payload cannot be encoded.
pub fn seal_at(plaintext: &str, key: &EnvelopeKey, timestamp: u64) -> Result<Envelope, CryptoError> {
    let payload = serde_json::to_vec(&Payload {
        message: plaintext.to_string(),
        timestamp,
    })
    .map_err(|e| CryptoError::InvalidMessage(e.to_string()))?;

    let nonce = random_16()?;
    let ciphertext = Aes256CbcEnc::new(key.as_bytes().into(), (&nonce).into())
        .encrypt_padded_vec_mut::<Pkcs7>(&payload);
    let signature = key.mac(&[&nonce, &ciphertext])?;

    Ok(Envelope {
        nonce,
        ciphertext,
        signature,
    })
}

/// Open an envelope against the current time.
///
/// # Errors
///
/// See [`open_at`].
pub fn open(envelope: &Envelope, key: &EnvelopeKey, window_secs: u64) -> Result<String, CryptoError> {
    open_at(envelope, key, window_secs, unix_now())
}

/// Open an envelope as if the clock read `now`.
///
/// # Errors
///
/// - [`CryptoError::InvalidSignature`] if the signature does not match; no
///   decryption is attempted in that case
/// - [`CryptoError::DecryptionFailed`] if padding is invalid
/// - [`CryptoError::InvalidMessage`] if the payload is not the expected JSON
/// - [`CryptoError::Stale`] if `|now - timestamp| > window_secs`
pub fn open_at(
    envelope: &Envelope,
    key: &EnvelopeKey,
    window_secs: u64,
    now: u64,
) -> Result<String, CryptoError> {
    let expected = key.mac(&[&envelope.nonce, &envelope.ciphertext])?;
    if !verify_32(&expected, &envelope.signature) {
        return Err(CryptoError::InvalidSignature);
    }

    let plaintext = Aes256CbcDec::new(key.as_bytes().into(), (&envelope.nonce).into())
        .decrypt_padded_vec_mut::<Pkcs7>(&envelope.ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let payload: Payload = serde_json::from_slice(&plaintext)
        .map_err(|e| CryptoError::InvalidMessage(format!("payload: {e}")))?;

    let age = now.abs_diff(payload.timestamp);
    if age > window_secs {
        return Err(CryptoError::Stale {
            age,
            window: window_secs,
        });
    }

    Ok(payload.message)
}
