//! Error types for the link layer
//!
//! Errors are grouped by how the rest of the system reacts to them.
//!
//! # Error Categories
//!
//! - **Silent**: dropped where they occur and never answered on the wire
//!   (bad envelopes, unknown commands, traffic from unregistered devices)
//! - **Transient**: the current attempt failed and the caller retries with
//!   backoff (no channel, transport hiccups, timeouts)
//! - **Permanent**: need intervention (invalid configuration, wrong state)
//!
//! `AuthRequired` is the one error that is answered explicitly, so the client
//! knows to re-authenticate.

use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in link-layer operations
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    // ============ Silent ============
    /// Envelope failed MAC, decryption, parsing or freshness checks
    #[error("Crypto failure: {0}")]
    Crypto(Cow<'static, str>),

    /// No handler matched the command prefix
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Heartbeat or command referencing a device the hub does not know
    #[error("Unknown device: {0}")]
    RegistryMiss(String),

    // ============ Answered ============
    /// Privileged command without a valid session
    #[error("Authentication required")]
    AuthRequired,

    // ============ Transient ============
    /// Neither serial nor UDP produced a synchronized channel
    #[error("No channel available: {0}")]
    ChannelUnavailable(Cow<'static, str>),

    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Discovery failed
    #[error("Discovery error: {0}")]
    Discovery(Cow<'static, str>),

    /// Handshake did not complete
    #[error("Handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    // ============ Permanent ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),
}

impl CoreError {
    /// Returns true if the error is dropped without any reply
    #[must_use]
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            CoreError::Crypto(_) | CoreError::UnknownCommand(_) | CoreError::RegistryMiss(_)
        )
    }

    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::ChannelUnavailable(_)
                | CoreError::Transport(_)
                | CoreError::Discovery(_)
                | CoreError::Handshake(_)
                | CoreError::Timeout(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidConfig(_) | CoreError::InvalidState(_)
        )
    }

    /// Create a channel-unavailable error with static context (zero allocation)
    #[must_use]
    pub const fn channel_unavailable(context: &'static str) -> Self {
        CoreError::ChannelUnavailable(Cow::Borrowed(context))
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        CoreError::Transport(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        CoreError::Timeout(Cow::Borrowed(context))
    }

    /// Create a handshake error with static context (zero allocation)
    #[must_use]
    pub const fn handshake(context: &'static str) -> Self {
        CoreError::Handshake(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        CoreError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        CoreError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<binlink_crypto::CryptoError> for CoreError {
    fn from(err: binlink_crypto::CryptoError) -> Self {
        CoreError::Crypto(Cow::Owned(err.to_string()))
    }
}

impl From<binlink_transport::TransportError> for CoreError {
    fn from(err: binlink_transport::TransportError) -> Self {
        CoreError::Transport(Cow::Owned(err.to_string()))
    }
}

impl From<binlink_discovery::DiscoveryError> for CoreError {
    fn from(err: binlink_discovery::DiscoveryError) -> Self {
        CoreError::Discovery(Cow::Owned(err.to_string()))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(Cow::Owned(err.to_string()))
    }
}

/// Result type for link-layer operations
pub type Result<T> = std::result::Result<T, CoreError>;
