//! Link-layer configuration

use crate::error::{CoreError, Result};
use binlink_discovery::DiscoveryConfig;
use std::time::Duration;

/// Complete configuration for one [`Service`](crate::service::Service)
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// Keys and freshness
    pub security: SecurityConfig,

    /// Channel selection and liveness
    pub channel: ChannelConfig,

    /// UDP discovery
    pub discovery: DiscoveryConfig,

    /// Hub-side device bookkeeping
    pub registry: RegistryConfig,

    /// Loop cadence and queueing
    pub service: ServiceConfig,
}

impl CoreConfig {
    /// Default configuration using `pre_shared_key`.
    #[must_use]
    pub fn with_key(pre_shared_key: impl Into<String>) -> Self {
        Self {
            security: SecurityConfig {
                pre_shared_key: pre_shared_key.into(),
                ..SecurityConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] for an empty key or a zero
    /// interval anywhere a loop or timeout depends on it.
    pub fn validate(&self) -> Result<()> {
        if self.security.pre_shared_key.is_empty() {
            return Err(CoreError::invalid_config("pre-shared key must not be empty"));
        }
        if self.security.token_timeout.is_zero() {
            return Err(CoreError::invalid_config("token_timeout must be non-zero"));
        }
        if self.channel.ping_timeout.is_zero() || self.channel.handshake_timeout.is_zero() {
            return Err(CoreError::invalid_config("channel timeouts must be non-zero"));
        }
        if self.channel.communication_timeout.is_zero() {
            return Err(CoreError::invalid_config(
                "communication_timeout must be non-zero",
            ));
        }
        if self.channel.peer_timeout <= self.service.heartbeat_request_interval {
            return Err(CoreError::invalid_config(
                "peer_timeout must exceed heartbeat_request_interval",
            ));
        }
        if self.registry.cleanup_interval.is_zero() {
            return Err(CoreError::invalid_config("cleanup_interval must be non-zero"));
        }
        if self.service.poll_interval.is_zero()
            || self.service.heartbeat_interval.is_zero()
            || self.service.heartbeat_request_interval.is_zero()
        {
            return Err(CoreError::invalid_config("loop intervals must be non-zero"));
        }
        if self.service.queue_capacity == 0 {
            return Err(CoreError::invalid_config("queue_capacity must be non-zero"));
        }
        self.discovery
            .validate()
            .map_err(|e| CoreError::InvalidConfig(e.to_string().into()))
    }
}

/// Keys and freshness
#[derive(Clone)]
pub struct SecurityConfig {
    /// Passphrase shared by every party on the link
    pub pre_shared_key: String,

    /// Maximum clock distance accepted when opening an envelope
    pub replay_window: Duration,

    /// Lifetime of a client session, pending or authenticated
    pub token_timeout: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            pre_shared_key: String::new(),
            replay_window: Duration::from_secs(30),
            token_timeout: Duration::from_secs(300),
        }
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("pre_shared_key", &"[REDACTED]")
            .field("replay_window", &self.replay_window)
            .field("token_timeout", &self.token_timeout)
            .finish()
    }
}

/// Channel selection and liveness
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Wait for `PONG` after a serial `PING`
    pub ping_timeout: Duration,

    /// Wait for `ACK` after `READY`
    pub handshake_timeout: Duration,

    /// Idle time after which the channel drops back to `NONE`
    pub communication_timeout: Duration,

    /// Time without anything received from the peer after which the
    /// channel drops back to `NONE`, even while our own sends succeed
    pub peer_timeout: Duration,

    /// Delay before retrying a failed selection
    pub retry_backoff: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(5),
            communication_timeout: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(180),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Hub-side device bookkeeping
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Silence after which a device counts as gone
    pub device_timeout: Duration,

    /// Sweep cadence for devices and sessions
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            device_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Loop cadence and queueing
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Upper bound on one listener read
    pub poll_interval: Duration,

    /// Link side: `HEARTBEAT` cadence and idle check
    pub heartbeat_interval: Duration,

    /// Hub side: `HEARTBEAT_REQUEST` cadence
    pub heartbeat_request_interval: Duration,

    /// Upper bound on one handler run
    pub handler_timeout: Duration,

    /// Inbound queue depth between listener and processor
    pub queue_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_request_interval: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(5),
            queue_capacity: 256,
        }
    }
}
