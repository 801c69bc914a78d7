//! Message endpoints
//!
//! An [`Endpoint`] is what the service loops read from and write to. It
//! hides transport selection and the link-control traffic, so the loops
//! only ever see application messages:
//!
//! - the link side is a [`ChannelManager`](crate::channel::ChannelManager)
//!   talking to exactly one peer over serial or UDP
//! - the hub side is a [`HubEndpoint`] talking to any number of devices
//!   over one UDP socket
//!
//! Both answer `DISCOVER`, `READY` and `PING` on their own and never hand
//! them upwards.

use crate::channel::ChannelSnapshot;
use crate::error::Result;
use async_trait::async_trait;
use binlink_crypto::{Envelope, EnvelopeKey, open, seal};
use binlink_discovery::{DiscoveryMessage, answer_discover};
use binlink_transport::{PeerAddress, Transport, TransportStats};
use std::sync::Arc;
use std::time::Duration;

/// Liveness probe over the serial line
pub const PING: &str = "PING";
/// Answer to [`PING`]
pub const PONG: &str = "PONG";
/// First step of the UDP handshake
pub const READY: &str = "READY";
/// Answer to [`READY`]
pub const ACK: &str = "ACK";
/// Last step of the UDP handshake
pub const SYNCHRONIZED: &str = "SYNCHRONIZED";

/// One decrypted application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Plaintext `PREFIX[:ARGS]`
    pub message: String,
    /// Where it came from; replies go back here
    pub from: PeerAddress,
}

/// Source and sink of application messages.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Wait up to `wait` for the next application message.
    ///
    /// Control traffic is handled internally and does not end the wait.
    async fn recv(&self, wait: Duration) -> Result<Option<Inbound>>;

    /// Envelope `message` and send it to `to`.
    async fn send_to(&self, message: &str, to: &PeerAddress) -> Result<()>;

    /// Close the underlying transports.
    async fn close(&self);

    /// Current channel state.
    fn channel(&self) -> ChannelSnapshot;

    /// Per-transport counters.
    fn transport_stats(&self) -> Vec<TransportStats>;
}

/// Seal `message` into wire bytes.
pub(crate) fn seal_frame(message: &str, key: &EnvelopeKey) -> Result<Vec<u8>> {
    Ok(seal(message, key)?.to_wire().into_bytes())
}

/// Open a wire frame, logging and dropping anything that fails.
pub(crate) fn open_frame(
    frame: &[u8],
    key: &EnvelopeKey,
    window_secs: u64,
    from: &PeerAddress,
) -> Option<String> {
    let opened = Envelope::from_wire(frame).and_then(|envelope| open(&envelope, key, window_secs));
    match opened {
        Ok(message) => Some(message),
        Err(e) if e.is_replay() => {
            tracing::warn!("Dropped stale message from {}: {}", from, e);
            None
        }
        Err(e) => {
            tracing::warn!("Dropped invalid message from {}: {}", from, e);
            None
        }
    }
}

/// Hub side of the link: one UDP socket, many devices.
pub struct HubEndpoint {
    transport: Arc<dyn Transport>,
    key: EnvelopeKey,
    replay_window_secs: u64,
}

impl HubEndpoint {
    /// Serve devices over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, key: EnvelopeKey, replay_window: Duration) -> Self {
        Self {
            transport,
            key,
            replay_window_secs: replay_window.as_secs(),
        }
    }

    async fn reply_control(&self, message: &str, to: &PeerAddress) {
        if let Err(e) = self.send_to(message, to).await {
            tracing::warn!("Could not send {} to {}: {}", message, to, e);
        }
    }

    async fn handle_frame(&self, frame: Vec<u8>, from: PeerAddress) -> Option<Inbound> {
        match DiscoveryMessage::parse(&frame) {
            Some(DiscoveryMessage::Discover) => {
                if let Err(e) = answer_discover(self.transport.as_ref(), &from).await {
                    tracing::warn!("Could not answer DISCOVER from {}: {}", from, e);
                }
                return None;
            }
            Some(DiscoveryMessage::Here) => return None,
            None => {}
        }

        let message = open_frame(&frame, &self.key, self.replay_window_secs, &from)?;
        match message.as_str() {
            READY => self.reply_control(ACK, &from).await,
            PING => self.reply_control(PONG, &from).await,
            SYNCHRONIZED => tracing::info!("Link synchronized with {}", from),
            ACK | PONG => tracing::trace!("Ignored {} from {}", message, from),
            _ => return Some(Inbound { message, from }),
        }
        None
    }
}

#[async_trait]
impl Endpoint for HubEndpoint {
    async fn recv(&self, wait: Duration) -> Result<Option<Inbound>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let Some((frame, from)) = self.transport.poll(remaining).await? else {
                return Ok(None);
            };
            if let Some(inbound) = self.handle_frame(frame, from).await {
                return Ok(Some(inbound));
            }
            if remaining.is_zero() {
                return Ok(None);
            }
        }
    }

    async fn send_to(&self, message: &str, to: &PeerAddress) -> Result<()> {
        let frame = seal_frame(message, &self.key)?;
        self.transport.send(&frame, to).await?;
        tracing::debug!("Sent {} bytes to {}", frame.len(), to);
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.transport.close().await {
            tracing::warn!("Error closing transport: {}", e);
        }
    }

    fn channel(&self) -> ChannelSnapshot {
        ChannelSnapshot::hub(self.transport.kind())
    }

    fn transport_stats(&self) -> Vec<TransportStats> {
        vec![self.transport.stats()]
    }
}
