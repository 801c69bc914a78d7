//! Channel selection and failover
//!
//! A link talks to exactly one peer at a time, preferring the serial line
//! and falling back to UDP:
//!
//! ```text
//!                 select()
//!                    │
//!        serial? ────┴──── no ─────────────┐
//!          │ yes                           │
//!          ▼                               ▼
//!   PING, wait ping_timeout        udp? ── no ──► ChannelUnavailable
//!          │                               │ yes
//!     PONG │  no PONG ───────────────────► │
//!          ▼                               ▼
//!       SERIAL                    DISCOVER ... HERE from X
//!                                          │
//!                                 READY ─► X, wait handshake_timeout
//!                                          │ ACK
//!                                 SYNCHRONIZED ─► X
//!                                          ▼
//!                                        UDP(X)
//! ```
//!
//! Hearing nothing from the peer for `peer_timeout` also drops the channel,
//! since UDP sends to a vanished peer still succeed.
//!
//! Any traffic on the active channel refreshes `last_activity`; once it has
//! been quiet for `communication_timeout` the channel drops back to `NONE`
//! and the heartbeat loop selects again. A failed send does the same.
//!
//! Everything except `DISCOVER`/`HERE` is enveloped.

use crate::config::CoreConfig;
use crate::endpoint::{
    ACK, Endpoint, Inbound, PING, PONG, READY, SYNCHRONIZED, open_frame, seal_frame,
};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use binlink_crypto::EnvelopeKey;
use binlink_discovery::{Discovery, DiscoveryMessage, answer_discover};
use binlink_transport::{PeerAddress, Transport, TransportError, TransportKind, TransportStats};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Which transport the link is currently using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelKind {
    /// No synchronized peer
    None,
    /// Serial line
    Serial,
    /// UDP peer
    Udp,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("NONE"),
            Self::Serial => f.write_str("SERIAL"),
            Self::Udp => f.write_str("UDP"),
        }
    }
}

impl From<TransportKind> for ChannelKind {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Serial => Self::Serial,
            TransportKind::Udp => Self::Udp,
        }
    }
}

/// Reportable view of the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    /// Active transport
    pub kind: ChannelKind,
    /// Peer of the active channel (`None` on a hub)
    pub peer: Option<String>,
    /// Handshake completed
    pub synchronized: bool,
    /// Seconds since the last traffic on the channel
    pub idle_secs: u64,
}

impl ChannelSnapshot {
    /// A hub is always listening on its transport and has no single peer.
    #[must_use]
    pub fn hub(kind: TransportKind) -> Self {
        Self {
            kind: kind.into(),
            peer: None,
            synchronized: true,
            idle_secs: 0,
        }
    }
}

struct ChannelState {
    kind: ChannelKind,
    peer: Option<PeerAddress>,
    synchronized: bool,
    last_activity: Instant,
    last_received: Instant,
}

impl ChannelState {
    fn none() -> Self {
        let now = Instant::now();
        Self {
            kind: ChannelKind::None,
            peer: None,
            synchronized: false,
            last_activity: now,
            last_received: now,
        }
    }
}

/// Link-side endpoint: one peer over serial or UDP.
pub struct ChannelManager {
    serial: Option<Arc<dyn Transport>>,
    udp: Option<Arc<dyn Transport>>,
    discovery: Option<Discovery>,
    key: EnvelopeKey,
    replay_window_secs: u64,
    ping_timeout: Duration,
    handshake_timeout: Duration,
    communication_timeout: Duration,
    peer_timeout: Duration,
    state: Mutex<ChannelState>,
    // Serializes readers so selection and the listener never split a
    // conversation between them.
    recv_lock: tokio::sync::Mutex<()>,
    serial_lost: AtomicBool,
}

impl ChannelManager {
    /// Create a manager with no transports attached.
    #[must_use]
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            serial: None,
            udp: None,
            discovery: None,
            key: EnvelopeKey::from_passphrase(&config.security.pre_shared_key),
            replay_window_secs: config.security.replay_window.as_secs(),
            ping_timeout: config.channel.ping_timeout,
            handshake_timeout: config.channel.handshake_timeout,
            communication_timeout: config.channel.communication_timeout,
            peer_timeout: config.channel.peer_timeout,
            state: Mutex::new(ChannelState::none()),
            recv_lock: tokio::sync::Mutex::new(()),
            serial_lost: AtomicBool::new(false),
        }
    }

    /// Attach the serial line.
    #[must_use]
    pub fn with_serial(mut self, transport: Arc<dyn Transport>) -> Self {
        self.serial = Some(transport);
        self
    }

    /// Attach a UDP socket; discovery runs over it.
    #[must_use]
    pub fn with_udp(mut self, transport: Arc<dyn Transport>, config: &CoreConfig) -> Self {
        self.discovery = Some(Discovery::new(
            Arc::clone(&transport),
            config.discovery.clone(),
        ));
        self.udp = Some(transport);
        self
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        // A panic elsewhere cannot leave the state half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Active transport.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.lock_state().kind
    }

    /// Peer of the active channel.
    #[must_use]
    pub fn peer(&self) -> Option<PeerAddress> {
        self.lock_state().peer
    }

    /// Whether a synchronized channel exists.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        let state = self.lock_state();
        state.kind != ChannelKind::None && state.synchronized
    }

    fn adopt(&self, kind: ChannelKind, peer: PeerAddress) {
        let mut state = self.lock_state();
        if state.kind != kind || state.peer != Some(peer) {
            tracing::info!("Channel {} -> {} ({})", state.kind, kind, peer);
        }
        let now = Instant::now();
        *state = ChannelState {
            kind,
            peer: Some(peer),
            synchronized: true,
            last_activity: now,
            last_received: now,
        };
    }

    /// Drop back to `NONE`.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        if state.kind != ChannelKind::None {
            tracing::info!("Channel {} -> NONE", state.kind);
        }
        *state = ChannelState::none();
    }

    fn touch_sent(&self, to: &PeerAddress) {
        let mut state = self.lock_state();
        if state.peer.as_ref() == Some(to) {
            state.last_activity = Instant::now();
        }
    }

    fn touch(&self, from: &PeerAddress) {
        let mut state = self.lock_state();
        if state.peer.as_ref() == Some(from) {
            let now = Instant::now();
            state.last_activity = now;
            state.last_received = now;
        }
    }

    /// Reset the channel if it has been quiet for too long.
    ///
    /// Returns `true` if the channel was reset.
    pub fn check_idle(&self) -> bool {
        let (idle, silent) = {
            let state = self.lock_state();
            let active = state.kind != ChannelKind::None;
            (
                active && state.last_activity.elapsed() > self.communication_timeout,
                active && state.last_received.elapsed() > self.peer_timeout,
            )
        };
        if idle {
            tracing::warn!(
                "No traffic for {:?}, re-evaluating channel",
                self.communication_timeout
            );
        } else if silent {
            tracing::warn!(
                "Nothing heard from peer for {:?}, re-evaluating channel",
                self.peer_timeout
            );
        }
        if idle || silent {
            self.reset();
        }
        idle || silent
    }

    /// Serial transport tried on selection, lost or not.
    fn serial_attached(&self) -> Option<&Arc<dyn Transport>> {
        self.serial.as_ref().filter(|t| !t.is_closed())
    }

    fn serial_usable(&self) -> Option<&Arc<dyn Transport>> {
        self.serial
            .as_ref()
            .filter(|t| !t.is_closed() && !self.serial_lost.load(Ordering::Relaxed))
    }

    fn transport_for(&self, to: &PeerAddress) -> Option<&Arc<dyn Transport>> {
        match to {
            PeerAddress::Serial => self.serial.as_ref(),
            PeerAddress::Udp(_) => self.udp.as_ref(),
        }
    }

    /// Pick a channel: serial first, then UDP discovery and handshake.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ChannelUnavailable`] if neither transport
    /// produced a synchronized peer. The channel is `NONE` afterwards.
    pub async fn select(&self) -> Result<ChannelKind> {
        let _reader = self.recv_lock.lock().await;

        if let Some(serial) = self.serial_attached() {
            match self.try_serial(serial.as_ref()).await {
                Ok(()) => {
                    if self.serial_lost.swap(false, Ordering::Relaxed) {
                        tracing::info!("Serial line back");
                    }
                    self.adopt(ChannelKind::Serial, PeerAddress::Serial);
                    return Ok(ChannelKind::Serial);
                }
                Err(e) => tracing::info!("Serial unavailable: {}", e),
            }
        }

        if let (Some(udp), Some(discovery)) = (&self.udp, &self.discovery) {
            match self.try_udp(udp.as_ref(), discovery).await {
                Ok(peer) => {
                    self.adopt(ChannelKind::Udp, PeerAddress::Udp(peer));
                    return Ok(ChannelKind::Udp);
                }
                Err(e) => tracing::info!("UDP unavailable: {}", e),
            }
        }

        self.reset();
        Err(CoreError::channel_unavailable(
            "neither serial nor UDP produced a peer",
        ))
    }

    async fn try_serial(&self, serial: &dyn Transport) -> Result<()> {
        let frame = seal_frame(PING, &self.key)?;
        if let Err(e) = serial.send(&frame, &PeerAddress::Serial).await {
            self.note_serial_error(&e);
            return Err(e.into());
        }

        let deadline = Instant::now() + self.ping_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CoreError::timeout("no PONG on serial"));
            }
            let (frame, from) = match serial.poll(remaining).await {
                Ok(Some(received)) => received,
                Ok(None) => return Err(CoreError::timeout("no PONG on serial")),
                Err(e) => {
                    self.note_serial_error(&e);
                    return Err(e.into());
                }
            };
            match open_frame(&frame, &self.key, self.replay_window_secs, &from).as_deref() {
                Some(PONG) => return Ok(()),
                Some(PING) => self.reply_control(PONG, &from).await,
                Some(other) => tracing::debug!("Ignored {} while pinging serial", other),
                None => {}
            }
        }
    }

    async fn try_udp(&self, udp: &dyn Transport, discovery: &Discovery) -> Result<SocketAddr> {
        discovery.reset();
        let candidate = discovery.run().await?;
        let target = PeerAddress::Udp(candidate);

        udp.send(&seal_frame(READY, &self.key)?, &target).await?;
        tracing::debug!("Sent READY to {}", target);

        let deadline = Instant::now() + self.handshake_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CoreError::handshake("no ACK before handshake timeout"));
            }
            let Some((frame, from)) = udp.poll(remaining).await? else {
                continue;
            };

            if let Some(discovery_message) = DiscoveryMessage::parse(&frame) {
                if discovery_message == DiscoveryMessage::Discover {
                    answer_discover(udp, &from).await?;
                }
                continue;
            }

            let Some(message) = open_frame(&frame, &self.key, self.replay_window_secs, &from)
            else {
                continue;
            };
            let Some(addr) = from.socket_addr() else {
                continue;
            };
            match message.as_str() {
                ACK => {
                    udp.send(&seal_frame(SYNCHRONIZED, &self.key)?, &from).await?;
                    tracing::info!("Handshake complete with {}", from);
                    return Ok(addr);
                }
                // The peer completed its own handshake with us first.
                SYNCHRONIZED => return Ok(addr),
                READY => self.reply_control(ACK, &from).await,
                PING => self.reply_control(PONG, &from).await,
                other => tracing::debug!("Ignored {} during handshake", other),
            }
        }
    }

    fn note_serial_error(&self, error: &TransportError) {
        if matches!(error, TransportError::Disconnected | TransportError::Closed) {
            if !self.serial_lost.swap(true, Ordering::Relaxed) {
                tracing::warn!("Serial line lost: {}", error);
            }
            if self.kind() == ChannelKind::Serial {
                self.reset();
            }
        }
    }

    async fn reply_control(&self, message: &str, to: &PeerAddress) {
        if let Err(e) = self.send_to(message, to).await {
            tracing::warn!("Could not send {} to {}: {}", message, to, e);
        }
    }

    /// Send `message` to the active peer.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ChannelUnavailable`] when the channel is
    /// `NONE`, or the send error (after resetting the channel).
    pub async fn send(&self, message: &str) -> Result<()> {
        let Some(peer) = self.peer().filter(|_| self.is_synchronized()) else {
            return Err(CoreError::channel_unavailable("no synchronized channel"));
        };
        self.send_to(message, &peer).await
    }

    async fn poll_any(&self, wait: Duration) -> Result<Option<(Vec<u8>, PeerAddress)>> {
        let serial = self.serial_usable();
        let udp = self.udp.as_ref().filter(|t| !t.is_closed());

        let polled = match (serial, udp) {
            (Some(serial), Some(udp)) => tokio::select! {
                r = serial.poll(wait) => r.map_err(|e| (e, TransportKind::Serial)),
                r = udp.poll(wait) => r.map_err(|e| (e, TransportKind::Udp)),
            },
            (Some(serial), None) => serial.poll(wait).await.map_err(|e| (e, TransportKind::Serial)),
            (None, Some(udp)) => udp.poll(wait).await.map_err(|e| (e, TransportKind::Udp)),
            (None, None) => {
                tokio::time::sleep(wait).await;
                return Ok(None);
            }
        };

        match polled {
            Ok(received) => Ok(received),
            Err((e, TransportKind::Serial)) => {
                self.note_serial_error(&e);
                Err(e.into())
            }
            Err((e, TransportKind::Udp)) => Err(e.into()),
        }
    }

    async fn handle_frame(&self, frame: Vec<u8>, from: PeerAddress) -> Option<Inbound> {
        if from != PeerAddress::Serial {
            match DiscoveryMessage::parse(&frame) {
                Some(DiscoveryMessage::Discover) => {
                    if let Some(udp) = &self.udp {
                        if let Err(e) = answer_discover(udp.as_ref(), &from).await {
                            tracing::warn!("Could not answer DISCOVER from {}: {}", from, e);
                        }
                    }
                    return None;
                }
                Some(DiscoveryMessage::Here) => return None,
                None => {}
            }
        }

        let message = open_frame(&frame, &self.key, self.replay_window_secs, &from)?;
        match message.as_str() {
            PING => {
                if from == PeerAddress::Serial {
                    self.adopt(ChannelKind::Serial, from);
                } else {
                    self.touch(&from);
                }
                self.reply_control(PONG, &from).await;
            }
            PONG | ACK => self.touch(&from),
            READY => self.reply_control(ACK, &from).await,
            SYNCHRONIZED => {
                if self.kind() == ChannelKind::Serial {
                    tracing::debug!("Ignored SYNCHRONIZED from {} while on serial", from);
                } else {
                    self.adopt(ChannelKind::Udp, from);
                }
            }
            _ => {
                self.touch(&from);
                return Some(Inbound { message, from });
            }
        }
        None
    }

    /// Current state for reporting.
    #[must_use]
    pub fn snapshot(&self) -> ChannelSnapshot {
        let state = self.lock_state();
        ChannelSnapshot {
            kind: state.kind,
            peer: state.peer.map(|p| p.to_string()),
            synchronized: state.synchronized,
            idle_secs: state.last_activity.elapsed().as_secs(),
        }
    }
}

#[async_trait]
impl Endpoint for ChannelManager {
    async fn recv(&self, wait: Duration) -> Result<Option<Inbound>> {
        let _reader = self.recv_lock.lock().await;
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some((frame, from)) = self.poll_any(remaining).await? else {
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
        let Some(transport) = self.transport_for(to) else {
            return Err(CoreError::channel_unavailable("no transport for destination"));
        };
        let frame = seal_frame(message, &self.key)?;

        match transport.send(&frame, to).await {
            Ok(_) => {
                self.touch_sent(to);
                tracing::debug!("Sent {} bytes to {}", frame.len(), to);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Send to {} failed: {}", to, e);
                if *to == PeerAddress::Serial {
                    self.note_serial_error(&e);
                }
                if self.peer().as_ref() == Some(to) {
                    self.reset();
                }
                Err(e.into())
            }
        }
    }

    async fn close(&self) {
        for transport in [&self.serial, &self.udp].into_iter().flatten() {
            if let Err(e) = transport.close().await {
                tracing::warn!("Error closing {} transport: {}", transport.kind(), e);
            }
        }
        self.reset();
    }

    fn channel(&self) -> ChannelSnapshot {
        self.snapshot()
    }

    fn transport_stats(&self) -> Vec<TransportStats> {
        [&self.serial, &self.udp]
            .into_iter()
            .flatten()
            .map(|t| t.stats())
            .collect()
    }
}
