//! Discovery Manager
//!
//! Drives the `IDLE → PROBING → DISCOVERED` state machine over a UDP
//! [`Transport`] and answers probes from other parties.

use binlink_transport::{PeerAddress, Transport, TransportError, TransportKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Limited broadcast on the default link port
const DEFAULT_BROADCAST_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, 8888));

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No peer answered before the discovery deadline
    #[error("no peer answered after {attempts} probes")]
    Timeout {
        /// Probes sent
        attempts: u32,
    },

    /// Discovery only runs over UDP
    #[error("discovery is not supported over {0}")]
    UnsupportedTransport(TransportKind),

    /// Transport failure that ends the probe
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    InvalidConfig(String),
}

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Where `DISCOVER` probes are sent
    pub broadcast_addr: SocketAddr,
    /// Overall bound on one discovery run
    pub discover_timeout: Duration,
    /// Gap between probes
    pub retry_interval: Duration,
    /// Probes per run
    pub max_retries: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_addr: DEFAULT_BROADCAST_ADDR,
            discover_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(1),
            max_retries: 5,
        }
    }
}

impl DiscoveryConfig {
    /// Broadcast on `port` with default timing.
    #[must_use]
    pub fn with_port(port: u16) -> Self {
        Self {
            broadcast_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
            ..Self::default()
        }
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidConfig`] if any timing value is zero.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.discover_timeout.is_zero() {
            return Err(DiscoveryError::InvalidConfig(
                "discover_timeout must be non-zero".into(),
            ));
        }
        if self.retry_interval.is_zero() {
            return Err(DiscoveryError::InvalidConfig(
                "retry_interval must be non-zero".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "max_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Where a discovery run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Not probing, no peer known
    Idle,
    /// Probes in flight
    Probing,
    /// Peer found at the given address
    Discovered(SocketAddr),
}

/// Plain-text discovery messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMessage {
    /// "Who is out there?"
    Discover,
    /// "I am, at the address you see this from."
    Here,
}

impl DiscoveryMessage {
    /// Wire form.
    #[must_use]
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Discover => b"DISCOVER",
            Self::Here => b"HERE",
        }
    }

    /// Recognise a discovery frame. Surrounding whitespace is ignored.
    #[must_use]
    pub fn parse(frame: &[u8]) -> Option<Self> {
        match frame.trim_ascii() {
            b"DISCOVER" => Some(Self::Discover),
            b"HERE" => Some(Self::Here),
            _ => None,
        }
    }
}

/// Answer a `DISCOVER` from `to` with `HERE`.
///
/// # Errors
///
/// Returns [`DiscoveryError::Transport`] if the reply cannot be sent.
pub async fn answer_discover(transport: &dyn Transport, to: &PeerAddress) -> Result<(), DiscoveryError> {
    transport.send(DiscoveryMessage::Here.as_bytes(), to).await?;
    tracing::debug!("Answered DISCOVER from {}", to);
    Ok(())
}

/// UDP peer discovery.
pub struct Discovery {
    transport: Arc<dyn Transport>,
    config: DiscoveryConfig,
    state: Mutex<DiscoveryState>,
}

impl Discovery {
    /// Create a discovery manager over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: DiscoveryConfig) -> Self {
        Self {
            transport,
            config,
            state: Mutex::new(DiscoveryState::Idle),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DiscoveryState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(DiscoveryState::Idle)
    }

    /// Forget any discovered peer.
    pub fn reset(&self) {
        self.set_state(DiscoveryState::Idle);
    }

    fn set_state(&self, state: DiscoveryState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    /// Probe until a peer answers or the deadline passes.
    ///
    /// `DISCOVER` probes from other parties received meanwhile are answered.
    /// Frames from this host's own endpoint never count as an answer. Any
    /// other traffic is dropped.
    ///
    /// # Errors
    ///
    /// - [`DiscoveryError::UnsupportedTransport`] on a non-UDP transport
    /// - [`DiscoveryError::Timeout`] if nobody answered in time
    /// - [`DiscoveryError::Transport`] if the transport is closed
    pub async fn run(&self) -> Result<SocketAddr, DiscoveryError> {
        let kind = self.transport.kind();
        if kind != TransportKind::Udp {
            return Err(DiscoveryError::UnsupportedTransport(kind));
        }

        self.transport.refresh_local_addresses();
        self.set_state(DiscoveryState::Probing);
        let result = self.probe().await;
        match &result {
            Ok(peer) => {
                self.set_state(DiscoveryState::Discovered(*peer));
                tracing::info!("Discovered peer at {}", peer);
            }
            Err(e) => {
                self.set_state(DiscoveryState::Idle);
                tracing::debug!("Discovery failed: {}", e);
            }
        }
        result
    }

    async fn probe(&self) -> Result<SocketAddr, DiscoveryError> {
        let broadcast = PeerAddress::Udp(self.config.broadcast_addr);
        let deadline = Instant::now() + self.config.discover_timeout;
        let mut attempts = 0u32;
        let mut next_probe = Instant::now();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(DiscoveryError::Timeout { attempts });
            }

            if attempts < self.config.max_retries && now >= next_probe {
                match self
                    .transport
                    .send(DiscoveryMessage::Discover.as_bytes(), &broadcast)
                    .await
                {
                    Ok(_) => tracing::debug!("Sent DISCOVER to {}", broadcast),
                    Err(TransportError::Closed) => return Err(TransportError::Closed.into()),
                    Err(e) => tracing::warn!("DISCOVER send failed: {}", e),
                }
                attempts += 1;
                next_probe = now + self.config.retry_interval;
            }

            let wait_until = if attempts < self.config.max_retries {
                next_probe.min(deadline)
            } else {
                deadline
            };
            let wait = wait_until.saturating_duration_since(Instant::now());

            let (frame, from) = match self.transport.poll(wait).await {
                Ok(Some(received)) => received,
                Ok(None) => continue,
                Err(TransportError::Io(e)) => {
                    tracing::warn!("Receive error while probing: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if self.transport.is_own_address(&from) {
                tracing::trace!("Ignored own frame from {} while probing", from);
                continue;
            }

            match (DiscoveryMessage::parse(&frame), from) {
                (Some(DiscoveryMessage::Here), PeerAddress::Udp(addr)) => return Ok(addr),
                (Some(DiscoveryMessage::Discover), peer) => {
                    if let Err(e) = answer_discover(self.transport.as_ref(), &peer).await {
                        tracing::warn!("Could not answer DISCOVER from {}: {}", peer, e);
                    }
                }
                _ => tracing::trace!("Ignored {} bytes from {} while probing", frame.len(), from),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binlink_transport::UdpTransport;

    async fn loopback() -> Arc<UdpTransport> {
        Arc::new(
            UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
                .await
                .unwrap(),
        )
    }

    fn fast_config(target: SocketAddr) -> DiscoveryConfig {
        DiscoveryConfig {
            broadcast_addr: target,
            discover_timeout: Duration::from_millis(500),
            retry_interval: Duration::from_millis(50),
            max_retries: 5,
        }
    }

    #[test]
    fn test_message_parse() {
        assert_eq!(DiscoveryMessage::parse(b"DISCOVER"), Some(DiscoveryMessage::Discover));
        assert_eq!(DiscoveryMessage::parse(b"HERE\n"), Some(DiscoveryMessage::Here));
        assert_eq!(DiscoveryMessage::parse(b"HERE:extra"), None);
        assert_eq!(DiscoveryMessage::parse(b"{\"iv\":\"\"}"), None);
    }

    #[test]
    fn test_config_validate() {
        assert!(DiscoveryConfig::default().validate().is_ok());
        let config = DiscoveryConfig {
            max_retries: 0,
            ..DiscoveryConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(DiscoveryConfig::with_port(9999).broadcast_addr.port(), 9999);
    }

    #[tokio::test]
    async fn test_discovers_responding_peer() {
        let prober = loopback().await;
        let peer = loopback().await;
        let peer_addr = peer.local_addr();

        let responder = {
            let peer = peer.clone();
            tokio::spawn(async move {
                let (frame, from) = peer.poll(Duration::from_secs(2)).await.unwrap().unwrap();
                assert_eq!(DiscoveryMessage::parse(&frame), Some(DiscoveryMessage::Discover));
                answer_discover(peer.as_ref(), &from).await.unwrap();
            })
        };

        let discovery = Discovery::new(prober, fast_config(peer_addr));
        assert_eq!(discovery.state(), DiscoveryState::Idle);

        let found = discovery.run().await.unwrap();
        assert_eq!(found, peer_addr);
        assert_eq!(discovery.state(), DiscoveryState::Discovered(peer_addr));

        responder.await.unwrap();

        discovery.reset();
        assert_eq!(discovery.state(), DiscoveryState::Idle);
    }

    #[tokio::test]
    async fn test_times_out_without_peer() {
        let prober = loopback().await;
        let silent = loopback().await;

        let discovery = Discovery::new(
            prober,
            DiscoveryConfig {
                discover_timeout: Duration::from_millis(200),
                ..fast_config(silent.local_addr())
            },
        );

        match discovery.run().await {
            Err(DiscoveryError::Timeout { attempts }) => assert!((1..=5).contains(&attempts)),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(discovery.state(), DiscoveryState::Idle);
    }

    #[tokio::test]
    async fn test_probing_peer_answers_discover() {
        let prober = loopback().await;
        let other = loopback().await;
        let silent = loopback().await;

        let discovery = Discovery::new(
            prober.clone(),
            DiscoveryConfig {
                discover_timeout: Duration::from_millis(300),
                ..fast_config(silent.local_addr())
            },
        );

        let probing = tokio::spawn(async move { discovery.run().await });

        other
            .send(b"DISCOVER", &PeerAddress::Udp(prober.local_addr()))
            .await
            .unwrap();
        let (frame, from) = other.poll(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(frame, b"HERE");
        assert_eq!(from, PeerAddress::Udp(prober.local_addr()));

        assert!(probing.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_closed_transport_ends_discovery() {
        let prober = loopback().await;
        prober.close().await.unwrap();
        let discovery = Discovery::new(prober, fast_config("127.0.0.1:9".parse().unwrap()));
        assert!(matches!(
            discovery.run().await,
            Err(DiscoveryError::Transport(TransportError::Closed))
        ));
    }

    /// Hands every sent frame straight back as if it came from `own`,
    /// like a broadcast looping back to its sender.
    struct EchoTransport {
        own: SocketAddr,
        echo_tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
        echo_rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>>,
        sent: Mutex<Vec<Vec<u8>>>,
        refreshed: std::sync::atomic::AtomicBool,
    }

    impl EchoTransport {
        fn new(own: SocketAddr) -> Self {
            let (echo_tx, echo_rx) = tokio::sync::mpsc::unbounded_channel();
            Self {
                own,
                echo_tx,
                echo_rx: tokio::sync::Mutex::new(echo_rx),
                sent: Mutex::new(Vec::new()),
                refreshed: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for EchoTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Udp
        }

        async fn send(&self, buf: &[u8], _to: &PeerAddress) -> binlink_transport::TransportResult<usize> {
            self.sent.lock().unwrap().push(buf.to_vec());
            let _ = self.echo_tx.send(buf.to_vec());
            Ok(buf.len())
        }

        async fn poll(
            &self,
            wait: Duration,
        ) -> binlink_transport::TransportResult<Option<(Vec<u8>, PeerAddress)>> {
            let mut rx = self.echo_rx.lock().await;
            match tokio::time::timeout(wait, rx.recv()).await {
                Ok(Some(frame)) => Ok(Some((frame, PeerAddress::Udp(self.own)))),
                _ => Ok(None),
            }
        }

        async fn close(&self) -> binlink_transport::TransportResult<()> {
            Ok(())
        }

        fn is_closed(&self) -> bool {
            false
        }

        fn is_own_address(&self, addr: &PeerAddress) -> bool {
            *addr == PeerAddress::Udp(self.own)
        }

        fn refresh_local_addresses(&self) {
            self.refreshed.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn test_own_broadcast_is_not_a_peer() {
        // An isolated segment: the only thing answering is our own echo.
        let own: SocketAddr = "10.9.9.9:43764".parse().unwrap();
        let transport = Arc::new(EchoTransport::new(own));

        let discovery = Discovery::new(
            transport.clone(),
            DiscoveryConfig {
                discover_timeout: Duration::from_millis(200),
                ..fast_config(own)
            },
        );

        assert!(matches!(
            discovery.run().await,
            Err(DiscoveryError::Timeout { .. })
        ));
        assert!(transport.refreshed.load(std::sync::atomic::Ordering::Relaxed));

        // Our own DISCOVER was never answered.
        let sent = transport.sent.lock().unwrap();
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|frame| frame == b"DISCOVER"));
    }

    proptest::proptest! {
        #[test]
        fn prop_parse_only_accepts_discovery_tokens(frame in proptest::collection::vec(proptest::num::u8::ANY, 0..32)) {
            let trimmed = frame.trim_ascii();
            let parsed = DiscoveryMessage::parse(&frame);
            proptest::prop_assert_eq!(
                parsed.is_some(),
                trimmed == b"DISCOVER" || trimmed == b"HERE"
            );
        }
    }
}
