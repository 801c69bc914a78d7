//! Broadcast UDP transport.
//!
//! The socket is bound with `SO_BROADCAST` so discovery can reach every host
//! on the segment. A broadcast is also delivered back to the sender, so
//! [`Transport::poll`] drops datagrams whose source is this socket's own
//! address (any local interface address combined with the bound port).
//! The interface list is read at bind time and re-read before discovery.

use crate::transport::{
    PeerAddress, StatsCounters, Transport, TransportError, TransportKind, TransportResult,
    TransportStats,
};
use crate::{MAX_FRAME_SIZE, TransportConfig};
use async_trait::async_trait;
use crate::interfaces::local_addresses;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// Async UDP transport using Tokio.
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    local_ips: Arc<RwLock<Vec<IpAddr>>>,
    closed: Arc<AtomicBool>,
    stats: Arc<StatsCounters>,
}

impl UdpTransport {
    /// Bind with the default [`TransportConfig`].
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be set up
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        Self::bind_with_config(addr, &TransportConfig::default()).await
    }

    /// Bind to `addr` with explicit socket options.
    ///
    /// # Arguments
    /// * `addr` - The local address to bind to. Use "0.0.0.0:0" for automatic port selection.
    /// * `config` - Socket options
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be set up
    pub async fn bind_with_config<A: Into<SocketAddr>>(
        addr: A,
        config: &TransportConfig,
    ) -> TransportResult<Self> {
        let addr = addr.into();

        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let bind_err = |e: std::io::Error| TransportError::BindFailed(format!("{addr}: {e}"));

        let socket2 =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(bind_err)?;

        if config.broadcast && addr.is_ipv4() {
            socket2.set_broadcast(true).map_err(bind_err)?;
        }
        if config.reuse_address {
            socket2.set_reuse_address(true).map_err(bind_err)?;
        }
        socket2
            .set_recv_buffer_size(config.recv_buffer_size)
            .map_err(bind_err)?;
        socket2
            .set_send_buffer_size(config.send_buffer_size)
            .map_err(bind_err)?;

        socket2.bind(&addr.into()).map_err(bind_err)?;

        socket2.set_nonblocking(true).map_err(bind_err)?;
        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = UdpSocket::from_std(std_socket).map_err(bind_err)?;
        let local_addr = socket.local_addr().map_err(bind_err)?;

        let local_ips = own_ips(local_addr);

        tracing::debug!("UDP transport bound to {} (local ips {:?})", local_addr, local_ips);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            local_ips: Arc::new(RwLock::new(local_ips)),
            closed: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StatsCounters::default()),
        })
    }

    /// The bound local address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether `from` is this socket talking to itself.
    #[must_use]
    pub fn is_self(&self, from: &SocketAddr) -> bool {
        from.port() == self.local_addr.port()
            && self
                .local_ips
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains(&from.ip())
    }

    /// Re-read the interface list, picking up addresses added since bind.
    pub fn refresh_local_ips(&self) {
        let ips = own_ips(self.local_addr);
        tracing::trace!("UDP local ips refreshed: {:?}", ips);
        *self
            .local_ips
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = ips;
    }
}

fn own_ips(local_addr: SocketAddr) -> Vec<IpAddr> {
    let mut ips = local_addresses();
    if !local_addr.ip().is_unspecified() && !ips.contains(&local_addr.ip()) {
        ips.push(local_addr.ip());
    }
    ips
}

/// Best-effort detection of the host's outward-facing IPv4 address.
///
/// Connects an unbound UDP socket towards a public address without sending
/// anything and reads back the source address the kernel picked.
#[must_use]
pub fn detect_local_ip() -> Option<IpAddr> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    probe.connect("8.8.8.8:80").ok()?;
    let ip = probe.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    async fn send(&self, buf: &[u8], to: &PeerAddress) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let PeerAddress::Udp(addr) = to else {
            return Err(TransportError::InvalidDestination(*to));
        };
        if buf.len() > MAX_FRAME_SIZE {
            return Err(TransportError::InvalidFrame(format!(
                "{} bytes exceeds {}",
                buf.len(),
                MAX_FRAME_SIZE
            )));
        }

        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.stats.record_send(sent);
                tracing::trace!("UDP sent {} bytes to {}", sent, addr);
                Ok(sent)
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(TransportError::Io(e))
            }
        }
    }

    async fn poll(&self, wait: Duration) -> TransportResult<Option<(Vec<u8>, PeerAddress)>> {
        let deadline = Instant::now() + wait;
        let mut buf = vec![0u8; MAX_FRAME_SIZE];

        loop {
            if self.closed.load(Ordering::Relaxed) {
                return Err(TransportError::Closed);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let (size, from) =
                match tokio::time::timeout(remaining, self.socket.recv_from(&mut buf)).await {
                    Err(_) => return Ok(None),
                    Ok(Err(e)) => {
                        self.stats.record_recv_error();
                        return Err(TransportError::Io(e));
                    }
                    Ok(Ok(received)) => received,
                };

            if self.is_self(&from) {
                self.stats.record_self_drop();
                tracing::trace!("Dropped own datagram from {}", from);
                if remaining.is_zero() {
                    return Ok(None);
                }
                continue;
            }

            self.stats.record_recv(size);
            return Ok(Some((buf[..size].to_vec(), PeerAddress::Udp(from))));
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    fn is_own_address(&self, addr: &PeerAddress) -> bool {
        matches!(addr, PeerAddress::Udp(from) if self.is_self(from))
    }

    fn refresh_local_addresses(&self) {
        self.refresh_local_ips();
    }
}
