//! Transport trait abstraction for the serial and UDP backends.
//!
//! The link layer above only ever sees opaque byte frames and a
//! [`PeerAddress`]. Serial links have a single implicit destination; UDP
//! destinations are discovered at runtime or are the broadcast address.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// The other end of a stream went away
    #[error("Transport disconnected")]
    Disconnected,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Serial port could not be opened
    #[error("Failed to open serial port: {0}")]
    OpenFailed(String),

    /// Destination does not belong to this transport
    #[error("Invalid destination {0} for this transport")]
    InvalidDestination(PeerAddress),

    /// Frame cannot be sent as-is
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Which backend a transport is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Point-to-point serial line
    Serial,
    /// Broadcast-capable UDP socket
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => f.write_str("serial"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Where a frame comes from or goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerAddress {
    /// The far end of the serial line
    Serial,
    /// A UDP endpoint (unicast or broadcast)
    Udp(SocketAddr),
}

impl PeerAddress {
    /// UDP socket address, if any.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Serial => None,
            Self::Udp(addr) => Some(*addr),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => f.write_str("serial"),
            Self::Udp(addr) => write!(f, "udp://{addr}"),
        }
    }
}

/// Async transport trait for link communication.
///
/// Implementations are shared behind `Arc<dyn Transport>` between the
/// listener loop and senders, so every method takes `&self`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> TransportKind;

    /// Send one frame.
    ///
    /// # Arguments
    /// * `buf` - The frame to send
    /// * `to` - The destination
    ///
    /// # Returns
    /// The number of payload bytes sent
    ///
    /// # Errors
    /// Returns `TransportError` if the transport is closed, the destination
    /// does not fit the backend, or the underlying write fails
    async fn send(&self, buf: &[u8], to: &PeerAddress) -> TransportResult<usize>;

    /// Wait at most `wait` for one frame.
    ///
    /// A zero `wait` checks for an already-available frame without blocking.
    /// Returns `Ok(None)` when nothing arrived in time.
    ///
    /// # Errors
    /// Returns `TransportError` if the transport is closed or the read fails
    async fn poll(&self, wait: Duration) -> TransportResult<Option<(Vec<u8>, PeerAddress)>>;

    /// Close the transport.
    ///
    /// After calling this method, all subsequent operations
    /// return `TransportError::Closed`.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }

    /// Whether `addr` is this transport's own endpoint.
    fn is_own_address(&self, _addr: &PeerAddress) -> bool {
        false
    }

    /// Re-read the host's local addresses used for self-talk suppression.
    fn refresh_local_addresses(&self) {}
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total frames sent
    pub packets_sent: u64,
    /// Total frames received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
    /// Frames dropped because they came from this host
    pub self_dropped: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lock-free counters behind [`TransportStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
    self_dropped: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_self_drop(&self) {
        self.self_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            self_dropped: self.self_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counters() {
        let counters = StatsCounters::default();
        assert_eq!(counters.snapshot(), TransportStats::new());

        counters.record_send(100);
        counters.record_recv(200);
        counters.record_send_error();
        counters.record_recv_error();
        counters.record_self_drop();

        let stats = counters.snapshot();
        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_received, 200);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.send_errors, 1);
        assert_eq!(stats.recv_errors, 1);
        assert_eq!(stats.self_dropped, 1);
    }

    #[test]
    fn test_stats_accumulate() {
        let counters = StatsCounters::default();
        for i in 1..=10 {
            counters.record_send(100);
            let stats = counters.snapshot();
            assert_eq!(stats.packets_sent, i);
            assert_eq!(stats.bytes_sent, i * 100);
        }
    }

    #[test]
    fn test_peer_address_display() {
        let addr: SocketAddr = "10.0.0.5:8888".parse().unwrap();
        assert_eq!(PeerAddress::Udp(addr).to_string(), "udp://10.0.0.5:8888");
        assert_eq!(PeerAddress::Serial.to_string(), "serial");
        assert_eq!(PeerAddress::Udp(addr).socket_addr(), Some(addr));
        assert_eq!(PeerAddress::Serial.socket_addr(), None);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "Transport is closed");

        let err = TransportError::InvalidDestination(PeerAddress::Serial);
        assert!(err.to_string().contains("serial"));

        let err = TransportError::BindFailed("test".to_string());
        assert!(err.to_string().contains("Failed to bind"));
    }

    #[test]
    fn test_transport_error_from_io() {
        let io_err = std::io::Error::other("test");
        let transport_err = TransportError::from(io_err);

        assert!(matches!(transport_err, TransportError::Io(_)));
    }
}
