//! # BINLINK Transport
//!
//! Byte transports for the BINLINK link layer.
//!
//! This crate provides:
//! - The [`Transport`] trait shared by every backend
//! - A newline-framed serial transport over any async byte stream
//! - A broadcast-capable UDP transport with self-talk suppression
//! - Enumeration of the host's interface addresses

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod interfaces;
pub mod serial;
pub mod transport;
pub mod udp;

pub use serial::SerialTransport;
pub use transport::{PeerAddress, Transport, TransportError, TransportKind, TransportResult, TransportStats};
pub use udp::UdpTransport;

/// Default UDP port shared by bins, relays and the hub
pub const DEFAULT_UDP_PORT: u16 = 8888;

/// Default serial line speed
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Largest datagram or serial frame accepted
pub const MAX_FRAME_SIZE: usize = 4096;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Enable SO_BROADCAST on UDP sockets
    pub broadcast: bool,
    /// Set SO_REUSEADDR so a relay and a test peer can share a host
    pub reuse_address: bool,
    /// Receive buffer size
    pub recv_buffer_size: usize,
    /// Send buffer size
    pub send_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            broadcast: true,
            reuse_address: true,
            recv_buffer_size: 256 * 1024,
            send_buffer_size: 256 * 1024,
        }
    }
}
