//! # BINLINK Core
//!
//! Link layer between smart bins, their relay hosts and the central hub.
//!
//! This crate provides:
//! - Channel selection with serial-first, UDP-fallback failover
//! - Client sessions (challenge/response, per-IP, fixed lifetime)
//! - The hub's device registry with liveness eviction
//! - Prefix routing with public and authenticated command tables
//! - A [`Service`] running the listener, processor, heartbeat and cleanup loops
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Service                               │
//! │   (listener → processor, heartbeat, cleanup)                    │
//! ├───────────────────────────────┬─────────────────────────────────┤
//! │        MessageRouter          │  DeviceRegistry │ Sessions      │
//! │   (prefix → handler)          │  (hub)          │ (clients)     │
//! ├───────────────────────────────┴─────────────────────────────────┤
//! │                          Endpoint                               │
//! │   ChannelManager (link: one peer)  │  HubEndpoint (many peers)  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │            Envelope (binlink-crypto) over Transport              │
//! │                 serial lines │ UDP broadcast                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod service;
pub mod session;

pub use channel::{ChannelKind, ChannelManager, ChannelSnapshot};
pub use config::{
    ChannelConfig, CoreConfig, RegistryConfig, SecurityConfig, ServiceConfig,
};
pub use endpoint::{Endpoint, HubEndpoint, Inbound};
pub use error::{CoreError, Result};
pub use registry::{DeviceInfo, DeviceRecord, DeviceRegistry, DeviceStats, DeviceSummary};
pub use router::{Handler, MessageRouter, Request, RouteOutcome, RouterStats, handler_fn};
pub use service::{Role, Service, ServiceStatus};
pub use session::{ClientInfo, ClientSession, SessionAuthenticator};

pub use binlink_discovery::DiscoveryConfig;
