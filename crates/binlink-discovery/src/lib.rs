//! # BINLINK Discovery
//!
//! Locates the UDP peer of a link on the local segment.
//!
//! ```text
//!            DISCOVER (broadcast, every retry_interval)
//!   IDLE ──► PROBING ─────────────────────────────────────► (no HERE before
//!              │                                              discover_timeout)
//!              │ HERE from X                                   │
//!              ▼                                               ▼
//!          DISCOVERED(X)                                  Timeout error, IDLE
//! ```
//!
//! Every party answers `DISCOVER` with `HERE` to the observed sender,
//! whatever its own state, so two probing peers find each other.
//! Discovery messages are plain text; they are exchanged before any peer is
//! known and carry no secrets.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod manager;

pub use manager::{
    Discovery, DiscoveryConfig, DiscoveryError, DiscoveryMessage, DiscoveryState, answer_discover,
};
