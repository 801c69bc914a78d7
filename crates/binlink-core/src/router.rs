//! Command routing
//!
//! Decrypted messages have the form `PREFIX[:ARGS]`. The router splits on
//! the first `:` and looks the prefix up in two dispatch tables:
//!
//! ```text
//! "GET_STATUS:session_key=ab12"
//!        │
//!        ▼
//! ┌──────────────┐  hit   ┌──────────────────────────┐
//! │ public table │──────▶│ run handler               │
//! └──────┬───────┘        └──────────────────────────┘
//!        │ miss
//!        ▼
//! ┌──────────────┐  hit   ┌──────────────────────────┐ valid   ┌─────────────┐
//! │ auth table   │──────▶│ session check (client ip, │───────▶│ run handler │
//! └──────┬───────┘        │ session_key)              │        └─────────────┘
//!        │ miss           └────────────┬─────────────┘
//!        ▼                             │ invalid
//!   logged, ignored                    ▼
//!                                AUTH_REQUIRED
//! ```
//!
//! Handlers are plain async functions registered by whoever owns the
//! feature; the router keeps no state besides the two tables and counters.

use crate::error::{CoreError, Result};
use crate::session::SessionAuthenticator;
use binlink_transport::PeerAddress;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Separator between prefix and arguments
pub const PREFIX_DELIMITER: char = ':';

/// One routed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Prefix before the first `:`
    pub command: String,
    /// Everything after the first `:` (empty if none)
    pub args: String,
    /// Where the command came from
    pub from: PeerAddress,
}

impl Request {
    /// Split `message` into prefix and arguments.
    #[must_use]
    pub fn parse(message: &str, from: PeerAddress) -> Self {
        let message = message.trim();
        let (command, args) = message
            .split_once(PREFIX_DELIMITER)
            .unwrap_or((message, ""));
        Self {
            command: command.to_string(),
            args: args.to_string(),
            from,
        }
    }

    /// Source IP; the serial peer is reported as loopback.
    #[must_use]
    pub fn client_ip(&self) -> IpAddr {
        self.from
            .socket_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// Session key carried by the command.
    ///
    /// Accepted forms are a `session_key=<key>` argument or a
    /// `"session_key"` field in a JSON object payload.
    #[must_use]
    pub fn session_key(&self) -> Option<String> {
        let args = self.args.trim();
        if args.starts_with('{') {
            let value: serde_json::Value = serde_json::from_str(args).ok()?;
            return value
                .get("session_key")
                .and_then(|k| k.as_str())
                .map(str::to_string);
        }
        args.split(PREFIX_DELIMITER)
            .find_map(|part| part.trim().strip_prefix("session_key="))
            .map(str::to_string)
    }

    /// Parse the arguments as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Serialization`] if the payload does not parse.
    pub fn json_args<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.args)?)
    }
}

/// Future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Option<String>> + Send>>;

/// A registered command handler. Returns the reply to envelope and send
/// back, if any.
pub type Handler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

/// Wrap an async function as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// What routing did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handler ran and produced a reply
    Reply(String),
    /// Handler ran without a reply
    NoReply,
    /// Privileged command without a valid session
    AuthRequired,
    /// No handler for the prefix
    Unknown(String),
}

impl RouteOutcome {
    /// The error this outcome corresponds to, if any.
    #[must_use]
    pub fn error(&self) -> Option<CoreError> {
        match self {
            Self::AuthRequired => Some(CoreError::AuthRequired),
            Self::Unknown(prefix) => Some(CoreError::UnknownCommand(prefix.clone())),
            Self::Reply(_) | Self::NoReply => None,
        }
    }
}

/// Router counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Commands that reached a handler
    pub dispatched: u64,
    /// Privileged commands rejected for lack of a session
    pub auth_rejected: u64,
    /// Commands with no handler
    pub unknown: u64,
}

/// Two-table command router.
pub struct MessageRouter {
    public: DashMap<String, Handler>,
    authenticated: DashMap<String, Handler>,
    sessions: Arc<SessionAuthenticator>,
    dispatched: AtomicU64,
    auth_rejected: AtomicU64,
    unknown: AtomicU64,
}

impl MessageRouter {
    /// Create a router with empty tables.
    #[must_use]
    pub fn new(sessions: Arc<SessionAuthenticator>) -> Self {
        Self {
            public: DashMap::new(),
            authenticated: DashMap::new(),
            sessions,
            dispatched: AtomicU64::new(0),
            auth_rejected: AtomicU64::new(0),
            unknown: AtomicU64::new(0),
        }
    }

    /// Register `handler` for `prefix`.
    ///
    /// A later registration for the same prefix replaces the earlier one.
    pub fn register(&self, prefix: impl Into<String>, requires_auth: bool, handler: Handler) {
        let prefix = prefix.into();
        tracing::debug!("Registered handler {} (auth: {})", prefix, requires_auth);
        if requires_auth {
            self.public.remove(&prefix);
            self.authenticated.insert(prefix, handler);
        } else {
            self.authenticated.remove(&prefix);
            self.public.insert(prefix, handler);
        }
    }

    /// Whether a handler exists for `prefix`.
    #[must_use]
    pub fn handles(&self, prefix: &str) -> bool {
        self.public.contains_key(prefix) || self.authenticated.contains_key(prefix)
    }

    /// Route one decrypted message.
    pub async fn dispatch(&self, message: &str, from: PeerAddress) -> RouteOutcome {
        let request = Request::parse(message, from);

        // Clone the handler out so no map guard is held across the await.
        let public = self.public.get(&request.command).map(|h| Arc::clone(h.value()));
        let handler = match public {
            Some(handler) => handler,
            None => {
                let Some(handler) = self
                    .authenticated
                    .get(&request.command)
                    .map(|h| Arc::clone(h.value()))
                else {
                    self.unknown.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        "Unrecognised command from {}: {}",
                        request.from,
                        request.command
                    );
                    return RouteOutcome::Unknown(request.command);
                };

                let key = request.session_key();
                if !self.sessions.validate(request.client_ip(), key.as_deref()).await {
                    self.auth_rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "{} from {} rejected: no valid session",
                        request.command,
                        request.client_ip()
                    );
                    return RouteOutcome::AuthRequired;
                }
                handler
            }
        };

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Dispatching {} from {}", request.command, request.from);
        match handler(request).await {
            Some(reply) => RouteOutcome::Reply(reply),
            None => RouteOutcome::NoReply,
        }
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            auth_rejected: self.auth_rejected.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
        }
    }
}
