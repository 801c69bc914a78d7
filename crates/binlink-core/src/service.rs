//! Service orchestration
//!
//! A [`Service`] wires an [`Endpoint`] to the router and runs four tasks:
//!
//! ```text
//!             ┌──────────┐  Inbound   ┌───────────┐  reply  ┌──────────┐
//! endpoint ──►│ listener │──(mpsc)──►│ processor │────────►│ endpoint │
//!             └──────────┘            └───────────┘         └──────────┘
//!             ┌───────────┐  link: HEARTBEAT, idle check, re-select
//!             │ heartbeat │  hub:  HEARTBEAT_REQUEST to live devices
//!             └───────────┘
//!             ┌───────────┐
//!             │ cleanup   │  expired devices and sessions
//!             └───────────┘
//! ```
//!
//! `stop()` closes the transports first so a blocked read returns, then
//! signals shutdown and waits for the tasks.

use crate::channel::{ChannelManager, ChannelSnapshot};
use crate::config::CoreConfig;
use crate::endpoint::{Endpoint, HubEndpoint, Inbound};
use crate::error::{CoreError, Result};
use crate::handlers::{
    self, DEVICE_CONNECT, HEARTBEAT_REQUEST, announce_message, auth_required_reply,
    heartbeat_message,
};
use crate::registry::{DeviceInfo, DeviceRegistry, DeviceStats};
use crate::router::{Handler, MessageRouter, RouteOutcome, RouterStats};
use crate::session::SessionAuthenticator;
use binlink_crypto::EnvelopeKey;
use binlink_transport::{PeerAddress, Transport, TransportStats};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};

/// Which side of the link this service plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A bin or relay with one upstream peer
    Link,
    /// The central hub serving many devices
    Hub,
}

enum Side {
    Link {
        channel: Arc<ChannelManager>,
        identity: Arc<DeviceInfo>,
    },
    Hub,
}

/// Status snapshot for dashboards and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    /// Link or hub
    pub role: Role,
    /// Loops are running
    pub running: bool,
    /// Channel state
    pub channel: ChannelSnapshot,
    /// Registered devices (hub)
    pub devices: DeviceStats,
    /// Live authenticated client sessions
    pub active_sessions: usize,
    /// Per-transport counters
    pub transports: Vec<TransportStats>,
    /// Router counters
    pub router: RouterStats,
    /// Inbound messages handled
    pub messages_processed: u64,
    /// Seconds since start
    pub uptime_secs: u64,
}

struct ServiceInner {
    config: CoreConfig,
    role: Role,
    side: Side,
    endpoint: Arc<dyn Endpoint>,
    router: MessageRouter,
    sessions: Arc<SessionAuthenticator>,
    registry: Arc<DeviceRegistry>,
    running: AtomicBool,
    // Set by `stop`, which closes the transports for good.
    stopped: AtomicBool,
    messages_processed: AtomicU64,
    started_at: Instant,
}

/// A running (or startable) link or hub.
pub struct Service {
    inner: Arc<ServiceInner>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    fn build(config: CoreConfig, role: Role, side: Side, endpoint: Arc<dyn Endpoint>) -> Result<Self> {
        config.validate()?;

        let key = EnvelopeKey::from_passphrase(&config.security.pre_shared_key);
        let sessions = Arc::new(SessionAuthenticator::new(key, config.security.token_timeout));
        let registry = Arc::new(DeviceRegistry::new(config.registry.device_timeout));
        let router = MessageRouter::new(Arc::clone(&sessions));

        handlers::register_auth_handlers(&router, &sessions);
        match &side {
            Side::Link { identity, .. } => handlers::register_link_handlers(&router, identity),
            Side::Hub => handlers::register_hub_handlers(&router, &registry),
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                role,
                side,
                endpoint,
                router,
                sessions,
                registry,
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                messages_processed: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// A link speaking for `identity` over `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if `config` does not validate.
    pub fn link(config: CoreConfig, channel: ChannelManager, identity: DeviceInfo) -> Result<Self> {
        let channel = Arc::new(channel);
        let endpoint: Arc<dyn Endpoint> = Arc::clone(&channel) as Arc<dyn Endpoint>;
        let side = Side::Link {
            channel,
            identity: Arc::new(identity),
        };
        Self::build(config, Role::Link, side, endpoint)
    }

    /// A hub serving devices over `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if `config` does not validate.
    pub fn hub(config: CoreConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let endpoint = Arc::new(HubEndpoint::new(
            transport,
            EnvelopeKey::from_passphrase(&config.security.pre_shared_key),
            config.security.replay_window,
        ));
        Self::build(config, Role::Hub, Side::Hub, endpoint)
    }

    /// Link or hub.
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Whether the loops are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register a feature command.
    ///
    /// Privileged commands (`requires_auth`) only run with a valid client
    /// session; otherwise the sender gets `AUTH_REQUIRED`.
    pub fn register_handler(&self, prefix: impl Into<String>, requires_auth: bool, handler: Handler) {
        self.inner.router.register(prefix, requires_auth, handler);
    }

    /// Device registry (populated on a hub).
    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    /// Client sessions.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionAuthenticator> {
        &self.inner.sessions
    }

    /// Start the four loops.
    ///
    /// A service runs once: `stop` closes its transports, so build a new
    /// one to restart.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidState`] if already running or stopped.
    pub async fn start(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(CoreError::invalid_state("service was stopped"));
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::invalid_state("service already running"));
        }
        self.shutdown.send_replace(false);

        let (queue_tx, queue_rx) = mpsc::channel(self.inner.config.service.queue_capacity);
        let inner = &self.inner;
        let tasks = vec![
            tokio::spawn(Arc::clone(inner).listener_loop(queue_tx, self.shutdown.subscribe())),
            tokio::spawn(Arc::clone(inner).processor_loop(queue_rx)),
            tokio::spawn(Arc::clone(inner).heartbeat_loop(self.shutdown.subscribe())),
            tokio::spawn(Arc::clone(inner).cleanup_loop(self.shutdown.subscribe())),
        ];
        self.tasks.lock().await.extend(tasks);

        tracing::info!("{:?} service started", self.inner.role);
        Ok(())
    }

    /// Stop the loops and close the transports.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidState`] if not running.
    pub async fn stop(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::invalid_state("service not running"));
        }

        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.endpoint.close().await;
        self.shutdown.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Service task ended abnormally: {}", e);
            }
        }

        tracing::info!("{:?} service stopped", self.inner.role);
        Ok(())
    }

    /// Send an application message to the link's peer.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidState`] on a hub, or
    /// [`CoreError::ChannelUnavailable`] without a synchronized channel.
    pub async fn send(&self, message: &str) -> Result<()> {
        match &self.inner.side {
            Side::Link { channel, .. } => channel.send(message).await,
            Side::Hub => Err(CoreError::invalid_state("hub has no single peer")),
        }
    }

    /// Send to one connected device.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RegistryMiss`] if the device is unknown or not
    /// connected, or the send error.
    pub async fn send_to_device(&self, device_id: &str, message: &str) -> Result<()> {
        let record = self
            .inner
            .registry
            .get(device_id)
            .await
            .filter(|r| r.connected && r.is_live(Instant::now(), self.inner.registry.device_timeout()))
            .ok_or_else(|| CoreError::RegistryMiss(device_id.to_string()))?;

        self.inner
            .endpoint
            .send_to(message, &PeerAddress::Udp(record.address))
            .await
    }

    /// Send to every connected device.
    ///
    /// Returns how many sends succeeded.
    pub async fn broadcast_to_devices(&self, message: &str) -> usize {
        self.inner.broadcast_to_devices(message).await
    }

    /// Snapshot for dashboards.
    pub async fn status(&self) -> ServiceStatus {
        let inner = &self.inner;
        ServiceStatus {
            role: inner.role,
            running: self.is_running(),
            channel: inner.endpoint.channel(),
            devices: inner.registry.stats().await,
            active_sessions: inner.sessions.active_sessions().await,
            transports: inner.endpoint.transport_stats(),
            router: inner.router.stats(),
            messages_processed: inner.messages_processed.load(Ordering::Relaxed),
            uptime_secs: inner.started_at.elapsed().as_secs(),
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        // Loops exit on their next iteration; transports close with the
        // last reference.
        self.shutdown.send_replace(true);
    }
}

impl ServiceInner {
    async fn broadcast_to_devices(&self, message: &str) -> usize {
        let mut delivered = 0;
        for record in self.registry.connected_devices().await {
            if !record.connected {
                continue;
            }
            match self
                .endpoint
                .send_to(message, &PeerAddress::Udp(record.address))
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("Send to {} failed: {}", record.info.device_id, e),
            }
        }
        delivered
    }

    async fn listener_loop(
        self: Arc<Self>,
        queue: mpsc::Sender<Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let poll_interval = self.config.service.poll_interval;
        tracing::debug!("Listener started");

        while !*shutdown.borrow() {
            match self.endpoint.recv(poll_interval).await {
                Ok(Some(inbound)) => {
                    if let Err(e) = queue.try_send(inbound) {
                        tracing::warn!("Inbound queue full, dropped message: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!("Receive error: {}", e);
                    // Avoid spinning on a dead transport.
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        tracing::debug!("Listener stopped");
    }

    async fn processor_loop(self: Arc<Self>, mut queue: mpsc::Receiver<Inbound>) {
        tracing::debug!("Processor started");
        // Ends once the listener drops its sender.
        while let Some(inbound) = queue.recv().await {
            self.process(inbound).await;
        }
        tracing::debug!("Processor stopped");
    }

    async fn process(&self, inbound: Inbound) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        let Inbound { message, from } = inbound;

        let timeout = self.config.service.handler_timeout;
        let outcome = match tokio::time::timeout(timeout, self.router.dispatch(&message, from)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!("Handler for message from {} timed out after {:?}", from, timeout);
                return;
            }
        };

        let reply = match outcome {
            RouteOutcome::Reply(reply) => reply,
            RouteOutcome::AuthRequired => auth_required_reply(),
            RouteOutcome::NoReply | RouteOutcome::Unknown(_) => return,
        };
        if let Err(e) = self.endpoint.send_to(&reply, &from).await {
            tracing::warn!("Could not reply to {}: {}", from, e);
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = match self.role {
            Role::Link => self.config.service.heartbeat_interval,
            Role::Hub => self.config.service.heartbeat_request_interval,
        };
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!("Heartbeat loop started ({:?})", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            match &self.side {
                Side::Link { channel, identity } => {
                    self.maintain_link(channel, identity, &mut shutdown).await;
                }
                Side::Hub => {
                    let sent = self.broadcast_to_devices(HEARTBEAT_REQUEST).await;
                    tracing::debug!("HEARTBEAT_REQUEST sent to {} devices", sent);
                }
            }
        }
        tracing::debug!("Heartbeat loop stopped");
    }

    async fn maintain_link(
        &self,
        channel: &ChannelManager,
        identity: &DeviceInfo,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        channel.check_idle();

        if channel.is_synchronized() {
            if let Err(e) = channel.send(&heartbeat_message(identity)).await {
                tracing::warn!("Heartbeat failed: {}", e);
            }
            return;
        }

        loop {
            match channel.select().await {
                Ok(kind) => {
                    tracing::info!("Channel selected: {}", kind);
                    if let Err(e) = channel.send(&announce_message(DEVICE_CONNECT, identity)).await {
                        tracing::warn!("Could not announce device: {}", e);
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!("Channel selection failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.channel.retry_backoff) => {}
                        _ = shutdown.changed() => return,
                    }
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.registry.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            let devices = self.registry.cleanup().await;
            let sessions = self.sessions.cleanup().await;
            if devices > 0 || sessions > 0 {
                tracing::info!(
                    "Cleanup removed {} devices and {} sessions",
                    devices,
                    sessions
                );
            }
        }
        tracing::debug!("Cleanup loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::seal_frame;
    use crate::router::{Request, handler_fn};
    use binlink_transport::UdpTransport;
    use std::net::SocketAddr;
    use std::time::Duration;

    async fn loopback() -> Arc<UdpTransport> {
        Arc::new(
            UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
                .await
                .unwrap(),
        )
    }

    fn key() -> EnvelopeKey {
        EnvelopeKey::from_passphrase("K")
    }

    async fn expect_reply(device: &UdpTransport) -> String {
        let (frame, from) = device.poll(Duration::from_secs(2)).await.unwrap().unwrap();
        crate::endpoint::open_frame(&frame, &key(), 30, &from).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let transport = loopback().await;
        assert!(matches!(
            Service::hub(CoreConfig::default(), transport),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_start_stop_state() {
        let hub = Service::hub(CoreConfig::with_key("K"), loopback().await).unwrap();
        assert!(hub.stop().await.is_err());

        hub.start().await.unwrap();
        assert!(hub.is_running());
        assert!(hub.start().await.is_err());

        hub.stop().await.unwrap();
        assert!(!hub.is_running());
    }

    #[tokio::test]
    async fn test_restart_after_stop_rejected() {
        let transport = loopback().await;
        let hub = Service::hub(CoreConfig::with_key("K"), transport.clone()).unwrap();

        hub.start().await.unwrap();
        hub.stop().await.unwrap();
        assert!(transport.is_closed());

        assert!(matches!(hub.start().await, Err(CoreError::InvalidState(_))));
        assert!(!hub.is_running());
        assert!(hub.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_hub_registers_device_and_replies() {
        let hub_socket = loopback().await;
        let hub_addr = PeerAddress::Udp(hub_socket.local_addr());
        let hub = Service::hub(CoreConfig::with_key("K"), hub_socket).unwrap();
        hub.start().await.unwrap();

        let device = loopback().await;
        device
            .send(
                &seal_frame(r#"DEVICE_CONNECT:{"device_id":"D1","device_name":"Bin-1"}"#, &key())
                    .unwrap(),
                &hub_addr,
            )
            .await
            .unwrap();

        assert_eq!(expect_reply(&device).await, "SERVER_ONLINE");
        assert!(hub.registry().get("D1").await.is_some());

        hub.send_to_device("D1", "GET_STATUS").await.unwrap();
        assert_eq!(expect_reply(&device).await, "GET_STATUS");
        assert_eq!(hub.broadcast_to_devices("HEARTBEAT_REQUEST").await, 1);
        assert!(matches!(
            hub.send_to_device("ghost", "x").await,
            Err(CoreError::RegistryMiss(_))
        ));

        let status = hub.status().await;
        assert_eq!(status.role, Role::Hub);
        assert_eq!(status.devices.total_devices, 1);
        assert_eq!(status.messages_processed, 1);

        hub.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_privileged_command_answers_auth_required() {
        let hub_socket = loopback().await;
        let hub_addr = PeerAddress::Udp(hub_socket.local_addr());
        let hub = Service::hub(CoreConfig::with_key("K"), hub_socket).unwrap();
        hub.register_handler(
            "GET_STATUS",
            true,
            handler_fn(|_req: Request| async { Some("STATUS:OK".to_string()) }),
        );
        hub.start().await.unwrap();

        let client = loopback().await;
        client
            .send(&seal_frame("GET_STATUS", &key()).unwrap(), &hub_addr)
            .await
            .unwrap();

        let reply: serde_json::Value =
            serde_json::from_str(&expect_reply(&client).await).unwrap();
        assert_eq!(reply["status"], "AUTH_REQUIRED");
        hub.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_handler_is_abandoned() {
        let hub_socket = loopback().await;
        let hub_addr = PeerAddress::Udp(hub_socket.local_addr());
        let mut config = CoreConfig::with_key("K");
        config.service.handler_timeout = Duration::from_millis(50);
        let hub = Service::hub(config, hub_socket).unwrap();
        hub.register_handler(
            "SLOW",
            false,
            handler_fn(|_req: Request| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Some("late".to_string())
            }),
        );
        hub.register_handler(
            "FAST",
            false,
            handler_fn(|_req: Request| async { Some("fast".to_string()) }),
        );
        hub.start().await.unwrap();

        let client = loopback().await;
        for message in ["SLOW", "FAST"] {
            client
                .send(&seal_frame(message, &key()).unwrap(), &hub_addr)
                .await
                .unwrap();
        }
        assert_eq!(expect_reply(&client).await, "fast");
        hub.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_link_send_without_channel() {
        let config = CoreConfig::with_key("K");
        let channel = ChannelManager::new(&config);
        let link = Service::link(config, channel, DeviceInfo::new("D1", "Bin-1")).unwrap();
        assert_eq!(link.role(), Role::Link);
        assert!(matches!(
            link.send("HEARTBEAT").await,
            Err(CoreError::ChannelUnavailable(_))
        ));
        assert_eq!(link.status().await.channel.kind, crate::ChannelKind::None);
    }
}
