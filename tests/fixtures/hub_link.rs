//! Hub plus one link on loopback
//!
//! The link's discovery probes go straight to the hub's socket instead of
//! the broadcast address, so tests run without broadcast routing.
//!
//! # Example
//!
//! ```no_run
//! use binlink_integration_tests::fixtures::HubLinkFixture;
//!
//! # async fn demo() {
//! let fixture = HubLinkFixture::start("K").await.unwrap();
//! fixture.wait_for_device("D1").await;
//! fixture.stop().await;
//! # }
//! ```

use binlink_core::{ChannelManager, CoreConfig, CoreError, DeviceInfo, DiscoveryConfig, Service};
use binlink_transport::UdpTransport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Bind a UDP transport on an ephemeral loopback port.
pub async fn loopback() -> Arc<UdpTransport> {
    Arc::new(
        UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("bind loopback"),
    )
}

/// Configuration with short timers, probing `target` directly.
pub fn fast_config(key: &str, target: SocketAddr) -> CoreConfig {
    let mut config = CoreConfig::with_key(key);
    config.discovery = DiscoveryConfig {
        broadcast_addr: target,
        discover_timeout: Duration::from_millis(500),
        retry_interval: Duration::from_millis(50),
        max_retries: 5,
    };
    config.channel.handshake_timeout = Duration::from_millis(500);
    config.channel.retry_backoff = Duration::from_millis(100);
    config.service.heartbeat_interval = Duration::from_millis(200);
    config.service.heartbeat_request_interval = Duration::from_millis(200);
    config
}

/// Poll until `hub` knows `device_id`, up to five seconds.
pub async fn wait_for_device(hub: &Service, device_id: &str) -> bool {
    for _ in 0..100 {
        if hub.registry().get(device_id).await.is_some() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// A running hub and a running link pointed at it.
pub struct HubLinkFixture {
    /// Hub service
    pub hub: Service,
    /// Link service, identity `D1` / `Bin-1`
    pub link: Service,
    /// Hub socket address
    pub hub_addr: SocketAddr,
}

impl HubLinkFixture {
    /// Start both sides with pre-shared key `key`.
    ///
    /// # Errors
    ///
    /// Returns the first service construction or start error.
    pub async fn start(key: &str) -> Result<Self, CoreError> {
        let hub_socket = loopback().await;
        let hub_addr = hub_socket.local_addr();
        let hub = Service::hub(fast_config(key, hub_addr), hub_socket)?;
        hub.start().await?;

        let config = fast_config(key, hub_addr);
        let channel = ChannelManager::new(&config).with_udp(loopback().await, &config);
        let link = Service::link(config, channel, DeviceInfo::new("D1", "Bin-1"))?;
        link.start().await?;

        Ok(Self {
            hub,
            link,
            hub_addr,
        })
    }

    /// Poll until the hub knows `device_id`, up to five seconds.
    pub async fn wait_for_device(&self, device_id: &str) -> bool {
        wait_for_device(&self.hub, device_id).await
    }

    /// Stop both services.
    pub async fn stop(&self) {
        let _ = self.link.stop().await;
        let _ = self.hub.stop().await;
    }
}
