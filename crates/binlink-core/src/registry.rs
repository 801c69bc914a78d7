//! Hub-side device registry
//!
//! Tracks every bin that has announced itself and when it was last heard
//! from. Records are upserted by `device_id`, refreshed by heartbeats and
//! evicted by a periodic sweep once they have been silent for longer than
//! the device timeout.
//!
//! All operations go through one lock, so a reader never sees a record
//! halfway through an update.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// What a device reports about itself in `DEVICE_*` messages.
///
/// Fields the hub does not interpret are kept in `extra` and reported back
/// unchanged in the dashboard statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable identity
    pub device_id: String,

    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    /// Hardware class, e.g. `ESP32`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,

    /// Where the bin is installed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Everything else the device sent
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DeviceInfo {
    /// Minimal info with only an identity and a name.
    #[must_use]
    pub fn new(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: Some(device_name.into()),
            device_type: None,
            location: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Name for log lines.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.device_name.as_deref().unwrap_or("Unknown")
    }
}

/// One known device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// Last reported info
    pub info: DeviceInfo,
    /// Where its traffic last came from
    pub address: SocketAddr,
    /// Last registration or heartbeat
    pub last_seen: Instant,
    /// Last (re)registration
    pub connected_at: Instant,
    /// Cleared by an explicit disconnect
    pub connected: bool,
    /// Registrations plus heartbeats
    pub heartbeat_count: u64,
}

impl DeviceRecord {
    /// Source IP of the device.
    #[must_use]
    pub fn ip_address(&self) -> IpAddr {
        self.address.ip()
    }

    /// Whether the device has been heard from within `timeout` of `now`.
    #[must_use]
    pub fn is_live(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) < timeout
    }
}

/// Per-device line of [`DeviceStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    /// Stable identity
    pub device_id: String,
    /// Name, `Unknown` if never reported
    pub device_name: String,
    /// Type, `Unknown` if never reported
    pub device_type: String,
    /// Location, `Unknown` if never reported
    pub location: String,
    /// Source IP
    pub ip_address: IpAddr,
    /// Heard from within the device timeout
    pub connected: bool,
    /// Seconds since the last registration or heartbeat
    pub last_seen_secs: u64,
    /// Seconds since the last (re)registration
    pub connection_duration_secs: u64,
    /// Registrations plus heartbeats
    pub heartbeat_count: u64,
}

/// Registry snapshot for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStats {
    /// Known devices
    pub total_devices: usize,
    /// Devices heard from within the device timeout
    pub connected_devices: usize,
    /// `total_devices - connected_devices`
    pub disconnected_devices: usize,
    /// One entry per device, ordered by id
    pub device_list: Vec<DeviceSummary>,
}

/// Device registry.
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceRecord>>,
    device_timeout: Duration,
}

impl DeviceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(device_timeout: Duration) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            device_timeout,
        }
    }

    /// Silence after which a device counts as gone.
    #[must_use]
    pub fn device_timeout(&self) -> Duration {
        self.device_timeout
    }

    /// Register or refresh a device.
    ///
    /// Returns `true` if the device was not known before.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Serialization`] if `device_id` is empty.
    pub async fn register(&self, info: DeviceInfo, address: SocketAddr) -> Result<bool> {
        if info.device_id.trim().is_empty() {
            return Err(CoreError::Serialization("device_id is missing".into()));
        }

        let now = Instant::now();
        let mut devices = self.devices.lock().await;
        let previous_count = devices
            .get(&info.device_id)
            .map(|r| r.heartbeat_count)
            .unwrap_or(0);
        let is_new = !devices.contains_key(&info.device_id);

        if is_new {
            tracing::info!(
                "New device registered: {} ({}) from {}",
                info.display_name(),
                info.device_id,
                address
            );
        } else {
            tracing::info!(
                "Device updated: {} ({}) from {}",
                info.display_name(),
                info.device_id,
                address
            );
        }

        devices.insert(
            info.device_id.clone(),
            DeviceRecord {
                info,
                address,
                last_seen: now,
                connected_at: now,
                connected: true,
                heartbeat_count: previous_count + 1,
            },
        );

        Ok(is_new)
    }

    /// Record a heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RegistryMiss`] for an unknown device; nothing is
    /// changed in that case.
    pub async fn heartbeat(&self, device_id: &str) -> Result<()> {
        let mut devices = self.devices.lock().await;
        match devices.get_mut(device_id) {
            Some(record) => {
                record.last_seen = Instant::now();
                record.heartbeat_count += 1;
                record.connected = true;
                tracing::debug!("Heartbeat from {}", device_id);
                Ok(())
            }
            None => {
                tracing::warn!("Heartbeat from unregistered device: {}", device_id);
                Err(CoreError::RegistryMiss(device_id.to_string()))
            }
        }
    }

    /// Look up one device.
    pub async fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.lock().await.get(device_id).cloned()
    }

    /// All known devices, ordered by id.
    pub async fn all_devices(&self) -> Vec<DeviceRecord> {
        let devices = self.devices.lock().await;
        let mut all: Vec<_> = devices.values().cloned().collect();
        all.sort_by(|a, b| a.info.device_id.cmp(&b.info.device_id));
        all
    }

    /// Devices heard from within the device timeout, ordered by id.
    pub async fn connected_devices(&self) -> Vec<DeviceRecord> {
        let now = Instant::now();
        let devices = self.devices.lock().await;
        let mut live: Vec<_> = devices
            .values()
            .filter(|r| r.is_live(now, self.device_timeout))
            .cloned()
            .collect();
        live.sort_by(|a, b| a.info.device_id.cmp(&b.info.device_id));
        live
    }

    /// Mark a device as disconnected without forgetting it.
    pub async fn disconnect(&self, device_id: &str) -> bool {
        let mut devices = self.devices.lock().await;
        match devices.get_mut(device_id) {
            Some(record) => {
                record.connected = false;
                tracing::info!("Device disconnected: {}", device_id);
                true
            }
            None => false,
        }
    }

    /// Forget a device.
    pub async fn remove(&self, device_id: &str) -> bool {
        let mut devices = self.devices.lock().await;
        match devices.remove(device_id) {
            Some(record) => {
                tracing::info!(
                    "Device removed: {} ({})",
                    record.info.display_name(),
                    device_id
                );
                true
            }
            None => false,
        }
    }

    /// Evict devices silent for longer than the device timeout.
    ///
    /// Returns the number of devices evicted.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut devices = self.devices.lock().await;
        let before = devices.len();

        devices.retain(|device_id, record| {
            let keep = now.saturating_duration_since(record.last_seen) <= self.device_timeout;
            if !keep {
                tracing::info!(
                    "Expired device removed: {} ({})",
                    record.info.display_name(),
                    device_id
                );
            }
            keep
        });

        before - devices.len()
    }

    /// Number of known devices.
    pub async fn len(&self) -> usize {
        self.devices.lock().await.len()
    }

    /// Whether no device is known.
    pub async fn is_empty(&self) -> bool {
        self.devices.lock().await.is_empty()
    }

    /// Snapshot for the dashboard.
    pub async fn stats(&self) -> DeviceStats {
        let now = Instant::now();
        let devices = self.all_devices().await;
        let unknown = || "Unknown".to_string();

        let device_list: Vec<DeviceSummary> = devices
            .into_iter()
            .map(|r| DeviceSummary {
                connected: r.is_live(now, self.device_timeout),
                ip_address: r.ip_address(),
                last_seen_secs: now.saturating_duration_since(r.last_seen).as_secs(),
                connection_duration_secs: now.saturating_duration_since(r.connected_at).as_secs(),
                heartbeat_count: r.heartbeat_count,
                device_name: r.info.device_name.clone().unwrap_or_else(unknown),
                device_type: r.info.device_type.clone().unwrap_or_else(unknown),
                location: r.info.location.clone().unwrap_or_else(unknown),
                device_id: r.info.device_id,
            })
            .collect();

        let connected = device_list.iter().filter(|d| d.connected).count();
        DeviceStats {
            total_devices: device_list.len(),
            connected_devices: connected,
            disconnected_devices: device_list.len() - connected,
            device_list,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin_address() -> SocketAddr {
        "10.0.0.5:8888".parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = DeviceRegistry::new(Duration::from_secs(300));

        assert!(registry.register(DeviceInfo::new("D1", "Bin-1"), bin_address()).await.unwrap());
        assert!(!registry.register(DeviceInfo::new("D1", "Bin-1"), bin_address()).await.unwrap());

        assert_eq!(registry.len().await, 1);
        let record = registry.get("D1").await.unwrap();
        assert_eq!(record.heartbeat_count, 2);
    }

    #[tokio::test]
    async fn test_register_updates_address() {
        let registry = DeviceRegistry::new(Duration::from_secs(300));
        registry.register(DeviceInfo::new("D1", "Bin-1"), bin_address()).await.unwrap();

        let moved: SocketAddr = "10.0.0.77:8888".parse().unwrap();
        let mut info = DeviceInfo::new("D1", "Bin-1 (kitchen)");
        info.location = Some("kitchen".into());
        registry.register(info, moved).await.unwrap();

        let record = registry.get("D1").await.unwrap();
        assert_eq!(record.address, moved);
        assert_eq!(record.info.location.as_deref(), Some("kitchen"));
        assert_eq!(record.info.display_name(), "Bin-1 (kitchen)");
    }

    #[tokio::test]
    async fn test_register_requires_id() {
        let registry = DeviceRegistry::new(Duration::from_secs(300));
        let result = registry.register(DeviceInfo::new("", "nameless"), bin_address()).await;
        assert!(matches!(result, Err(CoreError::Serialization(_))));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_device_is_noop() {
        let registry = DeviceRegistry::new(Duration::from_secs(300));
        let result = registry.heartbeat("ghost").await;
        assert!(matches!(result, Err(CoreError::RegistryMiss(_))));
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_device_connected() {
        let registry = DeviceRegistry::new(Duration::from_secs(300));
        registry.register(DeviceInfo::new("D1", "Bin-1"), bin_address()).await.unwrap();

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(90)).await;
            registry.heartbeat("D1").await.unwrap();
        }

        assert_eq!(registry.connected_devices().await.len(), 1);
        assert_eq!(registry.cleanup().await, 0);
        assert_eq!(registry.get("D1").await.unwrap().heartbeat_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_evicted() {
        let registry = DeviceRegistry::new(Duration::from_secs(300));
        registry.register(DeviceInfo::new("D1", "Bin-1"), bin_address()).await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;

        assert!(registry.connected_devices().await.is_empty());
        assert_eq!(registry.cleanup().await, 1);
        assert!(registry.get("D1").await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_and_remove() {
        let registry = DeviceRegistry::new(Duration::from_secs(300));
        registry.register(DeviceInfo::new("D1", "Bin-1"), bin_address()).await.unwrap();

        assert!(registry.disconnect("D1").await);
        assert!(!registry.get("D1").await.unwrap().connected);
        registry.heartbeat("D1").await.unwrap();
        assert!(registry.get("D1").await.unwrap().connected);

        assert!(registry.remove("D1").await);
        assert!(!registry.remove("D1").await);
        assert!(!registry.disconnect("D1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats() {
        let registry = DeviceRegistry::new(Duration::from_secs(300));
        registry.register(DeviceInfo::new("D1", "Bin-1"), bin_address()).await.unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        registry
            .register(DeviceInfo::new("D2", "Bin-2"), "10.0.0.6:8888".parse().unwrap())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(150)).await;

        let stats = registry.stats().await;
        assert_eq!(stats.total_devices, 2);
        assert_eq!(stats.connected_devices, 1);
        assert_eq!(stats.disconnected_devices, 1);
        assert_eq!(stats.device_list[0].device_id, "D1");
        assert!(!stats.device_list[0].connected);
        assert_eq!(stats.device_list[0].last_seen_secs, 350);
        assert_eq!(stats.device_list[1].device_type, "Unknown");
        assert!(stats.device_list[1].connected);
    }

    #[test]
    fn test_device_info_keeps_extra_fields() {
        let info: DeviceInfo = serde_json::from_str(
            r#"{"device_id":"D1","device_name":"Bin-1","firmware":"1.2.0","sensors":2}"#,
        )
        .unwrap();
        assert_eq!(info.device_id, "D1");
        assert_eq!(info.extra["firmware"], "1.2.0");

        let back = serde_json::to_value(&info).unwrap();
        assert_eq!(back["sensors"], 2);
        assert!(back.get("location").is_none());
    }
}
