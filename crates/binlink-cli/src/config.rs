//! Configuration file for the BINLINK CLI.

use binlink_core::{CoreConfig, DeviceInfo, DiscoveryConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// BINLINK configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Keys and freshness
    #[serde(default)]
    pub security: SecurityConfig,
    /// Sockets and discovery
    #[serde(default)]
    pub network: NetworkConfig,
    /// Serial line
    #[serde(default)]
    pub serial: SerialConfig,
    /// Identity announced by a link
    #[serde(default)]
    pub device: DeviceConfig,
    /// Loop cadence and timeouts
    #[serde(default)]
    pub timing: TimingConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Keys and freshness
#[derive(Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Passphrase shared by every party on the link
    #[serde(default)]
    pub pre_shared_key: String,
    /// Accepted clock distance for envelopes, seconds
    #[serde(default = "default_replay_window_secs")]
    pub replay_window_secs: u64,
    /// Client session lifetime, seconds
    #[serde(default = "default_token_timeout_secs")]
    pub token_timeout_secs: u64,
}

/// Sockets and discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Hub listen address
    #[serde(default = "default_hub_addr")]
    pub hub_addr: String,
    /// Link socket address (port 0 picks one)
    #[serde(default = "default_link_addr")]
    pub link_addr: String,
    /// Where `DISCOVER` probes go
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: String,
    /// Give up discovery after this many seconds
    #[serde(default = "default_discover_timeout_secs")]
    pub discover_timeout_secs: u64,
    /// Maximum `DISCOVER` probes per attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Use UDP at all on a link
    #[serde(default = "default_true")]
    pub udp_enabled: bool,
}

/// Serial line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Line speed
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Identity announced by a link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable identity
    #[serde(default = "default_device_id")]
    pub device_id: String,
    /// Human-readable name
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Hardware class
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// Installation site
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Loop cadence and timeouts, all in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Link heartbeat cadence
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Hub `HEARTBEAT_REQUEST` cadence
    #[serde(default = "default_heartbeat_request_interval_secs")]
    pub heartbeat_request_interval_secs: u64,
    /// Idle time before a link re-selects its channel
    #[serde(default = "default_communication_timeout_secs")]
    pub communication_timeout_secs: u64,
    /// Silence from the peer before a link re-selects its channel
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
    /// Silence before the hub forgets a device
    #[serde(default = "default_device_timeout_secs")]
    pub device_timeout_secs: u64,
    /// Device and session sweep cadence
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_replay_window_secs() -> u64 {
    30
}

fn default_token_timeout_secs() -> u64 {
    300
}

fn default_hub_addr() -> String {
    format!("0.0.0.0:{}", binlink_transport::DEFAULT_UDP_PORT)
}

fn default_link_addr() -> String {
    "0.0.0.0:0".to_string()
}

fn default_broadcast_addr() -> String {
    format!("255.255.255.255:{}", binlink_transport::DEFAULT_UDP_PORT)
}

fn default_discover_timeout_secs() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    binlink_transport::DEFAULT_BAUD_RATE
}

fn default_device_id() -> String {
    "bin-001".to_string()
}

fn default_device_name() -> String {
    "Smart Bin".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_heartbeat_request_interval_secs() -> u64 {
    60
}

fn default_communication_timeout_secs() -> u64 {
    30
}

fn default_peer_timeout_secs() -> u64 {
    180
}

fn default_device_timeout_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            pre_shared_key: String::new(),
            replay_window_secs: default_replay_window_secs(),
            token_timeout_secs: default_token_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("pre_shared_key", &"[REDACTED]")
            .field("replay_window_secs", &self.replay_window_secs)
            .field("token_timeout_secs", &self.token_timeout_secs)
            .finish()
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hub_addr: default_hub_addr(),
            link_addr: default_link_addr(),
            broadcast_addr: default_broadcast_addr(),
            discover_timeout_secs: default_discover_timeout_secs(),
            max_retries: default_max_retries(),
            udp_enabled: true,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            device_name: default_device_name(),
            device_type: None,
            location: None,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_request_interval_secs: default_heartbeat_request_interval_secs(),
            communication_timeout_secs: default_communication_timeout_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
            device_timeout_secs: default_device_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("binlink/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Hub listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn hub_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.hub_addr.parse()?)
    }

    /// Link socket address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn link_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.link_addr.parse()?)
    }

    /// Identity a link announces.
    #[must_use]
    pub fn identity(&self) -> DeviceInfo {
        let mut info = DeviceInfo::new(&self.device.device_id, &self.device.device_name);
        info.device_type = self.device.device_type.clone();
        info.location = self.device.location.clone();
        info
    }

    /// Validate configuration
    ///
    /// The pre-shared key is checked separately by [`Config::to_core`] so
    /// that commands which never touch the link still work without one.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.hub_addr()?;
        self.link_addr()?;
        let _: SocketAddr = self.network.broadcast_addr.parse()?;

        if self.network.max_retries == 0 {
            anyhow::bail!("max_retries must be at least 1");
        }
        if !self.network.udp_enabled && self.serial.port.is_none() {
            anyhow::bail!("UDP disabled and no serial port configured");
        }
        if self.device.device_id.trim().is_empty() {
            anyhow::bail!("device_id must not be empty");
        }
        if self.serial.baud_rate == 0 {
            anyhow::bail!("baud_rate must be non-zero");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Convert into the link layer's configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the result does not validate, e.g. without a
    /// pre-shared key.
    pub fn to_core(&self) -> anyhow::Result<CoreConfig> {
        let mut core = CoreConfig::with_key(self.security.pre_shared_key.clone());
        core.security.replay_window = Duration::from_secs(self.security.replay_window_secs);
        core.security.token_timeout = Duration::from_secs(self.security.token_timeout_secs);

        core.discovery = DiscoveryConfig {
            broadcast_addr: self.network.broadcast_addr.parse()?,
            discover_timeout: Duration::from_secs(self.network.discover_timeout_secs),
            max_retries: self.network.max_retries,
            ..DiscoveryConfig::default()
        };

        let timing = &self.timing;
        core.channel.communication_timeout = Duration::from_secs(timing.communication_timeout_secs);
        core.channel.peer_timeout = Duration::from_secs(timing.peer_timeout_secs);
        core.registry.device_timeout = Duration::from_secs(timing.device_timeout_secs);
        core.registry.cleanup_interval = Duration::from_secs(timing.cleanup_interval_secs);
        core.service.heartbeat_interval = Duration::from_secs(timing.heartbeat_interval_secs);
        core.service.heartbeat_request_interval =
            Duration::from_secs(timing.heartbeat_request_interval_secs);

        core.validate()?;
        Ok(core)
    }
}
