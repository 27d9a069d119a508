//! Connectivity manager tunables.
//!
//! Durations are stored as milliseconds so the structs serialize cleanly and
//! stay `Copy`; accessor methods hand out [`Duration`]s.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest scan or timeout accepted by [`validate`](BleManagerConfig::validate) (10 minutes).
const MAX_DURATION_MS: u64 = 600_000;

/// Errors from configuration validation or loading.
#[derive(Debug)]
pub enum ConfigError {
    /// Invalid configuration parameter.
    Invalid(&'static str),
    /// Configuration file could not be read.
    Io(std::io::Error),
    /// Configuration file could not be parsed.
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "invalid config: {}", msg),
            Self::Io(e) => write!(f, "config I/O error: {}", e),
            Self::Parse(msg) => write!(f, "config parse error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

fn check_duration(ms: u64, zero_msg: &'static str, max_msg: &'static str) -> Result<(), ConfigError> {
    if ms == 0 {
        return Err(ConfigError::Invalid(zero_msg));
    }
    if ms > MAX_DURATION_MS {
        return Err(ConfigError::Invalid(max_msg));
    }
    Ok(())
}

/// Configuration for the BLE connectivity manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleManagerConfig {
    /// Scan duration used when the caller does not pick one.
    pub scan_duration_ms: u64,
    /// Duration of the pre-connect scan run when a target address is stale.
    pub short_scan_duration_ms: u64,
    /// Duration of the reconnect-oriented scan scheduled by `enable(true)`.
    pub auto_scan_duration_ms: u64,
    /// Wall-clock limit for a connect attempt, enforced by the manager tick.
    pub connect_timeout_ms: u64,
    /// How long to wait for the platform disconnect notification.
    pub disconnect_timeout_ms: u64,
    /// A device not seen by a scan within this window has a stale address.
    pub stale_address_ms: u64,
    /// Minimum time in `Disconnected` between auto-reconnect attempts.
    pub reconnect_interval_ms: u64,
    /// Whether auto-reconnect to the last connected device is active.
    pub auto_reconnect: bool,
    /// Capacity of the bounded scan-hit channel.
    pub scan_channel_capacity: usize,
    /// How long a scan worker waits on a full channel before dropping a hit.
    pub backpressure_timeout_ms: u64,
    /// Upper bound on scan hits merged per tick, keeping the tick short.
    pub max_hits_per_tick: usize,
    /// Maximum number of paired device records.
    pub max_paired_devices: usize,
    /// Key devices by their primary service UUID instead of their address.
    ///
    /// Useful for peripherals that rotate their random address.
    pub key_by_service_uuid: bool,
}

impl Default for BleManagerConfig {
    fn default() -> Self {
        Self {
            scan_duration_ms: 5_000,
            short_scan_duration_ms: 1_500,
            auto_scan_duration_ms: 5_000,
            connect_timeout_ms: 10_000,
            disconnect_timeout_ms: 3_000,
            stale_address_ms: 60_000,
            reconnect_interval_ms: 30_000,
            auto_reconnect: true,
            scan_channel_capacity: 32,
            backpressure_timeout_ms: 5,
            max_hits_per_tick: 16,
            max_paired_devices: 8,
            key_by_service_uuid: false,
        }
    }
}

impl BleManagerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_duration(
            self.scan_duration_ms,
            "scan_duration_ms must be > 0",
            "scan_duration_ms must be <= 600000",
        )?;
        check_duration(
            self.short_scan_duration_ms,
            "short_scan_duration_ms must be > 0",
            "short_scan_duration_ms must be <= 600000",
        )?;
        check_duration(
            self.auto_scan_duration_ms,
            "auto_scan_duration_ms must be > 0",
            "auto_scan_duration_ms must be <= 600000",
        )?;
        check_duration(
            self.connect_timeout_ms,
            "connect_timeout_ms must be > 0",
            "connect_timeout_ms must be <= 600000",
        )?;
        check_duration(
            self.disconnect_timeout_ms,
            "disconnect_timeout_ms must be > 0",
            "disconnect_timeout_ms must be <= 600000",
        )?;
        if self.connect_timeout_ms < self.short_scan_duration_ms {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms must be >= short_scan_duration_ms",
            ));
        }
        if self.reconnect_interval_ms == 0 {
            return Err(ConfigError::Invalid("reconnect_interval_ms must be > 0"));
        }
        if self.scan_channel_capacity == 0 {
            return Err(ConfigError::Invalid("scan_channel_capacity must be > 0"));
        }
        if self.max_hits_per_tick == 0 {
            return Err(ConfigError::Invalid("max_hits_per_tick must be > 0"));
        }
        if self.max_paired_devices == 0 {
            return Err(ConfigError::Invalid("max_paired_devices must be > 0"));
        }
        Ok(())
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    pub fn short_scan_duration(&self) -> Duration {
        Duration::from_millis(self.short_scan_duration_ms)
    }

    pub fn auto_scan_duration(&self) -> Duration {
        Duration::from_millis(self.auto_scan_duration_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn stale_address_after(&self) -> Duration {
        Duration::from_millis(self.stale_address_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }
}

/// Configuration for the Wi-Fi connectivity manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiManagerConfig {
    /// Wall-clock limit for a scan before it is reported as failed.
    pub scan_timeout_ms: u64,
    /// Wall-clock limit for a connect attempt, enforced by the manager tick.
    pub connect_timeout_ms: u64,
    /// How long to wait for the platform disconnect notification.
    pub disconnect_timeout_ms: u64,
    /// Minimum time in `Disconnected` between auto-reconnect attempts.
    pub reconnect_interval_ms: u64,
    /// Whether auto-reconnect to saved networks is active.
    pub auto_reconnect: bool,
    /// Capacity of the bounded scan-hit channel.
    pub scan_channel_capacity: usize,
    /// How long the scan worker waits on a full channel before dropping a network.
    pub backpressure_timeout_ms: u64,
    /// Upper bound on scan results merged per tick.
    pub max_hits_per_tick: usize,
    /// Maximum number of saved network records.
    pub max_saved_networks: usize,
    /// Run a scan-and-auto-connect as soon as the radio is enabled.
    pub auto_connect_on_enable: bool,
}

impl Default for WifiManagerConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 15_000,
            disconnect_timeout_ms: 3_000,
            reconnect_interval_ms: 60_000,
            auto_reconnect: true,
            scan_channel_capacity: 32,
            backpressure_timeout_ms: 20,
            max_hits_per_tick: 16,
            max_saved_networks: 8,
            auto_connect_on_enable: true,
        }
    }
}

impl WifiManagerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_duration(
            self.scan_timeout_ms,
            "scan_timeout_ms must be > 0",
            "scan_timeout_ms must be <= 600000",
        )?;
        check_duration(
            self.connect_timeout_ms,
            "connect_timeout_ms must be > 0",
            "connect_timeout_ms must be <= 600000",
        )?;
        check_duration(
            self.disconnect_timeout_ms,
            "disconnect_timeout_ms must be > 0",
            "disconnect_timeout_ms must be <= 600000",
        )?;
        if self.reconnect_interval_ms == 0 {
            return Err(ConfigError::Invalid("reconnect_interval_ms must be > 0"));
        }
        if self.scan_channel_capacity == 0 {
            return Err(ConfigError::Invalid("scan_channel_capacity must be > 0"));
        }
        if self.max_hits_per_tick == 0 {
            return Err(ConfigError::Invalid("max_hits_per_tick must be > 0"));
        }
        if self.max_saved_networks == 0 {
            return Err(ConfigError::Invalid("max_saved_networks must be > 0"));
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }
}

/// Configuration for the coordinator and its polled main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub ble: BleManagerConfig,
    pub wifi: WifiManagerConfig,
    /// Main-loop polling interval.
    pub tick_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ble: BleManagerConfig::default(),
            wifi: WifiManagerConfig::default(),
            tick_interval_ms: 20,
        }
    }
}

impl CoordinatorConfig {
    /// Validate both manager configs and the tick interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ble.validate()?;
        self.wifi.validate()?;
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be > 0"));
        }
        if self.tick_interval_ms > 1_000 {
            return Err(ConfigError::Invalid("tick_interval_ms must be <= 1000"));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Parse and validate a JSON configuration.
    #[cfg(not(target_os = "espidf"))]
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults.
    #[cfg(not(target_os = "espidf"))]
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config file at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}
