//! Composition root for the two connectivity managers.
//!
//! [`RadioCoordinator`] builds the BLE and Wi-Fi managers, hands each the
//! other's busy flag as its peer arbiter, and ticks both from one polled
//! main loop.

use crate::ble::{BleManager, BleRadio, BleState};
use crate::config::{ConfigError, CoordinatorConfig};
use crate::events::EventSink;
use crate::persistence::{PairedDeviceStore, SavedNetworkStore};
use crate::wifi::{WifiManager, WifiRadio, WifiState};
use log::info;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Both managers, wired for arbitration.
pub struct RadioCoordinator {
    config: CoordinatorConfig,
    ble: BleManager,
    wifi: WifiManager,
}

impl RadioCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        ble_radio: Arc<dyn BleRadio>,
        wifi_radio: Arc<dyn WifiRadio>,
        paired_store: Box<dyn PairedDeviceStore>,
        network_store: Box<dyn SavedNetworkStore>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut ble = BleManager::new(config.ble, ble_radio, paired_store, sink.clone())?;
        let mut wifi = WifiManager::new(config.wifi, wifi_radio, network_store, sink)?;
        ble.set_peer(wifi.arbiter());
        wifi.set_peer(ble.arbiter());
        info!(
            "Radio coordinator ready (tick every {:?})",
            config.tick_interval()
        );
        Ok(Self { config, ble, wifi })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn ble(&self) -> &BleManager {
        &self.ble
    }

    pub fn ble_mut(&mut self) -> &mut BleManager {
        &mut self.ble
    }

    pub fn wifi(&self) -> &WifiManager {
        &self.wifi
    }

    pub fn wifi_mut(&mut self) -> &mut WifiManager {
        &mut self.wifi
    }

    /// Current state of both managers.
    pub fn states(&self) -> (BleState, WifiState) {
        (self.ble.state(), self.wifi.state())
    }

    /// Whether either radio has a scan or connect in flight.
    pub fn is_busy(&self) -> bool {
        self.ble.is_busy() || self.wifi.is_busy()
    }

    /// How often [`tick`](Self::tick) should be called.
    pub fn tick_interval(&self) -> Duration {
        self.config.tick_interval()
    }

    /// Tick both managers. Never blocks.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&mut self, now: Instant) {
        self.ble.tick_at(now);
        self.wifi.tick_at(now);
    }

    /// Disable both managers.
    pub fn shutdown(&mut self) {
        info!("Radio coordinator shutting down");
        self.ble.disable();
        self.wifi.disable();
    }
}
