//! BLE connectivity.
//!
//! This module provides:
//! - [`BleManager`]: scan/connect/auto-reconnect state machine
//! - [`BleRadio`]: boundary to the platform BLE stack
//! - [`NimbleRadio`]: NimBLE implementation (ESP32 only)

mod manager;
mod platform;
mod state;
mod worker;

#[cfg(feature = "esp32")]
mod esp32;

pub use manager::BleManager;
pub use platform::{
    Advertisement, BleRadio, BleRadioError, ConnectInfo, ConnectTarget, LinkEvent,
};
pub use state::{BleState, PendingOperation, ScanPurpose};

#[cfg(feature = "esp32")]
pub use esp32::NimbleRadio;
