//! Manager configuration.
//!
//! Tunables for the BLE and Wi-Fi connectivity managers and for the polled
//! main loop that drives them. All types are `Copy`, have sane defaults and
//! can be validated before a manager is constructed.
//!
//! # Components
//!
//! - [`BleManagerConfig`] - BLE scan/connect timing and registry capacity
//! - [`WifiManagerConfig`] - Wi-Fi scan/connect timing and saved-network capacity
//! - [`CoordinatorConfig`] - both of the above plus the main-loop tick interval
//!
//! On host builds the coordinator config can be read from a JSON file, with
//! missing fields falling back to defaults.

mod radio;

pub use radio::{BleManagerConfig, ConfigError, CoordinatorConfig, WifiManagerConfig};
