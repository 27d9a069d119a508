//! Radiolink ESP32 connectivity library.
//!
//! BLE and Wi-Fi connection managers sharing one radio. Each manager runs
//! its own scan/connect/auto-reconnect state machine on a polled tick;
//! blocking radio calls run on worker threads, and the two managers
//! arbitrate radio access through each other's busy flag.
//!
//! Everything except the ESP-IDF platform adapters (feature `esp32`) builds
//! and is tested on the host.

pub mod arbiter;
pub mod ble;
pub mod config;
pub mod console;
pub mod coordinator;
pub mod events;
pub mod persistence;
pub(crate) mod reconnect;
pub mod registry;
#[cfg(not(target_os = "espidf"))]
pub mod sim;
pub mod wifi;
pub(crate) mod worker;

// Re-export commonly used items
pub use arbiter::{NoPeer, RadioActivity, RadioArbiter};
pub use ble::{BleManager, BleState};
pub use config::{BleManagerConfig, ConfigError, CoordinatorConfig, WifiManagerConfig};
pub use coordinator::RadioCoordinator;
pub use events::{
    bars_from_rssi, ConnectionState, EventSink, LogSink, RadioKind, StateChange, StatusCode,
    StatusUpdate,
};
pub use persistence::{
    PairedDevice, PairedDeviceStore, PersistenceError, SavedNetwork, SavedNetworkStore,
};
pub use registry::{DeviceRegistry, ManagedDevice, PrimaryId};
pub use wifi::{WifiManager, WifiState};
