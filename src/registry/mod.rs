//! Device registry shared by the connectivity managers and UI-side readers.
//!
//! This module provides:
//! - [`PrimaryId`]: key for devices (BLE address / service UUID) and networks (SSID)
//! - [`ManagedDevice`]: merged persisted + scanned view of one device
//! - [`DeviceRegistry`]: lock-guarded map with merge-by-id semantics

mod device;
mod table;

pub use device::{
    bounded, display_order, ManagedDevice, PrimaryId, ScanHit, MAX_ID_LEN, MAX_NAME_LEN,
};
pub use table::{DeviceRegistry, MergeResult, PersistedEntry};
