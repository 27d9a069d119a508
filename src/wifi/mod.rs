//! Wi-Fi station connectivity.
//!
//! # Components
//!
//! - [`WifiManager`] - tick-driven state machine over saved networks
//! - [`WifiRadio`] - driver boundary, implemented by the simulator on host
//!   and by [`EspWifiRadio`] on ESP32

mod manager;
mod platform;
mod state;
mod worker;

#[cfg(feature = "esp32")]
mod esp32;

pub use manager::WifiManager;
pub use platform::{AccessPoint, LinkEvent, LinkInfo, WifiRadio, WifiRadioError};
pub use state::{PendingOperation, WifiState};

#[cfg(feature = "esp32")]
pub use esp32::EspWifiRadio;
