//! Event sink for connectivity callbacks.
//!
//! Managers report to an [`EventSink`] from their tick (never from a worker
//! thread). Three kinds of event are produced:
//!
//! - scan complete, with the success flag and the sorted device list
//! - state change, with the identity of the device/network involved
//! - status update, a small enumerated code plus signal bars for an icon
//!
//! [`LogSink`] reports every event through the `log` facade and is the
//! default sink when a caller does not supply one.

use crate::ble::BleState;
use crate::registry::ManagedDevice;
use crate::wifi::WifiState;
use log::{info, warn};
use std::fmt;

/// Which radio subsystem produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioKind {
    Ble,
    Wifi,
}

impl fmt::Display for RadioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ble => write!(f, "ble"),
            Self::Wifi => write!(f, "wifi"),
        }
    }
}

/// Status code for rendering a connectivity icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Disabled,
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Disconnected => "disconnected",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Signal bars (0..=4) for a link RSSI in dBm. Unknown strength is 0.
pub fn bars_from_rssi(rssi: Option<i16>) -> u8 {
    match rssi {
        None => 0,
        Some(r) if r >= -55 => 4,
        Some(r) if r >= -67 => 3,
        Some(r) if r >= -78 => 2,
        Some(r) if r >= -90 => 1,
        Some(_) => 0,
    }
}

/// Icon/status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub radio: RadioKind,
    pub code: StatusCode,
    /// Signal bars of the connected link, 0 unless connected.
    pub bars: u8,
}

/// Suppresses status updates that would not change what is rendered.
#[derive(Debug)]
pub(crate) struct StatusTracker {
    radio: RadioKind,
    last: Option<(StatusCode, u8)>,
}

impl StatusTracker {
    pub(crate) fn new(radio: RadioKind) -> Self {
        Self { radio, last: None }
    }

    /// Returns an update if `code` or `bars` differ from the last one emitted.
    pub(crate) fn update(&mut self, code: StatusCode, bars: u8) -> Option<StatusUpdate> {
        let bars = if code == StatusCode::Connected { bars.min(4) } else { 0 };
        if self.last == Some((code, bars)) {
            return None;
        }
        self.last = Some((code, bars));
        Some(StatusUpdate {
            radio: self.radio,
            code,
            bars,
        })
    }
}

/// New state of one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Ble(BleState),
    Wifi(WifiState),
}

impl ConnectionState {
    pub fn radio(&self) -> RadioKind {
        match self {
            Self::Ble(_) => RadioKind::Ble,
            Self::Wifi(_) => RadioKind::Wifi,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ble(s) => write!(f, "{:?}", s),
            Self::Wifi(s) => write!(f, "{:?}", s),
        }
    }
}

/// A state change reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub state: ConnectionState,
    /// BLE address, or SSID for Wi-Fi.
    pub address: String,
    pub name: String,
    pub service_uuid: Option<String>,
    /// Failure context for failed states.
    pub reason: Option<String>,
}

/// Consumer of connectivity events.
///
/// Called from the thread that ticks the managers. Implementations must not
/// call back into the manager that is reporting.
pub trait EventSink: Send + Sync {
    /// A scan finished. `devices` is in display order.
    fn on_scan_complete(&self, radio: RadioKind, success: bool, devices: &[ManagedDevice]);

    /// A manager changed state.
    fn on_state_change(&self, change: &StateChange);

    /// The rendered status of a radio changed.
    fn on_status(&self, _update: StatusUpdate) {}
}

/// Sink that logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn on_scan_complete(&self, radio: RadioKind, success: bool, devices: &[ManagedDevice]) {
        if success {
            info!("[{}] Scan complete: {} devices", radio, devices.len());
        } else {
            warn!("[{}] Scan failed", radio);
        }
    }

    fn on_state_change(&self, change: &StateChange) {
        let radio = change.state.radio();
        match &change.reason {
            Some(reason) => warn!(
                "[{}] {} {} ({})",
                radio, change.state, change.address, reason
            ),
            None => info!("[{}] {} {} {}", radio, change.state, change.address, change.name),
        }
    }

    fn on_status(&self, update: StatusUpdate) {
        info!("[{}] Status {} ({} bars)", update.radio, update.code, update.bars);
    }
}
