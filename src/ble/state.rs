//! BLE manager states and deferred operations.

use crate::events::StatusCode;
use crate::registry::PrimaryId;
use std::time::Duration;

/// State of the BLE connectivity manager.
///
/// ```text
/// Disabled -> Disconnected -> {ScanPending, Scanning, Connecting} -> Connected
///                                  Scanning/Connecting -> Failed -> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BleState {
    Disabled,
    Disconnected,
    /// A scan is waiting for the Wi-Fi radio to go idle.
    ScanPending,
    Scanning,
    Connecting,
    Connected,
    /// Lasts until the next tick, which moves to `Disconnected`.
    Failed,
}

impl BleState {
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::Disabled => StatusCode::Disabled,
            Self::Disconnected => StatusCode::Disconnected,
            Self::ScanPending | Self::Scanning => StatusCode::Scanning,
            Self::Connecting => StatusCode::Connecting,
            Self::Connected => StatusCode::Connected,
            Self::Failed => StatusCode::Failed,
        }
    }
}

/// Why a scan was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPurpose {
    /// Caller-visible scan; completion fires `on_scan_complete`.
    General {
        /// Connect to the strongest paired device afterwards.
        auto_connect: bool,
    },
    /// Short scan refreshing a stale address before connecting to `target`.
    /// Invisible to callers.
    ShortConnect { target: PrimaryId },
}

/// A requested radio operation not yet running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOperation {
    Scan {
        duration: Duration,
        purpose: ScanPurpose,
    },
    Connect {
        target: PrimaryId,
    },
}
