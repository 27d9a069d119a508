//! Wi-Fi manager states and deferred operations.

use crate::events::StatusCode;
use crate::persistence::SavedNetwork;

/// State of the Wi-Fi connectivity manager.
///
/// ```text
/// Disabled -> Enabling -> Disconnected -> {Scanning, Connecting} -> Connected
///                          Connecting -> ConnectionFailed -> Disconnected
///                          any -> Disabling -> Disabled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WifiState {
    Disabled,
    /// Waiting to start the driver while BLE holds the radio.
    Enabling,
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    /// Lasts until the next tick, which moves to `Disconnected`.
    ConnectionFailed,
    /// Waiting for an in-flight worker before stopping the driver.
    Disabling,
}

impl WifiState {
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::Disabled | Self::Disabling => StatusCode::Disabled,
            Self::Enabling | Self::Disconnected => StatusCode::Disconnected,
            Self::Scanning => StatusCode::Scanning,
            Self::Connecting => StatusCode::Connecting,
            Self::Connected => StatusCode::Connected,
            Self::ConnectionFailed => StatusCode::Failed,
        }
    }

    /// Whether the driver is up and accepting requests.
    pub fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled | Self::Enabling | Self::Disabling)
    }
}

/// A requested radio operation not yet running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOperation {
    Scan {
        /// Connect to the strongest saved network afterwards.
        auto_connect: bool,
    },
    Connect {
        network: SavedNetwork,
        /// Save the credentials once the link is up.
        save: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(WifiState::ConnectionFailed.status_code(), StatusCode::Failed);
        assert_eq!(WifiState::Enabling.status_code(), StatusCode::Disconnected);
        assert_eq!(WifiState::Disabling.status_code(), StatusCode::Disabled);
    }

    #[test]
    fn test_is_enabled() {
        assert!(!WifiState::Enabling.is_enabled());
        assert!(WifiState::Disconnected.is_enabled());
        assert!(WifiState::ConnectionFailed.is_enabled());
    }
}
