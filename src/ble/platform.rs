//! Boundary to the platform BLE stack.
//!
//! The manager drives the radio only through [`BleRadio`]. Calls block; the
//! manager makes scan and connect calls from worker threads and the rest
//! from its own thread. Implementations: the NimBLE adapter (feature
//! `esp32`) and the simulated radio in [`crate::sim`].

use crate::registry::{bounded, PrimaryId, ScanHit, MAX_ID_LEN, MAX_NAME_LEN};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Errors reported by a BLE platform stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleRadioError {
    /// The stack has not been initialised.
    NotInitialized,
    /// The stack refused the request.
    Rejected(String),
    /// The platform call timed out.
    Timeout,
    /// The target did not respond.
    NotFound,
    /// Raw platform error code.
    Platform(i32),
}

impl std::fmt::Display for BleRadioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "BLE stack not initialised"),
            Self::Rejected(msg) => write!(f, "request rejected: {}", msg),
            Self::Timeout => write!(f, "platform timeout"),
            Self::NotFound => write!(f, "device not found"),
            Self::Platform(code) => write!(f, "platform error {}", code),
        }
    }
}

impl std::error::Error for BleRadioError {}

/// One advertisement report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    /// First advertised service UUID.
    pub service_uuid: Option<String>,
    pub rssi: i16,
}

impl Advertisement {
    /// Convert to a bounded scan hit, keying by service UUID when requested
    /// and available.
    pub(crate) fn into_hit(self, key_by_service_uuid: bool) -> ScanHit {
        let address = bounded(&self.address.to_ascii_lowercase(), MAX_ID_LEN);
        let service_uuid = self
            .service_uuid
            .map(|u| bounded(&u.to_ascii_lowercase(), MAX_ID_LEN));
        let id = match (&service_uuid, key_by_service_uuid) {
            (Some(uuid), true) => PrimaryId::service_uuid(uuid),
            _ => PrimaryId::address(&address),
        };
        ScanHit {
            id,
            name: self.name.map(|n| bounded(&n, MAX_NAME_LEN)),
            address,
            service_uuid,
            rssi: self.rssi,
        }
    }
}

/// What the manager asks the platform to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub id: PrimaryId,
    pub address: String,
    pub name: String,
    pub service_uuid: Option<String>,
}

/// Identity of an established link, as resolved by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    pub address: String,
    pub name: String,
    pub service_uuid: Option<String>,
    pub rssi: Option<i16>,
}

/// Asynchronous notification from the platform stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link to `address` went down. `reason` is set for remote/link loss.
    Disconnected {
        address: String,
        reason: Option<String>,
    },
    /// Fresh RSSI of the current link.
    Rssi(i16),
}

/// Platform BLE stack.
pub trait BleRadio: Send + Sync {
    /// Bring the stack up. Called lazily before the first scan or connect.
    fn init(&self) -> Result<(), BleRadioError>;

    /// Tear the stack down.
    fn deinit(&self) -> Result<(), BleRadioError>;

    /// Scan for `duration`, reporting each advertisement to `on_advert`.
    ///
    /// Returns early once `cancel` fires.
    fn scan(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
        on_advert: &mut dyn FnMut(Advertisement),
    ) -> Result<(), BleRadioError>;

    /// Connect to `target`, blocking until the link is up or the attempt fails.
    fn connect(&self, target: &ConnectTarget, timeout: Duration) -> Result<ConnectInfo, BleRadioError>;

    /// Request disconnection of the link to `address`.
    ///
    /// Completion is reported later as [`LinkEvent::Disconnected`].
    fn disconnect(&self, address: &str) -> Result<(), BleRadioError>;

    /// Next pending link event, if any. Must not block.
    fn poll_link_event(&self) -> Option<LinkEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_hit_keys() {
        let adv = Advertisement {
            address: "AA:BB:CC:DD:EE:FF".into(),
            name: Some("Sensor".into()),
            service_uuid: Some("0000180D-0000-1000-8000-00805F9B34FB".into()),
            rssi: -50,
        };
        let by_addr = adv.clone().into_hit(false);
        assert_eq!(by_addr.id.as_str(), "aa:bb:cc:dd:ee:ff");
        let by_uuid = adv.into_hit(true);
        assert_eq!(by_uuid.id.as_str(), "0000180d-0000-1000-8000-00805f9b34fb");
        assert_eq!(by_uuid.address, "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_into_hit_falls_back_to_address() {
        let adv = Advertisement {
            address: "aa:bb:cc:dd:ee:01".into(),
            name: Some("A very long advertised device name beyond limits".into()),
            service_uuid: None,
            rssi: -70,
        };
        let hit = adv.into_hit(true);
        assert_eq!(hit.id.as_str(), "aa:bb:cc:dd:ee:01");
        assert_eq!(hit.name.unwrap().len(), MAX_NAME_LEN);
    }
}
