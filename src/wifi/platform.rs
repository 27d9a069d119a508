//! Boundary to the platform Wi-Fi driver.

use crate::persistence::SavedNetwork;
use crate::registry::{bounded, PrimaryId, ScanHit, MAX_ID_LEN};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Errors reported by the Wi-Fi driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiRadioError {
    /// The driver has not been started.
    NotStarted,
    /// SSID or password rejected by the driver.
    InvalidCredentials,
    /// Access point rejected the credentials.
    AuthFailed,
    /// No access point with this SSID answered.
    NotFound,
    /// The platform call timed out.
    Timeout,
    /// DHCP did not complete.
    NoAddress,
    /// Raw platform error code.
    Platform(i32),
}

impl std::fmt::Display for WifiRadioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "Wi-Fi driver not started"),
            Self::InvalidCredentials => write!(f, "invalid SSID or password"),
            Self::AuthFailed => write!(f, "authentication failed"),
            Self::NotFound => write!(f, "network not found"),
            Self::Timeout => write!(f, "platform timeout"),
            Self::NoAddress => write!(f, "no IP address assigned"),
            Self::Platform(code) => write!(f, "platform error {}", code),
        }
    }
}

impl std::error::Error for WifiRadioError {}

/// One access point from a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub bssid: String,
    pub rssi: i16,
    pub channel: u8,
    /// No authentication required.
    pub open: bool,
}

impl AccessPoint {
    pub(crate) fn to_hit(&self) -> ScanHit {
        let ssid = bounded(&self.ssid, MAX_ID_LEN);
        ScanHit {
            id: PrimaryId::ssid(&ssid),
            name: Some(ssid.clone()),
            address: ssid,
            service_uuid: None,
            rssi: self.rssi,
        }
    }
}

/// Collapse a scan list to one entry per SSID (strongest BSSID), dropping
/// hidden networks.
pub(crate) fn strongest_per_ssid(mut aps: Vec<AccessPoint>) -> Vec<AccessPoint> {
    aps.retain(|ap| !ap.ssid.is_empty());
    aps.sort_by(|a, b| a.ssid.cmp(&b.ssid).then(b.rssi.cmp(&a.rssi)));
    aps.dedup_by(|later, earlier| later.ssid == earlier.ssid);
    aps
}

/// An established station link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub ssid: String,
    pub rssi: Option<i16>,
    pub ip: Option<Ipv4Addr>,
}

/// Asynchronous notification from the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The station link went down. `reason` is set for link loss.
    Disconnected { reason: Option<String> },
    /// Fresh RSSI of the current link.
    Rssi(i16),
}

/// Platform Wi-Fi driver (station mode).
pub trait WifiRadio: Send + Sync {
    /// Start the driver.
    fn start(&self) -> Result<(), WifiRadioError>;

    /// Stop the driver.
    fn stop(&self) -> Result<(), WifiRadioError>;

    /// Run one scan and return every access point heard.
    fn scan(&self, cancel: &CancellationToken) -> Result<Vec<AccessPoint>, WifiRadioError>;

    /// Associate with `network` and wait for an address.
    fn connect(&self, network: &SavedNetwork, timeout: Duration) -> Result<LinkInfo, WifiRadioError>;

    /// Request disconnection of the station link.
    ///
    /// Completion is reported later as [`LinkEvent::Disconnected`].
    fn disconnect(&self) -> Result<(), WifiRadioError>;

    /// Next pending link event, if any. Must not block.
    fn poll_link_event(&self) -> Option<LinkEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ap(ssid: &str, bssid: &str, rssi: i16) -> AccessPoint {
        AccessPoint {
            ssid: ssid.into(),
            bssid: bssid.into(),
            rssi,
            channel: 6,
            open: false,
        }
    }

    #[test]
    fn test_strongest_per_ssid() {
        let aps = strongest_per_ssid(vec![
            ap("Home", "02:00:00:00:00:01", -80),
            ap("", "02:00:00:00:00:02", -30),
            ap("Home", "02:00:00:00:00:03", -50),
            ap("Cafe", "02:00:00:00:00:04", -70),
        ]);
        assert_eq!(aps.len(), 2);
        let home = aps.iter().find(|a| a.ssid == "Home").unwrap();
        assert_eq!(home.rssi, -50);
        assert_eq!(home.bssid, "02:00:00:00:00:03");
    }

    #[test]
    fn test_ap_hit_keyed_by_ssid() {
        let hit = ap("Home", "02:00:00:00:00:01", -60).to_hit();
        assert_eq!(hit.id, PrimaryId::ssid("Home"));
        assert_eq!(hit.address, "Home");
    }
}
