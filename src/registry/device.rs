//! Device identity and the merged device view.

use std::cmp::Ordering;
use std::fmt;
use std::time::Instant;

/// Maximum display name length carried in worker records and the registry.
pub const MAX_NAME_LEN: usize = 32;

/// Maximum identifier/address length carried in worker records (UUID text).
pub const MAX_ID_LEN: usize = 36;

/// Truncate `s` to at most `max` bytes on a char boundary.
pub fn bounded(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Key identifying a device or network across scan and pairing data.
///
/// BLE devices are keyed by lowercase MAC address, or by lowercase primary
/// service UUID when addresses are unstable. Wi-Fi networks are keyed by SSID
/// (case-sensitive).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimaryId(String);

impl PrimaryId {
    /// Key by BLE address.
    pub fn address(address: &str) -> Self {
        Self(bounded(&address.trim().to_ascii_lowercase(), MAX_ID_LEN))
    }

    /// Key by BLE primary service UUID.
    pub fn service_uuid(uuid: &str) -> Self {
        Self(bounded(&uuid.trim().to_ascii_lowercase(), MAX_ID_LEN))
    }

    /// Key by Wi-Fi SSID.
    pub fn ssid(ssid: &str) -> Self {
        Self(bounded(ssid, MAX_ID_LEN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrimaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device or network discovered by one scan event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanHit {
    pub id: PrimaryId,
    /// Advertised name, if the advertisement carried one.
    pub name: Option<String>,
    pub address: String,
    pub service_uuid: Option<String>,
    /// Signal strength in dBm.
    pub rssi: i16,
}

/// Merged view of a persisted and/or scanned device.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedDevice {
    pub id: PrimaryId,
    pub name: String,
    /// BLE address, or the SSID for Wi-Fi networks.
    pub address: String,
    pub service_uuid: Option<String>,
    /// Last known signal strength in dBm, `None` if never measured.
    pub rssi: Option<i16>,
    /// Seen in the most recent scan.
    pub is_online: bool,
    /// Present in the persisted registry (paired device / saved network).
    pub is_paired: bool,
    /// The manager's current link target.
    pub is_connected: bool,
    /// When a scan last reported this device.
    pub last_seen: Option<Instant>,
    pub(crate) seen_cycle: u32,
}

impl ManagedDevice {
    /// A device known only from the persisted registry.
    pub fn persisted(
        id: PrimaryId,
        name: &str,
        address: &str,
        service_uuid: Option<String>,
    ) -> Self {
        Self {
            id,
            name: bounded(name, MAX_NAME_LEN),
            address: bounded(address, MAX_ID_LEN),
            service_uuid,
            rssi: None,
            is_online: false,
            is_paired: true,
            is_connected: false,
            last_seen: None,
            seen_cycle: 0,
        }
    }

    pub(crate) fn from_hit(hit: &ScanHit, now: Instant, cycle: u32) -> Self {
        Self {
            id: hit.id.clone(),
            name: hit
                .name
                .as_deref()
                .map(|n| bounded(n, MAX_NAME_LEN))
                .unwrap_or_default(),
            address: bounded(&hit.address, MAX_ID_LEN),
            service_uuid: hit.service_uuid.clone(),
            rssi: Some(hit.rssi),
            is_online: true,
            is_paired: false,
            is_connected: false,
            last_seen: Some(now),
            seen_cycle: cycle,
        }
    }

    /// Name for display, falling back to the address.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.address
        } else {
            &self.name
        }
    }

    /// Whether the last sighting is older than `max_age` (or never happened).
    pub fn is_stale(&self, now: Instant, max_age: std::time::Duration) -> bool {
        match self.last_seen {
            Some(seen) => now.saturating_duration_since(seen) > max_age,
            None => true,
        }
    }
}

/// Display ordering: connected first, then paired, then unpaired; within a
/// group by descending signal strength with unknown strength last.
pub fn display_order(a: &ManagedDevice, b: &ManagedDevice) -> Ordering {
    b.is_connected
        .cmp(&a.is_connected)
        .then_with(|| b.is_paired.cmp(&a.is_paired))
        .then_with(|| match (a.rssi, b.rssi) {
            (Some(ra), Some(rb)) => rb.cmp(&ra),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}
