//! Persisted record types.
//!
//! Platform-independent types for paired BLE devices and saved Wi-Fi networks,
//! with validation and a compact byte format for NVS storage.
//!
//! # Example
//!
//! ```
//! use radiolink_esp32::persistence::{PairedDevice, SavedNetwork};
//!
//! let network = SavedNetwork::new("MyNetwork", "MyPassword").unwrap();
//! assert!(!network.is_open());
//!
//! let device = PairedDevice::new("Scanner", "aa:bb:cc:dd:ee:ff", None).unwrap();
//! assert_eq!(device.address, "aa:bb:cc:dd:ee:ff");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum SSID length per IEEE 802.11 standard.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum password length for WPA2.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Minimum password length for WPA2.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Maximum BLE device name length stored in a record.
pub const MAX_DEVICE_NAME_LEN: usize = 32;

/// Length of a textual BLE address (`aa:bb:cc:dd:ee:ff`).
pub const ADDRESS_LEN: usize = 17;

/// Length of a textual 128-bit UUID.
pub const MAX_SERVICE_UUID_LEN: usize = 36;

/// Errors from record validation or decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// SSID is empty.
    SsidEmpty,
    /// SSID exceeds maximum length.
    SsidTooLong { len: usize, max: usize },
    /// Password is too short for WPA2.
    PasswordTooShort { len: usize, min: usize },
    /// Password exceeds maximum length.
    PasswordTooLong { len: usize, max: usize },
    /// Device name exceeds maximum length.
    NameTooLong { len: usize, max: usize },
    /// Address is not of the form `aa:bb:cc:dd:ee:ff`.
    InvalidAddress(String),
    /// Service UUID exceeds maximum length.
    ServiceUuidTooLong { len: usize, max: usize },
    /// Encoded data is malformed.
    InvalidFormat(String),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsidEmpty => write!(f, "SSID cannot be empty"),
            Self::SsidTooLong { len, max } => {
                write!(f, "SSID too long: {} bytes (max {})", len, max)
            }
            Self::PasswordTooShort { len, min } => {
                write!(f, "password too short: {} bytes (min {})", len, min)
            }
            Self::PasswordTooLong { len, max } => {
                write!(f, "password too long: {} bytes (max {})", len, max)
            }
            Self::NameTooLong { len, max } => {
                write!(f, "device name too long: {} bytes (max {})", len, max)
            }
            Self::InvalidAddress(addr) => write!(f, "invalid BLE address: {}", addr),
            Self::ServiceUuidTooLong { len, max } => {
                write!(f, "service UUID too long: {} bytes (max {})", len, max)
            }
            Self::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
        }
    }
}

impl std::error::Error for RecordError {}

/// Check that `address` looks like `aa:bb:cc:dd:ee:ff` (either case).
pub fn is_valid_address(address: &str) -> bool {
    address.len() == ADDRESS_LEN
        && address.split(':').count() == 6
        && address
            .split(':')
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Normalize an address to lowercase for comparisons and storage.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// A paired BLE device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedDevice {
    /// Advertised name (may be empty).
    pub name: String,
    /// Lowercase BLE address.
    pub address: String,
    /// Primary service UUID, if the device advertises one.
    pub service_uuid: Option<String>,
}

impl PairedDevice {
    /// Create a new paired device record.
    ///
    /// The address is normalized to lowercase.
    pub fn new(
        name: impl Into<String>,
        address: &str,
        service_uuid: Option<String>,
    ) -> Result<Self, RecordError> {
        let record = Self {
            name: name.into(),
            address: normalize_address(address),
            service_uuid,
        };
        record.validate()?;
        Ok(record)
    }

    /// Validate the record.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.name.len() > MAX_DEVICE_NAME_LEN {
            return Err(RecordError::NameTooLong {
                len: self.name.len(),
                max: MAX_DEVICE_NAME_LEN,
            });
        }
        if !is_valid_address(&self.address) {
            return Err(RecordError::InvalidAddress(self.address.clone()));
        }
        if let Some(uuid) = &self.service_uuid {
            if uuid.len() > MAX_SERVICE_UUID_LEN {
                return Err(RecordError::ServiceUuidTooLong {
                    len: uuid.len(),
                    max: MAX_SERVICE_UUID_LEN,
                });
            }
        }
        Ok(())
    }

    /// Whether this record is identified by `id` (address or service UUID).
    pub fn matches_id(&self, id: &str) -> bool {
        let id = id.trim();
        self.address.eq_ignore_ascii_case(id)
            || self
                .service_uuid
                .as_deref()
                .is_some_and(|uuid| uuid.eq_ignore_ascii_case(id))
    }

    /// Serialize to bytes for NVS storage.
    ///
    /// Format: `[name_len:1][name:N][addr_len:1][addr:M][uuid_len:1][uuid:K]`,
    /// with `uuid_len = 0` meaning no service UUID.
    pub fn to_bytes(&self) -> Vec<u8> {
        let uuid = self.service_uuid.as_deref().unwrap_or("");
        let mut bytes = Vec::with_capacity(3 + self.name.len() + self.address.len() + uuid.len());
        push_field(&mut bytes, &self.name);
        push_field(&mut bytes, &self.address);
        push_field(&mut bytes, uuid);
        bytes
    }

    /// Deserialize from bytes, returning the record and the bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), RecordError> {
        let mut cursor = 0;
        let name = read_field(bytes, &mut cursor, "name")?;
        let address = read_field(bytes, &mut cursor, "address")?;
        let uuid = read_field(bytes, &mut cursor, "service UUID")?;
        let service_uuid = if uuid.is_empty() { None } else { Some(uuid) };
        let record = Self::new(name, &address, service_uuid)?;
        Ok((record, cursor))
    }
}

/// Saved Wi-Fi credentials for connecting to an access point.
///
/// The password is wiped from memory when the record is dropped.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SavedNetwork {
    /// Network SSID (1-32 bytes).
    pub ssid: String,
    /// Network password (8-64 bytes for WPA2, empty for open networks).
    pub password: String,
}

impl fmt::Debug for SavedNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SavedNetwork")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl SavedNetwork {
    /// Create a new saved network.
    ///
    /// Returns an error if SSID or password are invalid.
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Result<Self, RecordError> {
        let network = Self {
            ssid: ssid.into(),
            password: password.into(),
        };
        network.validate()?;
        Ok(network)
    }

    /// Create a saved network for an open access point (no password).
    pub fn open(ssid: impl Into<String>) -> Result<Self, RecordError> {
        Self::new(ssid, String::new())
    }

    /// Validate the credentials.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.ssid.is_empty() {
            return Err(RecordError::SsidEmpty);
        }
        if self.ssid.len() > MAX_SSID_LEN {
            return Err(RecordError::SsidTooLong {
                len: self.ssid.len(),
                max: MAX_SSID_LEN,
            });
        }

        // Empty is OK for open networks
        if !self.password.is_empty() && self.password.len() < MIN_PASSWORD_LEN {
            return Err(RecordError::PasswordTooShort {
                len: self.password.len(),
                min: MIN_PASSWORD_LEN,
            });
        }
        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(RecordError::PasswordTooLong {
                len: self.password.len(),
                max: MAX_PASSWORD_LEN,
            });
        }

        Ok(())
    }

    /// Check if this is an open network (no password).
    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }

    /// Serialize to bytes for NVS storage.
    ///
    /// Format: `[ssid_len:1][ssid:N][password_len:1][password:M]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.ssid.len() + self.password.len());
        push_field(&mut bytes, &self.ssid);
        push_field(&mut bytes, &self.password);
        bytes
    }

    /// Deserialize from bytes, returning the record and the bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), RecordError> {
        let mut cursor = 0;
        let ssid = read_field(bytes, &mut cursor, "SSID")?;
        let password = read_field(bytes, &mut cursor, "password")?;
        Ok((Self::new(ssid, password)?, cursor))
    }
}

/// Encode a list of records as `[count:1][record]*`.
pub fn encode_list<T>(records: &[T], encode: impl Fn(&T) -> Vec<u8>) -> Vec<u8> {
    let mut bytes = vec![records.len().min(u8::MAX as usize) as u8];
    for record in records.iter().take(u8::MAX as usize) {
        bytes.extend_from_slice(&encode(record));
    }
    bytes
}

/// Decode a list produced by [`encode_list`].
pub fn decode_list<T>(
    bytes: &[u8],
    decode: impl Fn(&[u8]) -> Result<(T, usize), RecordError>,
) -> Result<Vec<T>, RecordError> {
    let Some((&count, mut rest)) = bytes.split_first() else {
        return Err(RecordError::InvalidFormat("empty data".into()));
    };
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (record, used) = decode(rest)?;
        records.push(record);
        rest = &rest[used..];
    }
    if !rest.is_empty() {
        return Err(RecordError::InvalidFormat(format!(
            "{} trailing bytes",
            rest.len()
        )));
    }
    Ok(records)
}

fn push_field(bytes: &mut Vec<u8>, field: &str) {
    // Fields are validated to well under 255 bytes before they get here
    let len = field.len().min(u8::MAX as usize);
    bytes.push(len as u8);
    bytes.extend_from_slice(&field.as_bytes()[..len]);
}

fn read_field(bytes: &[u8], cursor: &mut usize, what: &str) -> Result<String, RecordError> {
    let len = *bytes
        .get(*cursor)
        .ok_or_else(|| RecordError::InvalidFormat(format!("missing {} length", what)))?
        as usize;
    let start = *cursor + 1;
    let end = start + len;
    if bytes.len() < end {
        return Err(RecordError::InvalidFormat(format!("truncated {}", what)));
    }
    let value = String::from_utf8(bytes[start..end].to_vec())
        .map_err(|_| RecordError::InvalidFormat(format!("invalid {} UTF-8", what)))?;
    *cursor = end;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== SavedNetwork Tests ====================

    #[test]
    fn test_valid_network() {
        let network = SavedNetwork::new("MyNetwork", "password123").unwrap();
        assert_eq!(network.ssid, "MyNetwork");
        assert!(!network.is_open());
    }

    #[test]
    fn test_open_network() {
        let network = SavedNetwork::open("CoffeeShop").unwrap();
        assert!(network.is_open());
    }

    #[test]
    fn test_ssid_empty() {
        assert_eq!(SavedNetwork::new("", "password123"), Err(RecordError::SsidEmpty));
    }

    #[test]
    fn test_ssid_max_length() {
        let ssid = "a".repeat(MAX_SSID_LEN);
        assert!(SavedNetwork::new(&ssid, "password123").is_ok());

        let ssid = "a".repeat(MAX_SSID_LEN + 1);
        assert!(matches!(
            SavedNetwork::new(ssid, "password123"),
            Err(RecordError::SsidTooLong { len: 33, max: 32 })
        ));
    }

    #[test]
    fn test_password_bounds() {
        assert!(matches!(
            SavedNetwork::new("Net", "short"),
            Err(RecordError::PasswordTooShort { len: 5, min: 8 })
        ));
        assert!(SavedNetwork::new("Net", "a".repeat(MIN_PASSWORD_LEN)).is_ok());
        assert!(matches!(
            SavedNetwork::new("Net", "a".repeat(MAX_PASSWORD_LEN + 1)),
            Err(RecordError::PasswordTooLong { .. })
        ));
    }

    #[test]
    fn test_network_debug_redacts_password() {
        let network = SavedNetwork::new("Home", "supersecret").unwrap();
        let debug = format!("{:?}", network);
        assert!(debug.contains("Home"));
        assert!(!debug.contains("supersecret"));
    }

    #[test]
    fn test_network_bytes_roundtrip() {
        let network = SavedNetwork::new("Home", "supersecret").unwrap();
        let bytes = network.to_bytes();
        let (decoded, used) = SavedNetwork::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, network);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn test_network_from_bytes_truncated() {
        assert!(matches!(
            SavedNetwork::from_bytes(&[5, b'a', b'b']),
            Err(RecordError::InvalidFormat(_))
        ));
        assert!(matches!(
            SavedNetwork::from_bytes(&[]),
            Err(RecordError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_network_from_bytes_invalid_utf8() {
        assert!(matches!(
            SavedNetwork::from_bytes(&[2, 0xff, 0xfe, 0]),
            Err(RecordError::InvalidFormat(_))
        ));
    }

    // ==================== PairedDevice Tests ====================

    #[test]
    fn test_valid_device_normalizes_address() {
        let device = PairedDevice::new("Reader", "AA:BB:CC:DD:EE:FF", None).unwrap();
        assert_eq!(device.address, "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_invalid_addresses() {
        for bad in ["", "aa:bb:cc:dd:ee", "aa:bb:cc:dd:ee:fg", "aabbccddeeff", "aa-bb-cc-dd-ee-ff"] {
            assert!(
                matches!(PairedDevice::new("x", bad, None), Err(RecordError::InvalidAddress(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_device_name_too_long() {
        let name = "n".repeat(MAX_DEVICE_NAME_LEN + 1);
        assert!(matches!(
            PairedDevice::new(name, "aa:bb:cc:dd:ee:ff", None),
            Err(RecordError::NameTooLong { .. })
        ));
    }

    #[test]
    fn test_device_matches_id() {
        let device = PairedDevice::new(
            "Reader",
            "aa:bb:cc:dd:ee:ff",
            Some("0000180d-0000-1000-8000-00805f9b34fb".into()),
        )
        .unwrap();
        assert!(device.matches_id("AA:BB:CC:DD:EE:FF"));
        assert!(device.matches_id("0000180D-0000-1000-8000-00805F9B34FB"));
        assert!(!device.matches_id("11:22:33:44:55:66"));
    }

    #[test]
    fn test_device_bytes_without_uuid() {
        let device = PairedDevice::new("Reader", "aa:bb:cc:dd:ee:ff", None).unwrap();
        let (decoded, _) = PairedDevice::from_bytes(&device.to_bytes()).unwrap();
        assert_eq!(decoded.service_uuid, None);
        assert_eq!(decoded, device);
    }

    #[test]
    fn test_list_codec() {
        let devices = vec![
            PairedDevice::new("A", "aa:bb:cc:dd:ee:01", None).unwrap(),
            PairedDevice::new("B", "aa:bb:cc:dd:ee:02", Some("180d".into())).unwrap(),
        ];
        let bytes = encode_list(&devices, PairedDevice::to_bytes);
        let decoded = decode_list(&bytes, PairedDevice::from_bytes).unwrap();
        assert_eq!(decoded, devices);
    }

    #[test]
    fn test_list_codec_rejects_trailing_bytes() {
        let mut bytes = encode_list(&[SavedNetwork::open("Net").unwrap()], SavedNetwork::to_bytes);
        bytes.push(0);
        assert!(matches!(
            decode_list(&bytes, SavedNetwork::from_bytes),
            Err(RecordError::InvalidFormat(_))
        ));
    }
}
