//! Persistence port for paired BLE devices and saved Wi-Fi networks.
//!
//! The connectivity managers consume these traits; they never touch a
//! storage backend directly. Stores are capacity-bounded: inserting beyond
//! capacity fails with [`PersistenceError::Full`] and leaves the stored list
//! untouched.
//!
//! # Components
//!
//! - [`records`] - record types, validation and NVS byte format (host-testable)
//! - [`MemoryStore`] - in-memory store, used in tests and as a fallback
//! - [`JsonFileStore`] - JSON files on disk (host only)
//! - [`NvsStore`] - ESP32 Non-Volatile Storage (ESP32 only)

mod memory;
mod records;

#[cfg(not(target_os = "espidf"))]
mod host;

#[cfg(feature = "esp32")]
mod nvs;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use memory::MemoryStore;
pub use records::{
    decode_list, encode_list, is_valid_address, normalize_address, PairedDevice, RecordError,
    SavedNetwork, ADDRESS_LEN, MAX_DEVICE_NAME_LEN, MAX_PASSWORD_LEN, MAX_SERVICE_UUID_LEN,
    MAX_SSID_LEN, MIN_PASSWORD_LEN,
};

#[cfg(not(target_os = "espidf"))]
pub use host::{default_store_dir, JsonFileStore};

#[cfg(feature = "esp32")]
pub use nvs::NvsStore;

/// Errors that can occur in persistence operations.
#[derive(Debug)]
pub enum PersistenceError {
    /// The list is at capacity and the record matched no existing entry.
    Full {
        /// Maximum number of records in the list.
        capacity: usize,
    },
    /// The record failed validation.
    Invalid(RecordError),
    /// The underlying store could not be read or written.
    Io(std::io::Error),
    /// Stored data could not be decoded.
    Corrupt(String),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full { capacity } => write!(f, "store full ({} records)", capacity),
            Self::Invalid(e) => write!(f, "invalid record: {}", e),
            Self::Io(e) => write!(f, "store I/O error: {}", e),
            Self::Corrupt(msg) => write!(f, "stored data corrupt: {}", msg),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Invalid(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RecordError> for PersistenceError {
    fn from(e: RecordError) -> Self {
        Self::Invalid(e)
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl PersistenceError {
    /// Whether this is a capacity failure rather than a storage failure.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full { .. })
    }
}

/// How an upsert changed a stored list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "an upsert may have been rejected for capacity"]
pub enum UpsertOutcome {
    /// An existing record at this index was replaced.
    Updated(usize),
    /// The record was appended.
    Inserted,
}

/// Storage for paired BLE device records.
pub trait PairedDeviceStore: Send {
    /// Load all paired devices.
    fn load_paired_devices(&self) -> Result<Vec<PairedDevice>, PersistenceError>;

    /// Add or update a paired device.
    ///
    /// Matches an existing record by address, then by name; otherwise inserts
    /// if capacity remains.
    fn save_paired_device(&mut self, record: &PairedDevice) -> Result<UpsertOutcome, PersistenceError>;

    /// Remove the record identified by `id` (address or service UUID).
    ///
    /// Returns `true` if a record was removed.
    fn remove_paired_device(&mut self, id: &str) -> Result<bool, PersistenceError>;
}

/// Storage for saved Wi-Fi network records.
pub trait SavedNetworkStore: Send {
    /// Load all saved networks.
    fn load_saved_networks(&self) -> Result<Vec<SavedNetwork>, PersistenceError>;

    /// Add or update a saved network, matched by SSID.
    fn save_network(&mut self, record: &SavedNetwork) -> Result<UpsertOutcome, PersistenceError>;

    /// Remove the network with the given SSID.
    ///
    /// Returns `true` if a record was removed.
    fn remove_network(&mut self, ssid: &str) -> Result<bool, PersistenceError>;
}

/// Add-or-update a paired device in `list`.
///
/// First match by address, else by (non-empty) name, else insert if
/// `list.len() < capacity`.
pub fn upsert_paired(
    list: &mut Vec<PairedDevice>,
    record: &PairedDevice,
    capacity: usize,
) -> Result<UpsertOutcome, PersistenceError> {
    record.validate()?;

    let by_address = list
        .iter()
        .position(|d| d.address.eq_ignore_ascii_case(&record.address));
    let by_name = || {
        if record.name.is_empty() {
            None
        } else {
            list.iter().position(|d| d.name == record.name)
        }
    };

    if let Some(idx) = by_address.or_else(by_name) {
        list[idx] = record.clone();
        return Ok(UpsertOutcome::Updated(idx));
    }

    if list.len() >= capacity {
        return Err(PersistenceError::Full { capacity });
    }
    list.push(record.clone());
    Ok(UpsertOutcome::Inserted)
}

/// Add-or-update a saved network in `list`, matched by SSID.
pub fn upsert_network(
    list: &mut Vec<SavedNetwork>,
    record: &SavedNetwork,
    capacity: usize,
) -> Result<UpsertOutcome, PersistenceError> {
    record.validate()?;

    if let Some(idx) = list.iter().position(|n| n.ssid == record.ssid) {
        list[idx] = record.clone();
        return Ok(UpsertOutcome::Updated(idx));
    }

    if list.len() >= capacity {
        return Err(PersistenceError::Full { capacity });
    }
    list.push(record.clone());
    Ok(UpsertOutcome::Inserted)
}

/// A store shared between owners, e.g. one file store serving both managers.
impl<S: PairedDeviceStore> PairedDeviceStore for Arc<Mutex<S>> {
    fn load_paired_devices(&self) -> Result<Vec<PairedDevice>, PersistenceError> {
        lock_store(self).load_paired_devices()
    }

    fn save_paired_device(&mut self, record: &PairedDevice) -> Result<UpsertOutcome, PersistenceError> {
        lock_store(self).save_paired_device(record)
    }

    fn remove_paired_device(&mut self, id: &str) -> Result<bool, PersistenceError> {
        lock_store(self).remove_paired_device(id)
    }
}

impl<S: SavedNetworkStore> SavedNetworkStore for Arc<Mutex<S>> {
    fn load_saved_networks(&self) -> Result<Vec<SavedNetwork>, PersistenceError> {
        lock_store(self).load_saved_networks()
    }

    fn save_network(&mut self, record: &SavedNetwork) -> Result<UpsertOutcome, PersistenceError> {
        lock_store(self).save_network(record)
    }

    fn remove_network(&mut self, ssid: &str) -> Result<bool, PersistenceError> {
        lock_store(self).remove_network(ssid)
    }
}

fn lock_store<S>(store: &Mutex<S>) -> MutexGuard<'_, S> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}
