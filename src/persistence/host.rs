//! Record persistence for host (development) builds.
//!
//! Stores paired devices and saved networks as JSON files so they persist
//! across runs. Uses `~/.radiolink-esp32/` by default:
//!
//! - `paired_devices.json`
//! - `saved_networks.json`
//!
//! # Usage
//!
//! ```ignore
//! use radiolink_esp32::persistence::{default_store_dir, JsonFileStore};
//!
//! let store = JsonFileStore::open(default_store_dir()?, 8, 8)?;
//! ```

use super::{
    upsert_network, upsert_paired, PairedDevice, PairedDeviceStore, PersistenceError,
    SavedNetwork, SavedNetworkStore, UpsertOutcome,
};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const PAIRED_FILE: &str = "paired_devices.json";
const NETWORKS_FILE: &str = "saved_networks.json";

/// Get the default store directory.
///
/// Returns `~/.radiolink-esp32`
pub fn default_store_dir() -> io::Result<PathBuf> {
    let home = std::env::var("HOME")
        .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
    Ok(PathBuf::from(home).join(".radiolink-esp32"))
}

/// JSON-file backed store for both record kinds.
///
/// Lists are loaded once on open and kept in memory; every write rewrites
/// the affected file and reads it back to verify.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    paired: Vec<PairedDevice>,
    networks: Vec<SavedNetwork>,
    max_paired: usize,
    max_networks: usize,
}

impl JsonFileStore {
    /// Open (or create) a store in `dir`.
    ///
    /// Missing files are treated as empty lists. Corrupt files are logged and
    /// treated as empty so a bad file never blocks startup.
    pub fn open(
        dir: impl Into<PathBuf>,
        max_paired: usize,
        max_networks: usize,
    ) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut paired: Vec<PairedDevice> = load_list(&dir.join(PAIRED_FILE))?;
        paired.retain(|d| match d.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!("[store] Dropping invalid paired device {}: {}", d.address, e);
                false
            }
        });
        paired.truncate(max_paired);

        let mut networks: Vec<SavedNetwork> = load_list(&dir.join(NETWORKS_FILE))?;
        networks.retain(|n| n.validate().is_ok());
        networks.truncate(max_networks);

        info!(
            "[store] Opened {:?}: {} paired devices, {} saved networks",
            dir,
            paired.len(),
            networks.len()
        );

        Ok(Self {
            dir,
            paired,
            networks,
            max_paired,
            max_networks,
        })
    }

    /// Directory the store writes to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_paired(&self) -> Result<(), PersistenceError> {
        save_list(&self.dir.join(PAIRED_FILE), &self.paired)
    }

    fn write_networks(&self) -> Result<(), PersistenceError> {
        save_list(&self.dir.join(NETWORKS_FILE), &self.networks)
    }
}

fn load_list<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, PersistenceError> {
    let json = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("[store] No file at {:?}", path);
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str(&json) {
        Ok(list) => Ok(list),
        Err(e) => {
            warn!("[store] Ignoring corrupt file {:?}: {}", path, e);
            Ok(Vec::new())
        }
    }
}

fn save_list<T: Serialize>(path: &Path, list: &[T]) -> Result<(), PersistenceError> {
    let json = serde_json::to_string_pretty(list)
        .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
    fs::write(path, &json)?;

    // Verify write by reading back
    let read_back = fs::read_to_string(path)?;
    if read_back != json {
        return Err(PersistenceError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "verification failed: wrote {} bytes, read {} bytes",
                json.len(),
                read_back.len()
            ),
        )));
    }
    Ok(())
}

impl PairedDeviceStore for JsonFileStore {
    fn load_paired_devices(&self) -> Result<Vec<PairedDevice>, PersistenceError> {
        Ok(self.paired.clone())
    }

    fn save_paired_device(&mut self, record: &PairedDevice) -> Result<UpsertOutcome, PersistenceError> {
        let outcome = upsert_paired(&mut self.paired, record, self.max_paired)?;
        self.write_paired()?;
        Ok(outcome)
    }

    fn remove_paired_device(&mut self, id: &str) -> Result<bool, PersistenceError> {
        let before = self.paired.len();
        self.paired.retain(|d| !d.matches_id(id));
        if self.paired.len() == before {
            return Ok(false);
        }
        self.write_paired()?;
        Ok(true)
    }
}

impl SavedNetworkStore for JsonFileStore {
    fn load_saved_networks(&self) -> Result<Vec<SavedNetwork>, PersistenceError> {
        Ok(self.networks.clone())
    }

    fn save_network(&mut self, record: &SavedNetwork) -> Result<UpsertOutcome, PersistenceError> {
        let outcome = upsert_network(&mut self.networks, record, self.max_networks)?;
        self.write_networks()?;
        Ok(outcome)
    }

    fn remove_network(&mut self, ssid: &str) -> Result<bool, PersistenceError> {
        let before = self.networks.len();
        self.networks.retain(|n| n.ssid != ssid);
        if self.networks.len() == before {
            return Ok(false);
        }
        self.write_networks()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Counter to ensure unique test directories even in parallel execution
    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_store_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        env::temp_dir().join(format!("radiolink-store-test-{}-{}", pid, id))
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = unique_store_dir();

        {
            let mut store = JsonFileStore::open(&dir, 4, 4).expect("Failed to open");
            let device = PairedDevice::new("Reader", "aa:bb:cc:dd:ee:ff", None).unwrap();
            let _ = store.save_paired_device(&device).expect("Failed to save device");
            let _ = store
                .save_network(&SavedNetwork::new("Home", "password123").unwrap())
                .expect("Failed to save network");
        }

        let store = JsonFileStore::open(&dir, 4, 4).expect("Failed to reopen");
        let devices = store.load_paired_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Reader");
        let networks = store.load_saved_networks().unwrap();
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].password, "password123");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_remove_persists() {
        let dir = unique_store_dir();

        let mut store = JsonFileStore::open(&dir, 4, 4).unwrap();
        let _ = store.save_network(&SavedNetwork::open("Cafe").unwrap()).unwrap();
        assert!(store.remove_network("Cafe").unwrap());
        assert!(!store.remove_network("Cafe").unwrap());

        let reopened = JsonFileStore::open(&dir, 4, 4).unwrap();
        assert!(reopened.load_saved_networks().unwrap().is_empty());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_file_treated_as_empty() {
        let dir = unique_store_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PAIRED_FILE), "{not json").unwrap();

        let store = JsonFileStore::open(&dir, 4, 4).expect("corrupt file should not fail open");
        assert!(store.load_paired_devices().unwrap().is_empty());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_full_store_not_written() {
        let dir = unique_store_dir();

        let mut store = JsonFileStore::open(&dir, 1, 1).unwrap();
        let _ = store.save_network(&SavedNetwork::open("A").unwrap()).unwrap();
        assert!(store
            .save_network(&SavedNetwork::open("B").unwrap())
            .unwrap_err()
            .is_full());

        let reopened = JsonFileStore::open(&dir, 1, 1).unwrap();
        let networks = reopened.load_saved_networks().unwrap();
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].ssid, "A");

        let _ = fs::remove_dir_all(&dir);
    }
}
