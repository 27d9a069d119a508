//! In-memory persistence.

use super::{
    upsert_network, upsert_paired, PairedDevice, PairedDeviceStore, PersistenceError,
    SavedNetwork, SavedNetworkStore, UpsertOutcome,
};

/// Capacity-bounded in-memory store for both record kinds.
///
/// Nothing survives a restart. A write failure can be injected to exercise
/// the best-effort persistence path.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    paired: Vec<PairedDevice>,
    networks: Vec<SavedNetwork>,
    max_paired: usize,
    max_networks: usize,
    fail_writes: bool,
}

impl MemoryStore {
    /// Create an empty store with the given capacities.
    pub fn new(max_paired: usize, max_networks: usize) -> Self {
        Self {
            paired: Vec::new(),
            networks: Vec::new(),
            max_paired,
            max_networks,
            fail_writes: false,
        }
    }

    /// Pre-populate paired devices.
    pub fn with_paired(mut self, devices: impl IntoIterator<Item = PairedDevice>) -> Self {
        self.paired.extend(devices);
        self.paired.truncate(self.max_paired);
        self
    }

    /// Pre-populate saved networks.
    pub fn with_networks(mut self, networks: impl IntoIterator<Item = SavedNetwork>) -> Self {
        self.networks.extend(networks);
        self.networks.truncate(self.max_networks);
        self
    }

    /// Make every subsequent write fail with an I/O error.
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    fn check_writable(&self) -> Result<(), PersistenceError> {
        if self.fail_writes {
            return Err(PersistenceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        Ok(())
    }
}

impl PairedDeviceStore for MemoryStore {
    fn load_paired_devices(&self) -> Result<Vec<PairedDevice>, PersistenceError> {
        Ok(self.paired.clone())
    }

    fn save_paired_device(&mut self, record: &PairedDevice) -> Result<UpsertOutcome, PersistenceError> {
        self.check_writable()?;
        upsert_paired(&mut self.paired, record, self.max_paired)
    }

    fn remove_paired_device(&mut self, id: &str) -> Result<bool, PersistenceError> {
        self.check_writable()?;
        let before = self.paired.len();
        self.paired.retain(|d| !d.matches_id(id));
        Ok(self.paired.len() != before)
    }
}

impl SavedNetworkStore for MemoryStore {
    fn load_saved_networks(&self) -> Result<Vec<SavedNetwork>, PersistenceError> {
        Ok(self.networks.clone())
    }

    fn save_network(&mut self, record: &SavedNetwork) -> Result<UpsertOutcome, PersistenceError> {
        self.check_writable()?;
        upsert_network(&mut self.networks, record, self.max_networks)
    }

    fn remove_network(&mut self, ssid: &str) -> Result<bool, PersistenceError> {
        self.check_writable()?;
        let before = self.networks.len();
        self.networks.retain(|n| n.ssid != ssid);
        Ok(self.networks.len() != before)
    }
}
