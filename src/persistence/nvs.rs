//! Record persistence in ESP32 Non-Volatile Storage (NVS).
//!
//! Paired devices and saved networks are stored as two raw blobs using the
//! length-prefixed list format from [`super::records`]. Lists are cached in
//! memory; every write rewrites the blob and reads it back to verify.
//!
//! # Security
//!
//! Saved networks contain Wi-Fi passwords. Production images should enable
//! NVS encryption.

use super::{
    decode_list, encode_list, upsert_network, upsert_paired, PairedDevice, PairedDeviceStore,
    PersistenceError, SavedNetwork, SavedNetworkStore, UpsertOutcome, MAX_DEVICE_NAME_LEN,
    MAX_PASSWORD_LEN, MAX_SERVICE_UUID_LEN, MAX_SSID_LEN,
};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_sys::EspError;
use log::{info, warn};

/// NVS namespace for connectivity records.
const NVS_NAMESPACE: &str = "radiolink";

/// NVS key for paired BLE devices.
const PAIRED_KEY: &str = "ble_paired";

/// NVS key for saved Wi-Fi networks.
const NETWORKS_KEY: &str = "wifi_saved";

/// Largest encoded paired-device record: three length bytes plus fields.
const MAX_PAIRED_RECORD: usize = 3 + MAX_DEVICE_NAME_LEN + super::ADDRESS_LEN + MAX_SERVICE_UUID_LEN;

/// Largest encoded saved-network record.
const MAX_NETWORK_RECORD: usize = 2 + MAX_SSID_LEN + MAX_PASSWORD_LEN;

fn io_error(context: &str, e: EspError) -> PersistenceError {
    PersistenceError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{}: {:?}", context, e),
    ))
}

/// NVS-backed store for both record kinds.
pub struct NvsStore {
    nvs: EspNvs<NvsDefault>,
    paired: Vec<PairedDevice>,
    networks: Vec<SavedNetwork>,
    max_paired: usize,
    max_networks: usize,
}

impl NvsStore {
    /// Open the connectivity namespace on the default NVS partition.
    ///
    /// Corrupt blobs are logged and treated as empty lists.
    pub fn open(
        partition: EspDefaultNvsPartition,
        max_paired: usize,
        max_networks: usize,
    ) -> Result<Self, EspError> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;

        let mut paired = read_blob(&nvs, PAIRED_KEY, 1 + max_paired * MAX_PAIRED_RECORD)
            .map(|bytes| decode_list(&bytes, PairedDevice::from_bytes))
            .transpose()
            .unwrap_or_else(|e| {
                warn!("[store] Paired device blob corrupt: {}", e);
                None
            })
            .unwrap_or_default();
        paired.truncate(max_paired);

        let mut networks = read_blob(&nvs, NETWORKS_KEY, 1 + max_networks * MAX_NETWORK_RECORD)
            .map(|bytes| decode_list(&bytes, SavedNetwork::from_bytes))
            .transpose()
            .unwrap_or_else(|e| {
                warn!("[store] Saved network blob corrupt: {}", e);
                None
            })
            .unwrap_or_default();
        networks.truncate(max_networks);

        info!(
            "[store] NVS loaded: {} paired devices, {} saved networks",
            paired.len(),
            networks.len()
        );

        Ok(Self {
            nvs,
            paired,
            networks,
            max_paired,
            max_networks,
        })
    }

    fn write_blob(&mut self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.nvs
            .set_raw(key, bytes)
            .map_err(|e| io_error("NVS write failed", e))?;

        // Read back and verify to catch silent flash write failures
        let read_back = read_blob(&self.nvs, key, bytes.len() + 1).ok_or_else(|| {
            PersistenceError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "record blob missing after save - possible flash failure",
            ))
        })?;
        if read_back != bytes {
            return Err(PersistenceError::Corrupt(
                "verification failed - data mismatch after save".into(),
            ));
        }
        Ok(())
    }
}

fn read_blob(nvs: &EspNvs<NvsDefault>, key: &str, max_len: usize) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; max_len];
    match nvs.get_raw(key, &mut buf) {
        Ok(Some(bytes)) => Some(bytes.to_vec()),
        Ok(None) => None,
        Err(e) => {
            warn!("[store] Failed to read {} from NVS: {:?}", key, e);
            None
        }
    }
}

impl PairedDeviceStore for NvsStore {
    fn load_paired_devices(&self) -> Result<Vec<PairedDevice>, PersistenceError> {
        Ok(self.paired.clone())
    }

    fn save_paired_device(&mut self, record: &PairedDevice) -> Result<UpsertOutcome, PersistenceError> {
        let outcome = upsert_paired(&mut self.paired, record, self.max_paired)?;
        let bytes = encode_list(&self.paired, PairedDevice::to_bytes);
        self.write_blob(PAIRED_KEY, &bytes)?;
        Ok(outcome)
    }

    fn remove_paired_device(&mut self, id: &str) -> Result<bool, PersistenceError> {
        let before = self.paired.len();
        self.paired.retain(|d| !d.matches_id(id));
        if self.paired.len() == before {
            return Ok(false);
        }
        let bytes = encode_list(&self.paired, PairedDevice::to_bytes);
        self.write_blob(PAIRED_KEY, &bytes)?;
        Ok(true)
    }
}

impl SavedNetworkStore for NvsStore {
    fn load_saved_networks(&self) -> Result<Vec<SavedNetwork>, PersistenceError> {
        Ok(self.networks.clone())
    }

    fn save_network(&mut self, record: &SavedNetwork) -> Result<UpsertOutcome, PersistenceError> {
        let outcome = upsert_network(&mut self.networks, record, self.max_networks)?;
        let bytes = encode_list(&self.networks, SavedNetwork::to_bytes);
        self.write_blob(NETWORKS_KEY, &bytes)?;
        Ok(outcome)
    }

    fn remove_network(&mut self, ssid: &str) -> Result<bool, PersistenceError> {
        let before = self.networks.len();
        self.networks.retain(|n| n.ssid != ssid);
        if self.networks.len() == before {
            return Ok(false);
        }
        let bytes = encode_list(&self.networks, SavedNetwork::to_bytes);
        self.write_blob(NETWORKS_KEY, &bytes)?;
        Ok(true)
    }
}
