//! The shared device registry.
//!
//! A map of [`ManagedDevice`]s keyed by [`PrimaryId`], merging persisted
//! entries with scanned ones. Every method takes the internal lock for the
//! duration of a single merge/insert/iterate call only, so UI-side reads never
//! wait on a radio operation.
//!
//! # Scan cycles
//!
//! Each scan opens a cycle with [`DeviceRegistry::begin_scan_cycle`]. Hits
//! merged during the cycle are stamped with it. [`DeviceRegistry::finish_scan_cycle`]
//! marks devices that were online but absent from the cycle as offline, and
//! prunes unpaired devices that missed two consecutive cycles.

use super::device::{display_order, ManagedDevice, PrimaryId, ScanHit, MAX_ID_LEN, MAX_NAME_LEN};
use super::device::bounded;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Persisted entry handed to [`DeviceRegistry::sync_persisted`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedEntry {
    pub id: PrimaryId,
    pub name: String,
    pub address: String,
    pub service_uuid: Option<String>,
}

/// Result of merging a scan hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
    /// First sighting of this id.
    New,
    /// Existing entry refreshed.
    Updated,
}

#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<PrimaryId, ManagedDevice>,
    cycle: u32,
}

/// Cloneable handle to a shared device registry.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep using it
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().devices.is_empty()
    }

    /// Look up a device by id.
    pub fn get(&self, id: &PrimaryId) -> Option<ManagedDevice> {
        self.lock().devices.get(id).cloned()
    }

    /// Find the first device matching `pred`.
    pub fn find(&self, pred: impl Fn(&ManagedDevice) -> bool) -> Option<ManagedDevice> {
        self.lock().devices.values().find(|d| pred(d)).cloned()
    }

    /// The device currently flagged as connected.
    pub fn connected(&self) -> Option<ManagedDevice> {
        self.find(|d| d.is_connected)
    }

    /// Replace the paired flags with the given persisted entries.
    ///
    /// Entries are inserted or refreshed with `is_paired = true`; devices no
    /// longer persisted lose the flag, and are dropped unless online or connected.
    pub fn sync_persisted(&self, entries: impl IntoIterator<Item = PersistedEntry>) {
        let mut inner = self.lock();
        for device in inner.devices.values_mut() {
            device.is_paired = false;
        }
        for entry in entries {
            match inner.devices.get_mut(&entry.id) {
                Some(device) => {
                    device.is_paired = true;
                    if !entry.name.is_empty() {
                        device.name = bounded(&entry.name, MAX_NAME_LEN);
                    }
                    device.address = bounded(&entry.address, MAX_ID_LEN);
                    if entry.service_uuid.is_some() {
                        device.service_uuid = entry.service_uuid;
                    }
                }
                None => {
                    let device = ManagedDevice::persisted(
                        entry.id.clone(),
                        &entry.name,
                        &entry.address,
                        entry.service_uuid,
                    );
                    inner.devices.insert(entry.id, device);
                }
            }
        }
        inner
            .devices
            .retain(|_, d| d.is_paired || d.is_online || d.is_connected);
    }

    /// Start a new scan cycle.
    pub fn begin_scan_cycle(&self) {
        let mut inner = self.lock();
        inner.cycle = inner.cycle.wrapping_add(1);
    }

    /// Merge one scan hit, replacing signal strength and the online flag.
    pub fn merge_hit(&self, hit: &ScanHit, now: Instant) -> MergeResult {
        let mut inner = self.lock();
        let cycle = inner.cycle;
        match inner.devices.get_mut(&hit.id) {
            Some(device) => {
                device.rssi = Some(hit.rssi);
                device.is_online = true;
                device.last_seen = Some(now);
                device.seen_cycle = cycle;
                if let Some(name) = hit.name.as_deref().filter(|n| !n.is_empty()) {
                    device.name = bounded(name, MAX_NAME_LEN);
                }
                device.address = bounded(&hit.address, MAX_ID_LEN);
                if hit.service_uuid.is_some() {
                    device.service_uuid = hit.service_uuid.clone();
                }
                MergeResult::Updated
            }
            None => {
                inner
                    .devices
                    .insert(hit.id.clone(), ManagedDevice::from_hit(hit, now, cycle));
                MergeResult::New
            }
        }
    }

    /// Close the current scan cycle.
    ///
    /// Returns the number of devices that went offline.
    pub fn finish_scan_cycle(&self) -> usize {
        let mut inner = self.lock();
        let cycle = inner.cycle;
        let mut went_offline = 0;
        for device in inner.devices.values_mut() {
            if device.seen_cycle != cycle && device.is_online && !device.is_connected {
                device.is_online = false;
                went_offline += 1;
            }
        }
        inner.devices.retain(|_, d| {
            d.is_paired || d.is_connected || d.seen_cycle.wrapping_add(1) >= cycle
        });
        went_offline
    }

    /// Flag `id` as the connected device, clearing the flag everywhere else.
    ///
    /// Creates the entry if it does not exist. `paired` only ever sets the
    /// paired flag, it never clears it.
    pub fn mark_connected(
        &self,
        id: &PrimaryId,
        name: &str,
        address: &str,
        service_uuid: Option<String>,
        paired: bool,
    ) {
        let mut inner = self.lock();
        for device in inner.devices.values_mut() {
            device.is_connected = false;
        }
        let device = inner
            .devices
            .entry(id.clone())
            .or_insert_with(|| ManagedDevice::persisted(id.clone(), name, address, None));
        device.is_connected = true;
        device.is_online = true;
        device.is_paired |= paired;
        if !name.is_empty() {
            device.name = bounded(name, MAX_NAME_LEN);
        }
        device.address = bounded(address, MAX_ID_LEN);
        if service_uuid.is_some() {
            device.service_uuid = service_uuid;
        }
    }

    /// Clear the connected flag on every device.
    pub fn clear_connected(&self) {
        for device in self.lock().devices.values_mut() {
            device.is_connected = false;
        }
    }

    /// Record a fresh signal strength for an existing entry.
    pub fn update_rssi(&self, id: &PrimaryId, rssi: i16) {
        if let Some(device) = self.lock().devices.get_mut(id) {
            device.rssi = Some(rssi);
        }
    }

    /// Remove an entry. Returns `true` if it existed.
    pub fn remove(&self, id: &PrimaryId) -> bool {
        self.lock().devices.remove(id).is_some()
    }

    /// Mark everything offline and disconnected, dropping unpaired entries.
    pub fn reset_transient(&self) {
        let mut inner = self.lock();
        inner.devices.retain(|_, d| d.is_paired);
        for device in inner.devices.values_mut() {
            device.is_online = false;
            device.is_connected = false;
        }
    }

    /// Unordered copy of all entries.
    pub fn snapshot(&self) -> Vec<ManagedDevice> {
        self.lock().devices.values().cloned().collect()
    }

    /// All entries in display order.
    pub fn display_list(&self) -> Vec<ManagedDevice> {
        let mut list = self.snapshot();
        list.sort_by(display_order);
        list
    }

    /// Online device with the strongest signal among those matching `pred`.
    pub fn strongest(&self, pred: impl Fn(&ManagedDevice) -> bool) -> Option<ManagedDevice> {
        self.lock()
            .devices
            .values()
            .filter(|d| d.is_online && d.rssi.is_some() && pred(d))
            .max_by(|a, b| a.rssi.cmp(&b.rssi).then_with(|| b.id.cmp(&a.id)))
            .cloned()
    }
}
