//! NimBLE-backed [`BleRadio`] for ESP32 targets.
//!
//! Scans and connects run through `esp32-nimble`'s async API, driven to
//! completion with `block_on` on the calling worker thread. Disconnect
//! callbacks from the NimBLE host task are queued and handed to the manager
//! through [`BleRadio::poll_link_event`].

use super::platform::{Advertisement, BleRadio, BleRadioError, ConnectInfo, ConnectTarget, LinkEvent};
use esp32_nimble::{BLEAddress, BLEAddressType, BLEClient, BLEDevice, BLEError, BLEScan};
use esp_idf_hal::task::block_on;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Scan interval and window in 0.625 ms units.
const SCAN_INTERVAL: u16 = 100;
const SCAN_WINDOW: u16 = 99;

fn platform_error(e: BLEError) -> BleRadioError {
    BleRadioError::Rejected(format!("{:?}", e))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// BLE central on the ESP32 NimBLE host.
pub struct NimbleRadio {
    client: Mutex<Option<BLEClient>>,
    events: Arc<Mutex<VecDeque<LinkEvent>>>,
    link_address: Arc<Mutex<Option<String>>>,
}

impl NimbleRadio {
    pub fn new() -> Self {
        Self {
            client: Mutex::new(None),
            events: Arc::new(Mutex::new(VecDeque::new())),
            link_address: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for NimbleRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl BleRadio for NimbleRadio {
    fn init(&self) -> Result<(), BleRadioError> {
        // take() initialises the NimBLE host on first use
        let _ = BLEDevice::take();
        info!("[ble] NimBLE host ready");
        Ok(())
    }

    fn deinit(&self) -> Result<(), BleRadioError> {
        lock(&self.client).take();
        BLEDevice::deinit().map_err(|e| BleRadioError::Platform(e.code()))
    }

    fn scan(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
        on_advert: &mut dyn FnMut(Advertisement),
    ) -> Result<(), BleRadioError> {
        let device = BLEDevice::take();
        let mut scan = BLEScan::new();
        scan.active_scan(true).interval(SCAN_INTERVAL).window(SCAN_WINDOW);

        let duration_ms = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);
        block_on(async {
            scan.start(device, duration_ms, |found, data| {
                if cancel.is_cancelled() {
                    // Returning Some ends the scan early
                    return Some(());
                }
                on_advert(Advertisement {
                    address: found.addr().to_string(),
                    name: data.name().map(|n| n.to_string()),
                    service_uuid: data.service_uuids().next().map(|u| u.to_string()),
                    rssi: found.rssi() as i16,
                });
                None
            })
            .await
        })
        .map(|_| ())
        .map_err(platform_error)
    }

    fn connect(&self, target: &ConnectTarget, _timeout: Duration) -> Result<ConnectInfo, BleRadioError> {
        let address = BLEAddress::from_str(&target.address, BLEAddressType::Public)
            .ok_or_else(|| BleRadioError::Rejected(format!("bad address {}", target.address)))?;

        let mut client = BLEClient::new();
        let events = self.events.clone();
        let link_address = self.link_address.clone();
        client.on_disconnect(move |reason| {
            let address = lock(&link_address).take();
            if let Some(address) = address {
                lock(&events).push_back(LinkEvent::Disconnected {
                    address,
                    reason: Some(format!("reason 0x{:x}", reason)),
                });
            }
        });

        block_on(client.connect(&address)).map_err(platform_error)?;
        let rssi = client.get_rssi().ok().map(i16::from);
        *lock(&self.link_address) = Some(target.address.clone());
        *lock(&self.client) = Some(client);

        debug!("[ble] NimBLE link up to {}", target.address);
        Ok(ConnectInfo {
            address: target.address.clone(),
            name: target.name.clone(),
            service_uuid: target.service_uuid.clone(),
            rssi,
        })
    }

    fn disconnect(&self, address: &str) -> Result<(), BleRadioError> {
        // The callback must see a local disconnect without a link-loss reason
        let was_ours = lock(&self.link_address).take();
        let result = match lock(&self.client).as_mut() {
            Some(client) => client.disconnect().map_err(platform_error),
            None => Ok(()),
        };
        lock(&self.events).push_back(LinkEvent::Disconnected {
            address: was_ours.unwrap_or_else(|| address.to_string()),
            reason: None,
        });
        if let Err(e) = &result {
            warn!("[ble] NimBLE disconnect failed: {}", e);
        }
        result
    }

    fn poll_link_event(&self) -> Option<LinkEvent> {
        // try_lock: the NimBLE host task may hold the queue briefly
        match self.events.try_lock() {
            Ok(mut events) => events.pop_front(),
            Err(_) => None,
        }
    }
}
