//! ESP-IDF station driver behind [`WifiRadio`].

use super::platform::{AccessPoint, LinkEvent, LinkInfo, WifiRadio, WifiRadioError};
use crate::persistence::SavedNetwork;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use esp_idf_sys::EspError;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How often the link RSSI is sampled.
const RSSI_INTERVAL: Duration = Duration::from_secs(5);

fn platform_error(e: EspError) -> WifiRadioError {
    WifiRadioError::Platform(e.code())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn format_bssid(bssid: &[u8; 6]) -> String {
    bssid
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn read_rssi() -> Option<i16> {
    let mut info = esp_idf_sys::wifi_ap_record_t::default();
    // SAFETY: the driver fills the record; it is only read on success
    let err = unsafe { esp_idf_sys::esp_wifi_sta_get_ap_info(&mut info) };
    (err == esp_idf_sys::ESP_OK).then_some(i16::from(info.rssi))
}

#[derive(Debug, Default)]
struct LinkWatch {
    ssid: Option<String>,
    last_rssi_sample: Option<Instant>,
    events: VecDeque<LinkEvent>,
}

/// Station-mode Wi-Fi on the ESP32.
pub struct EspWifiRadio {
    wifi: Mutex<BlockingWifi<EspWifi<'static>>>,
    watch: Mutex<LinkWatch>,
}

impl EspWifiRadio {
    /// Take the modem. The driver stays stopped until [`WifiRadio::start`].
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
    ) -> Result<Self, EspError> {
        let esp_wifi = EspWifi::new(modem, sysloop.clone(), nvs)?;
        let wifi = BlockingWifi::wrap(esp_wifi, sysloop)?;
        Ok(Self {
            wifi: Mutex::new(wifi),
            watch: Mutex::new(LinkWatch::default()),
        })
    }
}

impl WifiRadio for EspWifiRadio {
    fn start(&self) -> Result<(), WifiRadioError> {
        let mut wifi = lock(&self.wifi);
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))
            .map_err(platform_error)?;
        wifi.start().map_err(platform_error)?;
        info!("[wifi] Driver started");
        Ok(())
    }

    fn stop(&self) -> Result<(), WifiRadioError> {
        lock(&self.watch).ssid = None;
        lock(&self.wifi).stop().map_err(platform_error)
    }

    fn scan(&self, cancel: &CancellationToken) -> Result<Vec<AccessPoint>, WifiRadioError> {
        if cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        let mut wifi = lock(&self.wifi);
        if !wifi.is_started().map_err(platform_error)? {
            return Err(WifiRadioError::NotStarted);
        }
        let found = wifi.scan().map_err(platform_error)?;
        debug!("[wifi] Driver reported {} access points", found.len());
        Ok(found
            .into_iter()
            .map(|ap| AccessPoint {
                ssid: ap.ssid.as_str().to_string(),
                bssid: format_bssid(&ap.bssid),
                rssi: i16::from(ap.signal_strength),
                channel: ap.channel,
                open: matches!(ap.auth_method, None | Some(AuthMethod::None)),
            })
            .collect())
    }

    fn connect(&self, network: &SavedNetwork, _timeout: Duration) -> Result<LinkInfo, WifiRadioError> {
        let auth_method = if network.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        let config = Configuration::Client(ClientConfiguration {
            ssid: network
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| WifiRadioError::InvalidCredentials)?,
            password: network
                .password
                .as_str()
                .try_into()
                .map_err(|_| WifiRadioError::InvalidCredentials)?,
            auth_method,
            ..Default::default()
        });

        let mut wifi = lock(&self.wifi);
        if !wifi.is_started().map_err(platform_error)? {
            return Err(WifiRadioError::NotStarted);
        }
        wifi.set_configuration(&config).map_err(platform_error)?;

        // Bounded by the driver's own association timeout
        wifi.connect().map_err(|e| {
            warn!("[wifi] Association with {} failed: {:?}", network.ssid, e);
            WifiRadioError::AuthFailed
        })?;
        wifi.wait_netif_up().map_err(|_| WifiRadioError::NoAddress)?;
        let ip = wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .map(|info| info.ip)
            .ok();
        drop(wifi);

        let mut watch = lock(&self.watch);
        watch.ssid = Some(network.ssid.clone());
        watch.last_rssi_sample = Some(Instant::now());
        Ok(LinkInfo {
            ssid: network.ssid.clone(),
            rssi: read_rssi(),
            ip,
        })
    }

    fn disconnect(&self) -> Result<(), WifiRadioError> {
        lock(&self.wifi).disconnect().map_err(platform_error)?;
        let mut watch = lock(&self.watch);
        if watch.ssid.take().is_some() {
            watch.events.push_back(LinkEvent::Disconnected { reason: None });
        }
        Ok(())
    }

    fn poll_link_event(&self) -> Option<LinkEvent> {
        let mut watch = lock(&self.watch);
        if let Some(event) = watch.events.pop_front() {
            return Some(event);
        }
        watch.ssid.as_ref()?;

        // A worker holding the driver means no link to check right now
        let wifi = self.wifi.try_lock().ok()?;
        if !wifi.is_connected().unwrap_or(false) {
            drop(wifi);
            watch.ssid = None;
            return Some(LinkEvent::Disconnected {
                reason: Some("station disconnected".to_string()),
            });
        }
        drop(wifi);

        let due = watch
            .last_rssi_sample
            .map_or(true, |t| t.elapsed() >= RSSI_INTERVAL);
        if due {
            watch.last_rssi_sample = Some(Instant::now());
            return read_rssi().map(LinkEvent::Rssi);
        }
        None
    }
}
