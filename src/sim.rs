//! Simulated radios for host builds.
//!
//! [`SimBleRadio`] and [`SimWifiRadio`] share one [`SimAir`], which counts
//! how many scan/connect operations are on the air at once. Tests use it to
//! check that arbitration never lets both subsystems drive the radio
//! together; the host console uses the same radios with scripted devices.
//!
//! Scans last [`DEFAULT_SCAN_TIME`] regardless of the requested duration so
//! tests run quickly. Connects can be held open and released to exercise
//! timeouts deterministically.

use crate::ble::{Advertisement, BleRadio, BleRadioError, ConnectInfo, ConnectTarget};
use crate::events::{EventSink, RadioKind, StateChange, StatusUpdate};
use crate::persistence::SavedNetwork;
use crate::registry::ManagedDevice;
use crate::wifi::{AccessPoint, LinkInfo, WifiRadio, WifiRadioError};
use crate::{ble, wifi};
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How long a simulated scan stays on the air.
pub const DEFAULT_SCAN_TIME: Duration = Duration::from_millis(20);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared simulated air interface.
#[derive(Debug, Default)]
pub struct SimAir {
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl SimAir {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Highest number of simultaneous radio operations observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Operations currently on the air.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn enter(&self) -> AirGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        AirGuard(self)
    }
}

struct AirGuard<'a>(&'a SimAir);

impl Drop for AirGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sleep for `time` in small steps, returning early on cancellation.
fn on_air(time: Duration, cancel: &CancellationToken) {
    let deadline = Instant::now() + time;
    while Instant::now() < deadline && !cancel.is_cancelled() {
        thread::sleep(Duration::from_millis(2));
    }
}

/// Gate that holds connect attempts until released.
#[derive(Debug, Default)]
struct Gate {
    held: Mutex<bool>,
    released: Condvar,
}

impl Gate {
    fn set_held(&self, held: bool) {
        *lock(&self.held) = held;
        if !held {
            self.released.notify_all();
        }
    }

    fn pass(&self) {
        let guard = lock(&self.held);
        let _guard = self
            .released
            .wait_while(guard, |held| *held)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

#[derive(Debug)]
struct SimBle {
    initialized: bool,
    init_calls: usize,
    deinit_calls: usize,
    adverts: Vec<Advertisement>,
    scan_time: Duration,
    scan_error: Option<BleRadioError>,
    connect_error: Option<BleRadioError>,
    silent_disconnects: bool,
    link: Option<String>,
    events: VecDeque<ble::LinkEvent>,
    connect_log: Vec<String>,
    disconnect_log: Vec<String>,
}

/// Simulated BLE stack with scripted advertisements.
#[derive(Debug)]
pub struct SimBleRadio {
    air: Arc<SimAir>,
    inner: Mutex<SimBle>,
    gate: Gate,
}

impl SimBleRadio {
    pub fn new(air: Arc<SimAir>) -> Self {
        Self {
            air,
            inner: Mutex::new(SimBle {
                initialized: false,
                init_calls: 0,
                deinit_calls: 0,
                adverts: Vec::new(),
                scan_time: DEFAULT_SCAN_TIME,
                scan_error: None,
                connect_error: None,
                silent_disconnects: false,
                link: None,
                events: VecDeque::new(),
                connect_log: Vec::new(),
                disconnect_log: Vec::new(),
            }),
            gate: Gate::default(),
        }
    }

    /// Advertisement reports delivered by every scan, in order.
    pub fn set_adverts(&self, adverts: Vec<Advertisement>) {
        lock(&self.inner).adverts = adverts;
    }

    pub fn set_scan_time(&self, time: Duration) {
        lock(&self.inner).scan_time = time;
    }

    /// Make scans fail with `error`.
    pub fn set_scan_error(&self, error: Option<BleRadioError>) {
        lock(&self.inner).scan_error = error;
    }

    /// Make connects fail with `error`.
    pub fn set_connect_error(&self, error: Option<BleRadioError>) {
        lock(&self.inner).connect_error = error;
    }

    /// Suppress the disconnect notification after a local disconnect.
    pub fn set_silent_disconnects(&self, silent: bool) {
        lock(&self.inner).silent_disconnects = silent;
    }

    /// Hold connect attempts on the air until [`release_connects`](Self::release_connects).
    pub fn hold_connects(&self) {
        self.gate.set_held(true);
    }

    pub fn release_connects(&self) {
        self.gate.set_held(false);
    }

    /// Drop the current link as if the peer went away.
    pub fn drop_link(&self, reason: &str) -> bool {
        let mut inner = lock(&self.inner);
        match inner.link.take() {
            Some(address) => {
                inner.events.push_back(ble::LinkEvent::Disconnected {
                    address,
                    reason: Some(reason.to_string()),
                });
                true
            }
            None => false,
        }
    }

    /// Report a new RSSI for the current link.
    pub fn report_rssi(&self, rssi: i16) {
        lock(&self.inner).events.push_back(ble::LinkEvent::Rssi(rssi));
    }

    /// Addresses passed to `connect`, in order.
    pub fn connect_log(&self) -> Vec<String> {
        lock(&self.inner).connect_log.clone()
    }

    /// Addresses passed to `disconnect`, in order.
    pub fn disconnect_log(&self) -> Vec<String> {
        lock(&self.inner).disconnect_log.clone()
    }

    pub fn link(&self) -> Option<String> {
        lock(&self.inner).link.clone()
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.inner).initialized
    }

    pub fn init_calls(&self) -> usize {
        lock(&self.inner).init_calls
    }

    pub fn deinit_calls(&self) -> usize {
        lock(&self.inner).deinit_calls
    }
}

impl BleRadio for SimBleRadio {
    fn init(&self) -> Result<(), BleRadioError> {
        let mut inner = lock(&self.inner);
        inner.initialized = true;
        inner.init_calls += 1;
        Ok(())
    }

    fn deinit(&self) -> Result<(), BleRadioError> {
        let mut inner = lock(&self.inner);
        inner.initialized = false;
        inner.deinit_calls += 1;
        inner.link = None;
        Ok(())
    }

    fn scan(
        &self,
        _duration: Duration,
        cancel: &CancellationToken,
        on_advert: &mut dyn FnMut(Advertisement),
    ) -> Result<(), BleRadioError> {
        let _air = self.air.enter();
        let (adverts, scan_time) = {
            let inner = lock(&self.inner);
            if !inner.initialized {
                return Err(BleRadioError::NotInitialized);
            }
            if let Some(e) = &inner.scan_error {
                return Err(e.clone());
            }
            (inner.adverts.clone(), inner.scan_time)
        };
        for advert in adverts {
            if cancel.is_cancelled() {
                break;
            }
            on_advert(advert);
        }
        on_air(scan_time, cancel);
        Ok(())
    }

    fn connect(&self, target: &ConnectTarget, _timeout: Duration) -> Result<ConnectInfo, BleRadioError> {
        let _air = self.air.enter();
        lock(&self.inner).connect_log.push(target.address.clone());
        self.gate.pass();

        let mut inner = lock(&self.inner);
        if !inner.initialized {
            return Err(BleRadioError::NotInitialized);
        }
        if let Some(e) = &inner.connect_error {
            return Err(e.clone());
        }
        let advert = inner
            .adverts
            .iter()
            .rev()
            .find(|a| a.address.eq_ignore_ascii_case(&target.address))
            .cloned()
            .ok_or(BleRadioError::NotFound)?;
        inner.link = Some(advert.address.to_ascii_lowercase());
        Ok(ConnectInfo {
            address: advert.address,
            name: advert.name.unwrap_or_else(|| target.name.clone()),
            service_uuid: advert.service_uuid,
            rssi: Some(advert.rssi),
        })
    }

    fn disconnect(&self, address: &str) -> Result<(), BleRadioError> {
        let mut inner = lock(&self.inner);
        inner.disconnect_log.push(address.to_string());
        if inner
            .link
            .as_deref()
            .is_some_and(|l| l.eq_ignore_ascii_case(address))
        {
            inner.link = None;
        }
        if !inner.silent_disconnects {
            inner.events.push_back(ble::LinkEvent::Disconnected {
                address: address.to_ascii_lowercase(),
                reason: None,
            });
        }
        Ok(())
    }

    fn poll_link_event(&self) -> Option<ble::LinkEvent> {
        lock(&self.inner).events.pop_front()
    }
}

#[derive(Debug)]
struct SimWifi {
    started: bool,
    start_calls: usize,
    stop_calls: usize,
    access_points: Vec<AccessPoint>,
    passwords: HashMap<String, String>,
    scan_time: Duration,
    scan_error: Option<WifiRadioError>,
    connect_error: Option<WifiRadioError>,
    link: Option<String>,
    events: VecDeque<wifi::LinkEvent>,
    connect_log: Vec<String>,
    disconnect_calls: usize,
}

/// Simulated Wi-Fi driver with scripted access points.
#[derive(Debug)]
pub struct SimWifiRadio {
    air: Arc<SimAir>,
    inner: Mutex<SimWifi>,
    gate: Gate,
}

impl SimWifiRadio {
    pub fn new(air: Arc<SimAir>) -> Self {
        Self {
            air,
            inner: Mutex::new(SimWifi {
                started: false,
                start_calls: 0,
                stop_calls: 0,
                access_points: Vec::new(),
                passwords: HashMap::new(),
                scan_time: DEFAULT_SCAN_TIME,
                scan_error: None,
                connect_error: None,
                link: None,
                events: VecDeque::new(),
                connect_log: Vec::new(),
                disconnect_calls: 0,
            }),
            gate: Gate::default(),
        }
    }

    /// Add an access point. A non-empty `password` makes it secured.
    pub fn add_access_point(&self, ssid: &str, rssi: i16, password: &str) {
        let mut inner = lock(&self.inner);
        let n = inner.access_points.len();
        inner.access_points.push(AccessPoint {
            ssid: ssid.to_string(),
            bssid: format!("02:00:00:00:00:{:02x}", n + 1),
            rssi,
            channel: 1 + (n % 11) as u8,
            open: password.is_empty(),
        });
        inner.passwords.insert(ssid.to_string(), password.to_string());
    }

    pub fn clear_access_points(&self) {
        let mut inner = lock(&self.inner);
        inner.access_points.clear();
        inner.passwords.clear();
    }

    pub fn set_scan_time(&self, time: Duration) {
        lock(&self.inner).scan_time = time;
    }

    pub fn set_scan_error(&self, error: Option<WifiRadioError>) {
        lock(&self.inner).scan_error = error;
    }

    pub fn set_connect_error(&self, error: Option<WifiRadioError>) {
        lock(&self.inner).connect_error = error;
    }

    pub fn hold_connects(&self) {
        self.gate.set_held(true);
    }

    pub fn release_connects(&self) {
        self.gate.set_held(false);
    }

    /// Drop the station link as if the access point went away.
    pub fn drop_link(&self, reason: &str) -> bool {
        let mut inner = lock(&self.inner);
        if inner.link.take().is_none() {
            return false;
        }
        inner.events.push_back(wifi::LinkEvent::Disconnected {
            reason: Some(reason.to_string()),
        });
        true
    }

    pub fn report_rssi(&self, rssi: i16) {
        lock(&self.inner).events.push_back(wifi::LinkEvent::Rssi(rssi));
    }

    /// SSIDs passed to `connect`, in order.
    pub fn connect_log(&self) -> Vec<String> {
        lock(&self.inner).connect_log.clone()
    }

    pub fn disconnect_calls(&self) -> usize {
        lock(&self.inner).disconnect_calls
    }

    pub fn link(&self) -> Option<String> {
        lock(&self.inner).link.clone()
    }

    pub fn is_started(&self) -> bool {
        lock(&self.inner).started
    }

    pub fn start_calls(&self) -> usize {
        lock(&self.inner).start_calls
    }

    pub fn stop_calls(&self) -> usize {
        lock(&self.inner).stop_calls
    }
}

impl WifiRadio for SimWifiRadio {
    fn start(&self) -> Result<(), WifiRadioError> {
        let mut inner = lock(&self.inner);
        inner.started = true;
        inner.start_calls += 1;
        Ok(())
    }

    fn stop(&self) -> Result<(), WifiRadioError> {
        let mut inner = lock(&self.inner);
        inner.started = false;
        inner.stop_calls += 1;
        inner.link = None;
        Ok(())
    }

    fn scan(&self, cancel: &CancellationToken) -> Result<Vec<AccessPoint>, WifiRadioError> {
        let _air = self.air.enter();
        let (aps, scan_time) = {
            let inner = lock(&self.inner);
            if !inner.started {
                return Err(WifiRadioError::NotStarted);
            }
            if let Some(e) = &inner.scan_error {
                return Err(e.clone());
            }
            (inner.access_points.clone(), inner.scan_time)
        };
        on_air(scan_time, cancel);
        Ok(aps)
    }

    fn connect(&self, network: &SavedNetwork, _timeout: Duration) -> Result<LinkInfo, WifiRadioError> {
        let _air = self.air.enter();
        lock(&self.inner).connect_log.push(network.ssid.clone());
        self.gate.pass();

        let mut inner = lock(&self.inner);
        if !inner.started {
            return Err(WifiRadioError::NotStarted);
        }
        if let Some(e) = &inner.connect_error {
            return Err(e.clone());
        }
        let ap = inner
            .access_points
            .iter()
            .filter(|ap| ap.ssid == network.ssid)
            .max_by_key(|ap| ap.rssi)
            .cloned()
            .ok_or(WifiRadioError::NotFound)?;
        if inner.passwords.get(&network.ssid) != Some(&network.password) {
            return Err(WifiRadioError::AuthFailed);
        }
        inner.link = Some(ap.ssid.clone());
        Ok(LinkInfo {
            ssid: ap.ssid,
            rssi: Some(ap.rssi),
            ip: Some(Ipv4Addr::new(192, 168, 4, 2)),
        })
    }

    fn disconnect(&self) -> Result<(), WifiRadioError> {
        let mut inner = lock(&self.inner);
        inner.disconnect_calls += 1;
        inner.link = None;
        inner
            .events
            .push_back(wifi::LinkEvent::Disconnected { reason: None });
        Ok(())
    }

    fn poll_link_event(&self) -> Option<wifi::LinkEvent> {
        lock(&self.inner).events.pop_front()
    }
}

/// One event captured by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    ScanComplete {
        radio: RadioKind,
        success: bool,
        /// Device ids in the order reported.
        ids: Vec<String>,
        rssi: Vec<Option<i16>>,
    },
    StateChange(StateChange),
    Status(StatusUpdate),
}

/// Event sink that records everything for later inspection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    pub fn state_changes(&self) -> Vec<StateChange> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                RecordedEvent::StateChange(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn scan_completions(&self) -> Vec<RecordedEvent> {
        lock(&self.events)
            .iter()
            .filter(|e| matches!(e, RecordedEvent::ScanComplete { .. }))
            .cloned()
            .collect()
    }

    pub fn statuses(&self) -> Vec<StatusUpdate> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                RecordedEvent::Status(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl EventSink for RecordingSink {
    fn on_scan_complete(&self, radio: RadioKind, success: bool, devices: &[ManagedDevice]) {
        lock(&self.events).push(RecordedEvent::ScanComplete {
            radio,
            success,
            ids: devices.iter().map(|d| d.id.to_string()).collect(),
            rssi: devices.iter().map(|d| d.rssi).collect(),
        });
    }

    fn on_state_change(&self, change: &StateChange) {
        lock(&self.events).push(RecordedEvent::StateChange(change.clone()));
    }

    fn on_status(&self, update: StatusUpdate) {
        lock(&self.events).push(RecordedEvent::Status(update));
    }
}

/// Run `step` every millisecond until it returns `true` or `timeout` elapses.
pub fn run_until(timeout: Duration, mut step: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if step() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert(address: &str, rssi: i16) -> Advertisement {
        Advertisement {
            address: address.into(),
            name: Some("Dev".into()),
            service_uuid: None,
            rssi,
        }
    }

    #[test]
    fn test_air_counts_concurrency() {
        let air = SimAir::new();
        {
            let _a = air.enter();
            let _b = air.enter();
            assert_eq!(air.active(), 2);
        }
        assert_eq!(air.active(), 0);
        assert_eq!(air.max_concurrency(), 2);
    }

    #[test]
    fn test_ble_scan_requires_init() {
        let radio = SimBleRadio::new(SimAir::new());
        let cancel = CancellationToken::new();
        let result = radio.scan(Duration::from_secs(5), &cancel, &mut |_| {});
        assert_eq!(result, Err(BleRadioError::NotInitialized));
    }

    #[test]
    fn test_ble_connect_and_drop_link() {
        let radio = SimBleRadio::new(SimAir::new());
        radio.set_adverts(vec![advert("AA:00:00:00:00:01", -60)]);
        radio.init().unwrap();
        let target = ConnectTarget {
            id: crate::registry::PrimaryId::address("aa:00:00:00:00:01"),
            address: "aa:00:00:00:00:01".into(),
            name: String::new(),
            service_uuid: None,
        };
        let info = radio.connect(&target, Duration::from_secs(1)).unwrap();
        assert_eq!(info.rssi, Some(-60));
        assert_eq!(radio.link().as_deref(), Some("aa:00:00:00:00:01"));

        assert!(radio.drop_link("supervision timeout"));
        assert!(matches!(
            radio.poll_link_event(),
            Some(ble::LinkEvent::Disconnected { reason: Some(_), .. })
        ));
        assert!(radio.poll_link_event().is_none());
    }

    #[test]
    fn test_held_connect_waits_for_release() {
        let air = SimAir::new();
        let radio = Arc::new(SimWifiRadio::new(air.clone()));
        radio.add_access_point("Home", -50, "password1");
        radio.start().unwrap();
        radio.hold_connects();

        let worker = {
            let radio = radio.clone();
            thread::spawn(move || {
                let network = SavedNetwork::new("Home", "password1").unwrap();
                radio.connect(&network, Duration::from_secs(1))
            })
        };
        assert!(run_until(Duration::from_secs(2), || air.active() == 1));
        radio.release_connects();
        let link = worker.join().unwrap().unwrap();
        assert_eq!(link.ssid, "Home");
        assert_eq!(air.active(), 0);
    }

    #[test]
    fn test_wifi_wrong_password_rejected() {
        let radio = SimWifiRadio::new(SimAir::new());
        radio.add_access_point("Home", -50, "password1");
        radio.start().unwrap();
        let network = SavedNetwork::new("Home", "password2").unwrap();
        assert_eq!(
            radio.connect(&network, Duration::from_secs(1)),
            Err(WifiRadioError::AuthFailed)
        );
    }
}
