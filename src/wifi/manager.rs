//! Wi-Fi connectivity manager.
//!
//! Station-mode counterpart to [`crate::ble::BleManager`]: the same
//! tick-driven state machine, worker threads and single pending slot, with
//! saved networks in place of paired devices.
//!
//! Starting the driver is deferred while BLE holds the radio
//! ([`WifiState::Enabling`]). Stopping it waits for any in-flight worker
//! ([`WifiState::Disabling`]); neither blocks the caller.

use super::platform::{LinkEvent, LinkInfo, WifiRadio};
use super::state::{PendingOperation, WifiState};
use super::worker::{run_connect, run_scan, ConnectOutcome, ScanOutcome};
use crate::arbiter::{NoPeer, RadioActivity, RadioArbiter};
use crate::config::{ConfigError, WifiManagerConfig};
use crate::events::{
    bars_from_rssi, ConnectionState, EventSink, RadioKind, StateChange, StatusTracker,
};
use crate::persistence::{PersistenceError, SavedNetwork, SavedNetworkStore, UpsertOutcome};
use crate::reconnect::ReconnectTimer;
use crate::registry::{DeviceRegistry, ManagedDevice, PersistedEntry, PrimaryId, ScanHit};
use crate::worker::{drain_hits, hit_channel, spawn_worker, wait_until, Worker, WorkerPoll};
use log::{debug, error, info, warn};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

enum ActiveOp {
    Scan {
        worker: Worker<ScanOutcome>,
        hits: mpsc::Receiver<ScanHit>,
        auto_connect: bool,
        deadline: Instant,
    },
    Connect {
        worker: Worker<ConnectOutcome>,
        ssid: String,
        deadline: Instant,
    },
}

enum Abandoned {
    Scan(Worker<ScanOutcome>),
    Connect(Worker<ConnectOutcome>),
}

#[derive(Debug, Clone)]
struct Link {
    id: PrimaryId,
    ssid: String,
    rssi: Option<i16>,
    ip: Option<Ipv4Addr>,
}

fn persisted_entry(network: &SavedNetwork) -> PersistedEntry {
    PersistedEntry {
        id: PrimaryId::ssid(&network.ssid),
        name: network.ssid.clone(),
        address: network.ssid.clone(),
        service_uuid: None,
    }
}

/// Wi-Fi connectivity manager.
pub struct WifiManager {
    config: WifiManagerConfig,
    radio: Arc<dyn WifiRadio>,
    store: Box<dyn SavedNetworkStore>,
    registry: DeviceRegistry,
    sink: Arc<dyn EventSink>,
    activity: Arc<RadioActivity>,
    peer: Arc<dyn RadioArbiter>,
    state: WifiState,
    driver_started: bool,
    disabling_deadline: Option<Instant>,
    op: Option<ActiveOp>,
    abandoned: Option<Abandoned>,
    pending: Option<PendingOperation>,
    link: Option<Link>,
    local_disconnect: bool,
    disconnect_deadline: Option<Instant>,
    reconnect: ReconnectTimer,
    status: StatusTracker,
}

impl WifiManager {
    /// Create a disabled manager.
    pub fn new(
        config: WifiManagerConfig,
        radio: Arc<dyn WifiRadio>,
        store: Box<dyn SavedNetworkStore>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            reconnect: ReconnectTimer::new(config.reconnect_interval(), config.auto_reconnect),
            config,
            radio,
            store,
            registry: DeviceRegistry::new(),
            sink,
            activity: Arc::new(RadioActivity::new()),
            peer: Arc::new(NoPeer),
            state: WifiState::Disabled,
            driver_started: false,
            disabling_deadline: None,
            op: None,
            abandoned: None,
            pending: None,
            link: None,
            local_disconnect: false,
            disconnect_deadline: None,
            status: StatusTracker::new(RadioKind::Wifi),
        })
    }

    pub fn state(&self) -> WifiState {
        self.state
    }

    pub fn config(&self) -> &WifiManagerConfig {
        &self.config
    }

    /// Whether a scan or connect currently holds the radio.
    pub fn is_busy(&self) -> bool {
        self.op.is_some() || self.abandoned.is_some()
    }

    /// Busy query to hand to the BLE manager.
    pub fn arbiter(&self) -> Arc<dyn RadioArbiter> {
        self.activity.clone()
    }

    /// Attach the BLE manager's busy query.
    pub fn set_peer(&mut self, peer: Arc<dyn RadioArbiter>) {
        self.peer = peer;
    }

    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        self.reconnect.set_enabled(enabled);
    }

    pub fn auto_reconnect(&self) -> bool {
        self.reconnect.is_enabled()
    }

    /// Handle to the network registry for UI-side reads.
    pub fn registry(&self) -> DeviceRegistry {
        self.registry.clone()
    }

    pub fn pending_operation(&self) -> Option<&PendingOperation> {
        self.pending.as_ref()
    }

    /// The network the station is associated with.
    pub fn connected_network(&self) -> Option<ManagedDevice> {
        self.link.as_ref().and_then(|l| self.registry.get(&l.id))
    }

    /// Address assigned on the current link.
    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        self.link.as_ref().and_then(|l| l.ip)
    }

    /// SSIDs of the saved networks.
    pub fn saved_networks(&self) -> Vec<String> {
        self.load_networks()
            .iter()
            .map(|n| n.ssid.clone())
            .collect()
    }

    /// Registry entries in display order.
    pub fn get_display_networks(&self) -> Vec<ManagedDevice> {
        self.registry.display_list()
    }

    /// Enable the manager. The driver starts as soon as BLE leaves the radio.
    pub fn enable(&mut self) {
        if self.state != WifiState::Disabled {
            debug!("[wifi] Already enabled");
            return;
        }
        self.reload_saved();
        self.transition(WifiState::Enabling);
        self.notify(None, None);
        self.try_start(Instant::now());
        self.publish();
    }

    /// Disconnect and stop the driver.
    ///
    /// With a worker in flight the manager passes through
    /// [`WifiState::Disabling`] and finishes on a later tick.
    pub fn disable(&mut self) {
        match self.state {
            WifiState::Disabled | WifiState::Disabling => return,
            WifiState::Enabling => {
                self.transition(WifiState::Disabled);
                self.notify(None, None);
                self.publish();
                return;
            }
            _ => {}
        }
        info!("[wifi] Disabling");
        self.pending = None;
        if self.link.is_some() {
            self.disconnect();
        }

        if let Some(op) = &self.op {
            if let ActiveOp::Scan { worker, .. } = op {
                worker.cancel();
            }
            self.disabling_deadline = Some(Instant::now() + self.config.disconnect_timeout());
            self.transition(WifiState::Disabling);
            self.notify(None, None);
            self.publish();
            return;
        }
        self.finish_disable();
        self.publish();
    }

    /// Scan for access points.
    ///
    /// Returns `false` if disabled or already scanning or connecting. While
    /// BLE holds the radio the scan waits in the pending slot.
    pub fn start_scan(&mut self) -> bool {
        self.request_scan(false)
    }

    /// Scan, then connect to the strongest saved network in range.
    pub fn start_scan_and_attempt_auto_connect(&mut self) -> bool {
        self.request_scan(true)
    }

    /// Connect to `ssid`.
    ///
    /// With `password`, the credentials are saved once the link is up.
    /// Without, saved credentials are used, or the network is joined as
    /// open if none are saved.
    pub fn connect(&mut self, ssid: &str, password: Option<&str>) -> bool {
        if !self.state.is_enabled() {
            warn!("[wifi] Connect rejected: {:?}", self.state);
            return false;
        }
        let (network, save) = match password {
            Some(password) => match SavedNetwork::new(ssid, password) {
                Ok(network) => (network, true),
                Err(e) => {
                    warn!("[wifi] Connect to {} rejected: {}", ssid, e);
                    return false;
                }
            },
            None => match self.saved(ssid) {
                Some(network) => (network, false),
                None => match SavedNetwork::open(ssid) {
                    Ok(network) => (network, true),
                    Err(e) => {
                        warn!("[wifi] Connect to {} rejected: {}", ssid, e);
                        return false;
                    }
                },
            },
        };

        if self.link.as_ref().is_some_and(|l| l.ssid == ssid) {
            debug!("[wifi] Already connected to {}", ssid);
            if save {
                self.persist_network(&network);
                self.reload_saved();
            }
            return true;
        }
        if matches!(&self.op, Some(ActiveOp::Connect { ssid: s, .. }) if s == ssid) {
            return true;
        }
        if self.link.is_some() {
            self.disconnect();
        }
        if self.op.is_some() {
            if let Some(previous) = self.pending.take() {
                debug!("[wifi] Connect to {} supersedes {:?}", ssid, previous);
            }
            self.pending = Some(PendingOperation::Connect { network, save });
            info!("[wifi] Connect to {} queued", ssid);
            self.publish();
            return true;
        }
        if let Some(previous) = self.pending.take() {
            debug!("[wifi] Connect to {} supersedes {:?}", ssid, previous);
        }

        let accepted = self.start_or_defer_connect(Instant::now(), network, save);
        self.publish();
        accepted
    }

    /// Disconnect the station link.
    ///
    /// Waits for the driver's notification, bounded by the disconnect
    /// timeout. Auto-reconnect stays off until the next successful connect.
    pub fn disconnect(&mut self) {
        if self.link.is_some() {
            self.request_local_disconnect(Instant::now());
            let timeout = self.config.disconnect_timeout();
            let confirmed = wait_until(timeout, || {
                self.poll_link_events(Instant::now());
                self.link.is_none()
            });
            if !confirmed {
                warn!("[wifi] Disconnect not confirmed within {:?}; forcing", timeout);
                self.link_lost(Instant::now(), None);
            }
        }
        self.publish();
    }

    /// Save credentials without connecting.
    pub fn save_network(&mut self, ssid: &str, password: &str) -> Result<(), PersistenceError> {
        let network = SavedNetwork::new(ssid, password)?;
        match self.store.save_network(&network)? {
            UpsertOutcome::Inserted => info!("[wifi] Saved network {}", ssid),
            UpsertOutcome::Updated(_) => info!("[wifi] Updated credentials for {}", ssid),
        }
        self.reload_saved();
        self.publish();
        Ok(())
    }

    /// Forget a saved network, disconnecting first if it is the current one.
    ///
    /// Returns `true` if the network was saved.
    pub fn forget_network(&mut self, ssid: &str) -> bool {
        if self.link.as_ref().is_some_and(|l| l.ssid == ssid) {
            info!("[wifi] Disconnecting {} before forgetting it", ssid);
            self.disconnect();
        }
        if matches!(&self.pending, Some(PendingOperation::Connect { network, .. }) if network.ssid == ssid)
        {
            self.pending = None;
        }
        self.reconnect.forget_if(&PrimaryId::ssid(ssid));

        let removed = match self.store.remove_network(ssid) {
            Ok(removed) => removed,
            Err(e) => {
                error!("[wifi] Failed to forget {}: {}", ssid, e);
                false
            }
        };
        self.reload_saved();
        if removed {
            info!("[wifi] Forgot network {}", ssid);
        }
        self.publish();
        removed
    }

    /// Drive the state machine. Never blocks.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// [`tick`](Self::tick) at an explicit time.
    pub fn tick_at(&mut self, now: Instant) {
        self.poll_abandoned();
        self.poll_link_events(now);

        match self.state {
            WifiState::Disabled => {}
            WifiState::Enabling => self.try_start(now),
            WifiState::Disabling => self.poll_disabling(now),
            WifiState::ConnectionFailed => {
                self.transition(self.idle_state());
                self.reconnect.disconnected(now);
                self.notify(None, None);
            }
            WifiState::Scanning => self.poll_scan(now),
            WifiState::Connecting => self.poll_connect(now),
            WifiState::Disconnected | WifiState::Connected => self.run_pending(now),
        }

        if self.state == WifiState::Disconnected && self.pending.is_none() && self.op.is_none() {
            if let Some(id) = self.reconnect.due(now) {
                match self.saved(id.as_str()) {
                    Some(network) => {
                        info!("[wifi] Auto-reconnecting to {}", id);
                        self.start_or_defer_connect(now, network, false);
                    }
                    None => self.reconnect.forget(),
                }
            }
        }
        self.publish();
    }

    fn idle_state(&self) -> WifiState {
        if self.link.is_some() {
            WifiState::Connected
        } else {
            WifiState::Disconnected
        }
    }

    fn transition(&mut self, state: WifiState) {
        if self.state != state {
            debug!("[wifi] {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Report the current state for `ssid` (or the link).
    fn notify(&self, ssid: Option<&str>, reason: Option<String>) {
        let ssid = ssid
            .map(str::to_string)
            .or_else(|| self.link.as_ref().map(|l| l.ssid.clone()))
            .unwrap_or_default();
        self.sink.on_state_change(&StateChange {
            state: ConnectionState::Wifi(self.state),
            address: ssid.clone(),
            name: ssid,
            service_uuid: None,
            reason,
        });
    }

    fn publish(&mut self) {
        self.activity.set_busy(self.is_busy());
        let bars = self.link.as_ref().map_or(0, |l| bars_from_rssi(l.rssi));
        if let Some(update) = self.status.update(self.state.status_code(), bars) {
            self.sink.on_status(update);
        }
    }

    fn radio_free(&self) -> bool {
        self.abandoned.is_none() && !self.peer.is_busy()
    }

    fn load_networks(&self) -> Vec<SavedNetwork> {
        self.store.load_saved_networks().unwrap_or_else(|e| {
            warn!("[wifi] Failed to load saved networks: {}", e);
            Vec::new()
        })
    }

    fn saved(&self, ssid: &str) -> Option<SavedNetwork> {
        self.load_networks().into_iter().find(|n| n.ssid == ssid)
    }

    fn reload_saved(&mut self) {
        let networks = self.load_networks();
        self.registry
            .sync_persisted(networks.iter().map(persisted_entry));
    }

    fn try_start(&mut self, now: Instant) {
        if !self.radio_free() {
            debug!("[wifi] Radio busy, driver start deferred");
            return;
        }
        if let Err(e) = self.radio.start() {
            error!("[wifi] Driver start failed: {}", e);
            self.transition(WifiState::Disabled);
            self.notify(None, Some(e.to_string()));
            return;
        }
        self.driver_started = true;
        self.transition(WifiState::Disconnected);
        self.reconnect.disconnected(now);
        self.notify(None, None);
        info!("[wifi] Enabled ({} saved networks)", self.registry.len());

        if self.config.auto_connect_on_enable && !self.load_networks().is_empty() {
            self.start_or_defer_scan(now, true);
        }
    }

    fn finish_disable(&mut self) {
        self.disabling_deadline = None;
        self.link = None;
        self.registry.reset_transient();
        if self.driver_started {
            if let Err(e) = self.radio.stop() {
                warn!("[wifi] Driver stop failed: {}", e);
            }
            self.driver_started = false;
            info!("[wifi] Driver stopped");
        }
        self.transition(WifiState::Disabled);
        self.notify(None, None);
    }

    fn poll_disabling(&mut self, now: Instant) {
        let mut late = None;
        let finished = match self.op.as_mut() {
            None => true,
            Some(ActiveOp::Scan { worker, .. }) => !matches!(worker.poll(), WorkerPoll::Pending),
            Some(ActiveOp::Connect { worker, .. }) => match worker.poll() {
                WorkerPoll::Pending => false,
                WorkerPoll::Ready(outcome) => {
                    late = Some(outcome);
                    true
                }
                WorkerPoll::Lost => true,
            },
        };
        if finished {
            self.op = None;
        } else if self.disabling_deadline.is_some_and(|d| now >= d) {
            warn!("[wifi] Worker still running at disable");
            self.abandoned = match self.op.take() {
                Some(ActiveOp::Scan { worker, .. }) => Some(Abandoned::Scan(worker)),
                Some(ActiveOp::Connect { worker, .. }) => Some(Abandoned::Connect(worker)),
                None => None,
            };
        } else {
            return;
        }
        if let Some(outcome) = late {
            self.handle_late_connect(outcome);
        }
        self.finish_disable();
    }

    fn request_scan(&mut self, auto_connect: bool) -> bool {
        if !self.state.is_enabled() {
            warn!("[wifi] Scan rejected: {:?}", self.state);
            return false;
        }
        if self.op.is_some()
            || self.pending.is_some()
            || matches!(self.state, WifiState::Scanning | WifiState::Connecting)
        {
            debug!("[wifi] Scan rejected: busy ({:?})", self.state);
            return false;
        }
        let accepted = self.start_or_defer_scan(Instant::now(), auto_connect);
        self.publish();
        accepted
    }

    fn start_or_defer_scan(&mut self, now: Instant, auto_connect: bool) -> bool {
        if !self.radio_free() {
            debug!("[wifi] Radio busy, deferring scan");
            self.pending = Some(PendingOperation::Scan { auto_connect });
            return true;
        }
        self.begin_scan(now, auto_connect)
    }

    fn begin_scan(&mut self, now: Instant, auto_connect: bool) -> bool {
        let (tx, rx) = hit_channel(
            self.config.scan_channel_capacity,
            self.config.backpressure_timeout(),
        );
        let radio = self.radio.clone();
        match spawn_worker("wifi-scan", move |cancel| run_scan(radio, cancel, tx)) {
            Ok(worker) => {
                self.registry.begin_scan_cycle();
                info!("[wifi] Scanning (auto-connect: {})", auto_connect);
                self.op = Some(ActiveOp::Scan {
                    worker,
                    hits: rx,
                    auto_connect,
                    deadline: now + self.config.scan_timeout(),
                });
                self.transition(WifiState::Scanning);
                self.publish();
                true
            }
            Err(e) => {
                error!("[wifi] Failed to spawn scan worker: {}", e);
                self.scan_failed("worker spawn failed");
                false
            }
        }
    }

    fn scan_failed(&mut self, reason: &str) {
        warn!("[wifi] Scan failed: {}", reason);
        self.transition(self.idle_state());
        self.sink.on_scan_complete(RadioKind::Wifi, false, &[]);
    }

    fn poll_scan(&mut self, now: Instant) {
        let (poll, timed_out) = match self.op.as_mut() {
            Some(ActiveOp::Scan {
                worker,
                hits,
                deadline,
                ..
            }) => {
                for hit in drain_hits(hits, self.config.max_hits_per_tick) {
                    self.registry.merge_hit(&hit, now);
                }
                let poll = worker.poll();
                let timed_out = matches!(poll, WorkerPoll::Pending) && now >= *deadline;
                (poll, timed_out)
            }
            _ => return,
        };
        let result = match poll {
            WorkerPoll::Ready(outcome) => match outcome.error {
                None => {
                    debug!(
                        "[wifi] {} networks heard, {} dropped",
                        outcome.networks, outcome.hits_dropped
                    );
                    Ok(())
                }
                Some(e) => Err(e.to_string()),
            },
            WorkerPoll::Lost => Err("worker lost".to_string()),
            WorkerPoll::Pending if timed_out => Err("scan timeout".to_string()),
            WorkerPoll::Pending => return,
        };

        let Some(ActiveOp::Scan {
            worker,
            mut hits,
            auto_connect,
            ..
        }) = self.op.take()
        else {
            return;
        };
        if timed_out {
            worker.cancel();
            self.abandoned = Some(Abandoned::Scan(worker));
        }
        for hit in drain_hits(&mut hits, usize::MAX) {
            self.registry.merge_hit(&hit, now);
        }
        drop(hits);

        if let Err(reason) = result {
            self.scan_failed(&reason);
            return;
        }
        let went_offline = self.registry.finish_scan_cycle();
        if went_offline > 0 {
            debug!("[wifi] {} networks went out of range", went_offline);
        }
        self.transition(self.idle_state());
        let networks = self.registry.display_list();
        info!("[wifi] Scan complete: {} networks", networks.len());
        self.sink.on_scan_complete(RadioKind::Wifi, true, &networks);

        if auto_connect && self.pending.is_none() && self.link.is_none() {
            self.auto_connect(now);
        }
    }

    /// Connect to the strongest saved network in range, if any.
    fn auto_connect(&mut self, now: Instant) {
        let saved = self.load_networks();
        let best = self
            .registry
            .strongest(|d| d.is_paired && saved.iter().any(|n| n.ssid == d.address));
        let Some(best) = best else {
            info!("[wifi] No saved network in range");
            return;
        };
        let Some(network) = saved.into_iter().find(|n| n.ssid == best.address) else {
            return;
        };
        info!(
            "[wifi] Auto-connecting to {} ({:?} dBm)",
            network.ssid, best.rssi
        );
        self.start_or_defer_connect(now, network, false);
    }

    fn start_or_defer_connect(&mut self, now: Instant, network: SavedNetwork, save: bool) -> bool {
        if !self.radio_free() {
            debug!("[wifi] Radio busy, deferring connect to {}", network.ssid);
            self.pending = Some(PendingOperation::Connect { network, save });
            return true;
        }
        self.begin_connect(now, network, save)
    }

    fn begin_connect(&mut self, now: Instant, network: SavedNetwork, save: bool) -> bool {
        let radio = self.radio.clone();
        let timeout = self.config.connect_timeout();
        let ssid = network.ssid.clone();
        match spawn_worker("wifi-connect", move |_| run_connect(radio, network, save, timeout)) {
            Ok(worker) => {
                info!("[wifi] Connecting to {}", ssid);
                self.transition(WifiState::Connecting);
                self.notify(Some(&ssid), None);
                self.op = Some(ActiveOp::Connect {
                    worker,
                    ssid,
                    deadline: now + timeout,
                });
                self.publish();
                true
            }
            Err(e) => {
                error!("[wifi] Failed to spawn connect worker: {}", e);
                self.connect_failed(&ssid, "worker spawn failed".to_string());
                false
            }
        }
    }

    fn connect_failed(&mut self, ssid: &str, reason: String) {
        warn!("[wifi] Connect to {} failed: {}", ssid, reason);
        self.transition(WifiState::ConnectionFailed);
        self.notify(Some(ssid), Some(reason));
    }

    fn poll_connect(&mut self, now: Instant) {
        let poll = match self.op.as_mut() {
            Some(ActiveOp::Connect { worker, .. }) => worker.poll(),
            _ => return,
        };
        match poll {
            WorkerPoll::Ready(outcome) => {
                self.op = None;
                self.finish_connect(outcome);
            }
            WorkerPoll::Lost => {
                if let Some(ActiveOp::Connect { ssid, .. }) = self.op.take() {
                    self.connect_failed(&ssid, "connect worker lost".to_string());
                }
            }
            WorkerPoll::Pending => {
                let timed_out =
                    matches!(&self.op, Some(ActiveOp::Connect { deadline, .. }) if now >= *deadline);
                if !timed_out {
                    return;
                }
                if let Some(ActiveOp::Connect { worker, ssid, .. }) = self.op.take() {
                    warn!(
                        "[wifi] Connect to {} timed out after {:?}",
                        ssid,
                        self.config.connect_timeout()
                    );
                    self.abandoned = Some(Abandoned::Connect(worker));
                    self.connect_failed(&ssid, "connect timeout".to_string());
                }
            }
        }
    }

    fn finish_connect(&mut self, outcome: ConnectOutcome) {
        let ConnectOutcome {
            network,
            save,
            result,
            elapsed,
        } = outcome;
        let info = match result {
            Ok(info) => info,
            Err(e) => {
                self.connect_failed(&network.ssid, e.to_string());
                return;
            }
        };
        let saved = if save {
            self.persist_network(&network)
        } else {
            true
        };
        if save {
            self.reload_saved();
        }
        let id = PrimaryId::ssid(&network.ssid);
        self.registry
            .mark_connected(&id, &network.ssid, &network.ssid, None, saved);
        if let Some(rssi) = info.rssi {
            self.registry.update_rssi(&id, rssi);
        }
        info!(
            "[wifi] Connected to {} in {:?} (ip {})",
            network.ssid,
            elapsed,
            info.ip.map_or_else(|| "pending".to_string(), |ip| ip.to_string())
        );
        self.link = Some(Link {
            id: id.clone(),
            ssid: network.ssid.clone(),
            rssi: info.rssi,
            ip: info.ip,
        });
        self.reconnect.connected(id);
        self.transition(WifiState::Connected);
        self.notify(None, None);
    }

    /// Save credentials after a successful connect. Returns whether they
    /// count as saved.
    fn persist_network(&mut self, network: &SavedNetwork) -> bool {
        match self.store.save_network(network) {
            Ok(UpsertOutcome::Inserted) => {
                info!("[wifi] Saved network {}", network.ssid);
                true
            }
            Ok(UpsertOutcome::Updated(_)) => true,
            Err(e) if e.is_full() => {
                warn!("[wifi] Not saving {}: {}", network.ssid, e);
                false
            }
            Err(e) => {
                error!("[wifi] Failed to persist {}: {}", network.ssid, e);
                true
            }
        }
    }

    fn poll_abandoned(&mut self) {
        let late = match self.abandoned.as_mut() {
            Some(Abandoned::Scan(worker)) => match worker.poll() {
                WorkerPoll::Pending => return,
                WorkerPoll::Ready(outcome) => {
                    debug!("[wifi] Discarding late scan result ({} networks)", outcome.networks);
                    None
                }
                WorkerPoll::Lost => None,
            },
            Some(Abandoned::Connect(worker)) => match worker.poll() {
                WorkerPoll::Pending => return,
                WorkerPoll::Ready(outcome) => Some(outcome),
                WorkerPoll::Lost => None,
            },
            None => return,
        };
        self.abandoned = None;
        if let Some(outcome) = late {
            self.handle_late_connect(outcome);
        }
    }

    /// Merge a connect result nobody is waiting for. Never fires a callback.
    fn handle_late_connect(&mut self, outcome: ConnectOutcome) {
        match outcome.result {
            Ok(LinkInfo { ssid, rssi, .. }) => {
                warn!(
                    "[wifi] Late connect to {} after {:?}; releasing link",
                    ssid, outcome.elapsed
                );
                if let Some(rssi) = rssi {
                    self.registry.update_rssi(&PrimaryId::ssid(&ssid), rssi);
                }
                if let Err(e) = self.radio.disconnect() {
                    warn!("[wifi] Failed to release {}: {}", ssid, e);
                }
            }
            Err(e) => debug!(
                "[wifi] Late connect failure for {}: {}",
                outcome.network.ssid, e
            ),
        }
    }

    fn run_pending(&mut self, now: Instant) {
        if self.op.is_some() || self.pending.is_none() || !self.radio_free() {
            return;
        }
        match self.pending.take() {
            Some(PendingOperation::Scan { auto_connect }) => {
                self.begin_scan(now, auto_connect);
            }
            Some(PendingOperation::Connect { network, save }) => {
                let linked_elsewhere = self.link.as_ref().is_some_and(|l| l.ssid != network.ssid);
                if linked_elsewhere {
                    if self.disconnect_deadline.is_none() {
                        self.request_local_disconnect(now);
                    }
                    self.pending = Some(PendingOperation::Connect { network, save });
                } else if self.link.is_none() {
                    self.begin_connect(now, network, save);
                }
            }
            None => {}
        }
    }

    fn request_local_disconnect(&mut self, now: Instant) {
        let Some(link) = &self.link else {
            return;
        };
        info!("[wifi] Disconnecting from {}", link.ssid);
        self.local_disconnect = true;
        self.disconnect_deadline = Some(now + self.config.disconnect_timeout());
        if let Err(e) = self.radio.disconnect() {
            warn!("[wifi] Driver disconnect failed: {}", e);
            self.link_lost(now, None);
        }
    }

    fn poll_link_events(&mut self, now: Instant) {
        while let Some(event) = self.radio.poll_link_event() {
            match event {
                LinkEvent::Disconnected { reason } => {
                    if self.link.is_some() {
                        self.link_lost(now, reason);
                    } else {
                        debug!("[wifi] Ignoring disconnect without a link");
                    }
                }
                LinkEvent::Rssi(rssi) => {
                    if let Some(link) = self.link.as_mut() {
                        link.rssi = Some(rssi);
                        self.registry.update_rssi(&link.id, rssi);
                    }
                }
            }
        }
        if let Some(deadline) = self.disconnect_deadline {
            if now >= deadline && self.link.is_some() {
                warn!("[wifi] Disconnect not confirmed; forcing");
                self.link_lost(now, None);
            }
        }
    }

    fn link_lost(&mut self, now: Instant, reason: Option<String>) {
        let Some(link) = self.link.take() else {
            return;
        };
        let local = std::mem::take(&mut self.local_disconnect);
        self.disconnect_deadline = None;
        self.registry.clear_connected();
        self.reconnect.disconnected(now);

        let reason = if local {
            info!("[wifi] Disconnected from {}", link.ssid);
            self.reconnect.forget();
            None
        } else {
            let reason = reason.unwrap_or_else(|| "link lost".to_string());
            warn!("[wifi] Link to {} lost: {}", link.ssid, reason);
            Some(reason)
        };
        if self.state == WifiState::Connected {
            self.transition(WifiState::Disconnected);
        }
        self.notify(Some(&link.ssid), reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::sim::{run_until, RecordedEvent, RecordingSink, SimAir, SimWifiRadio};
    use crate::wifi::WifiRadioError;
    use std::sync::Mutex;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(3);

    fn saved(ssid: &str) -> SavedNetwork {
        SavedNetwork::new(ssid, format!("{}-password", ssid.to_lowercase())).unwrap()
    }

    struct Harness {
        manager: WifiManager,
        radio: Arc<SimWifiRadio>,
        store: Arc<Mutex<MemoryStore>>,
        sink: Arc<RecordingSink>,
    }

    fn harness(store: MemoryStore) -> Harness {
        harness_with(
            store,
            WifiManagerConfig {
                auto_connect_on_enable: false,
                ..Default::default()
            },
        )
    }

    fn harness_with(store: MemoryStore, config: WifiManagerConfig) -> Harness {
        let radio = Arc::new(SimWifiRadio::new(SimAir::new()));
        let store = Arc::new(Mutex::new(store));
        let sink = RecordingSink::new();
        let manager =
            WifiManager::new(config, radio.clone(), Box::new(store.clone()), sink.clone()).unwrap();
        Harness {
            manager,
            radio,
            store,
            sink,
        }
    }

    impl Harness {
        fn add(&self, ssid: &str, rssi: i16) {
            self.radio
                .add_access_point(ssid, rssi, &format!("{}-password", ssid.to_lowercase()));
        }

        fn wait_for(&mut self, state: WifiState) -> bool {
            let manager = &mut self.manager;
            run_until(WAIT, || {
                manager.tick();
                manager.state() == state
            })
        }

        fn count_states(&self, state: WifiState) -> usize {
            self.sink
                .state_changes()
                .iter()
                .filter(|c| c.state == ConnectionState::Wifi(state))
                .count()
        }

        fn stored_ssids(&self) -> Vec<String> {
            self.store
                .lock()
                .unwrap()
                .load_saved_networks()
                .unwrap()
                .iter()
                .map(|n| n.ssid.clone())
                .collect()
        }
    }

    #[test]
    fn test_enable_starts_driver_and_lists_saved() {
        let mut h = harness(MemoryStore::new(8, 8).with_networks([saved("Home")]));
        h.manager.enable();
        assert_eq!(h.manager.state(), WifiState::Disconnected);
        assert!(h.radio.is_started());
        assert_eq!(h.manager.saved_networks(), vec!["Home".to_string()]);

        let networks = h.manager.get_display_networks();
        assert_eq!(networks.len(), 1);
        assert!(networks[0].is_paired && !networks[0].is_online);

        h.manager.enable();
        assert_eq!(h.radio.start_calls(), 1);
    }

    #[test]
    fn test_enable_waits_for_peer() {
        let mut h = harness(MemoryStore::new(8, 8));
        let peer = Arc::new(RadioActivity::new());
        h.manager.set_peer(peer.clone());

        peer.set_busy(true);
        h.manager.enable();
        assert_eq!(h.manager.state(), WifiState::Enabling);
        assert!(!h.manager.start_scan());
        h.manager.tick();
        assert!(!h.radio.is_started());

        peer.set_busy(false);
        h.manager.tick();
        assert_eq!(h.manager.state(), WifiState::Disconnected);
        assert!(h.radio.is_started());
    }

    #[test]
    fn test_auto_connect_picks_strongest_saved_network() {
        let mut h = harness(
            MemoryStore::new(8, 8).with_networks([saved("Home"), saved("Office")]),
        );
        h.add("Home", -70);
        h.add("Office", -50);
        h.add("Cafe", -30);
        h.manager.enable();

        assert!(h.manager.start_scan_and_attempt_auto_connect());
        assert_eq!(h.manager.state(), WifiState::Scanning);
        assert!(h.wait_for(WifiState::Connected));
        assert_eq!(h.radio.connect_log(), vec!["Office".to_string()]);
        assert_eq!(h.manager.connected_network().unwrap().address, "Office");
        assert!(h.manager.ip_address().is_some());

        match &h.sink.scan_completions()[0] {
            RecordedEvent::ScanComplete { success, ids, .. } => {
                assert!(success);
                assert_eq!(ids, &vec!["Office", "Home", "Cafe"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_auto_connect_on_enable() {
        let mut h = harness_with(
            MemoryStore::new(8, 8).with_networks([saved("Home")]),
            WifiManagerConfig::default(),
        );
        h.add("Home", -60);
        h.manager.enable();
        assert_eq!(h.manager.state(), WifiState::Scanning);
        assert!(h.wait_for(WifiState::Connected));
    }

    #[test]
    fn test_auto_connect_without_match_returns_to_disconnected() {
        let mut h = harness(MemoryStore::new(8, 8).with_networks([saved("Home")]));
        h.add("Cafe", -30);
        h.manager.enable();

        assert!(h.manager.start_scan_and_attempt_auto_connect());
        assert!(h.wait_for(WifiState::Disconnected));
        h.manager.tick();
        assert_eq!(h.manager.state(), WifiState::Disconnected);
        assert!(h.radio.connect_log().is_empty());
        assert_eq!(h.sink.scan_completions().len(), 1);
    }

    #[test]
    fn test_scan_deferred_while_peer_busy() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.add("Cafe", -30);
        let peer = Arc::new(RadioActivity::new());
        h.manager.set_peer(peer.clone());
        h.manager.enable();

        peer.set_busy(true);
        assert!(h.manager.start_scan());
        assert_eq!(
            h.manager.pending_operation(),
            Some(&PendingOperation::Scan {
                auto_connect: false
            })
        );
        assert!(!h.manager.is_busy());
        h.manager.tick();
        assert_eq!(h.manager.state(), WifiState::Disconnected);

        peer.set_busy(false);
        h.manager.tick();
        assert_eq!(h.manager.state(), WifiState::Scanning);
        assert!(h.wait_for(WifiState::Disconnected));
        assert_eq!(h.sink.scan_completions().len(), 1);
    }

    #[test]
    fn test_direct_connect_drops_deferred_scan() {
        let mut h = harness(MemoryStore::new(8, 8).with_networks([saved("Home")]));
        h.add("Home", -50);
        let peer = Arc::new(RadioActivity::new());
        h.manager.set_peer(peer.clone());
        h.manager.enable();

        peer.set_busy(true);
        assert!(h.manager.start_scan());
        assert!(h.manager.pending_operation().is_some());

        peer.set_busy(false);
        assert!(h.manager.connect("Home", None));
        assert_eq!(h.manager.state(), WifiState::Connecting);
        assert!(h.manager.pending_operation().is_none());

        assert!(h.wait_for(WifiState::Connected));
        h.manager.tick();
        assert_eq!(h.manager.state(), WifiState::Connected);
        assert!(h.sink.scan_completions().is_empty());
    }

    #[test]
    fn test_connect_with_password_saves_on_success() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.add("Home", -50);
        h.manager.enable();

        assert!(h.manager.connect("Home", Some("home-password")));
        assert!(h.wait_for(WifiState::Connected));
        assert_eq!(h.stored_ssids(), vec!["Home".to_string()]);
        assert!(h.manager.connected_network().unwrap().is_paired);
    }

    #[test]
    fn test_wrong_password_fails_without_saving() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.add("Home", -50);
        h.manager.enable();

        assert!(h.manager.connect("Home", Some("not-the-password")));
        assert!(h.wait_for(WifiState::ConnectionFailed));
        let failed = h.sink.state_changes().last().cloned().unwrap();
        assert_eq!(failed.address, "Home");
        assert_eq!(failed.reason, Some(WifiRadioError::AuthFailed.to_string()));

        h.manager.tick();
        assert_eq!(h.manager.state(), WifiState::Disconnected);
        assert!(h.stored_ssids().is_empty());
    }

    #[test]
    fn test_connect_rejects_invalid_password() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.manager.enable();
        assert!(!h.manager.connect("Home", Some("short")));
        assert!(h.radio.connect_log().is_empty());
    }

    #[test]
    fn test_connect_timeout_then_late_result_fires_no_callback() {
        let mut h = harness(MemoryStore::new(8, 8).with_networks([saved("Home")]));
        h.add("Home", -50);
        h.manager.enable();

        h.radio.hold_connects();
        let t0 = Instant::now();
        assert!(h.manager.connect("Home", None));
        assert_eq!(h.manager.state(), WifiState::Connecting);

        h.manager.tick_at(t0 + Duration::from_secs(16));
        assert_eq!(h.manager.state(), WifiState::ConnectionFailed);
        h.manager.tick_at(t0 + Duration::from_secs(16));
        assert_eq!(h.manager.state(), WifiState::Disconnected);
        assert!(h.manager.is_busy());
        assert_eq!(h.count_states(WifiState::ConnectionFailed), 1);

        let changes_before = h.sink.state_changes().len();
        h.radio.release_connects();
        let manager = &mut h.manager;
        assert!(run_until(WAIT, || {
            manager.tick_at(t0 + Duration::from_secs(17));
            !manager.is_busy()
        }));
        assert_eq!(h.sink.state_changes().len(), changes_before);
        assert!(h.manager.connected_network().is_none());
        assert_eq!(h.radio.disconnect_calls(), 1);
        assert!(h.radio.link().is_none());
    }

    #[test]
    fn test_save_network_errors() {
        let mut h = harness(MemoryStore::new(8, 1).with_networks([saved("Home")]));
        assert!(matches!(
            h.manager.save_network("Office", "short"),
            Err(PersistenceError::Invalid(_))
        ));
        let err = h.manager.save_network("Office", "office-password").unwrap_err();
        assert!(err.is_full());
        // Replacing an existing entry still fits
        h.manager.save_network("Home", "new-home-password").unwrap();
        assert_eq!(h.stored_ssids(), vec!["Home".to_string()]);
    }

    #[test]
    fn test_forget_network_while_connected() {
        let mut h = harness(MemoryStore::new(8, 8).with_networks([saved("Home")]));
        h.add("Home", -50);
        h.manager.enable();
        assert!(h.manager.connect("Home", None));
        assert!(h.wait_for(WifiState::Connected));

        assert!(h.manager.forget_network("Home"));
        assert_eq!(h.manager.state(), WifiState::Disconnected);
        assert_eq!(h.radio.disconnect_calls(), 1);
        assert!(h.stored_ssids().is_empty());
        assert!(h.manager.saved_networks().is_empty());
        assert!(!h.manager.forget_network("Home"));
    }

    #[test]
    fn test_link_loss_then_auto_reconnect() {
        let mut h = harness(MemoryStore::new(8, 8).with_networks([saved("Home")]));
        h.add("Home", -50);
        h.manager.enable();
        assert!(h.manager.connect("Home", None));
        assert!(h.wait_for(WifiState::Connected));

        assert!(h.radio.drop_link("beacon timeout"));
        let t0 = Instant::now();
        h.manager.tick_at(t0);
        assert_eq!(h.manager.state(), WifiState::Disconnected);
        let lost = h.sink.state_changes().last().cloned().unwrap();
        assert_eq!(lost.reason.as_deref(), Some("beacon timeout"));

        h.manager.tick_at(t0 + Duration::from_secs(59));
        assert_eq!(h.radio.connect_log().len(), 1);
        h.manager.tick_at(t0 + Duration::from_secs(61));
        assert_eq!(h.manager.state(), WifiState::Connecting);
        let radio = h.radio.clone();
        assert!(run_until(WAIT, || radio.connect_log().len() == 2));
    }

    #[test]
    fn test_local_disconnect_suspends_auto_reconnect() {
        let mut h = harness(MemoryStore::new(8, 8).with_networks([saved("Home")]));
        h.add("Home", -50);
        h.manager.enable();
        assert!(h.manager.connect("Home", None));
        assert!(h.wait_for(WifiState::Connected));

        h.manager.disconnect();
        assert_eq!(h.manager.state(), WifiState::Disconnected);
        assert!(h.sink.state_changes().last().unwrap().reason.is_none());
        h.manager.tick_at(Instant::now() + Duration::from_secs(300));
        assert_eq!(h.radio.connect_log().len(), 1);
    }

    #[test]
    fn test_disable_while_scanning_passes_through_disabling() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_scan_time(Duration::from_millis(200));
        h.manager.enable();
        assert!(h.manager.start_scan());

        h.manager.disable();
        assert_eq!(h.manager.state(), WifiState::Disabling);
        assert!(h.wait_for(WifiState::Disabled));
        assert!(!h.radio.is_started());
        assert_eq!(h.radio.stop_calls(), 1);
        assert!(!h.manager.is_busy());
        assert!(h.sink.scan_completions().is_empty());
    }

    #[test]
    fn test_disable_disconnects_and_stops_driver() {
        let mut h = harness(MemoryStore::new(8, 8).with_networks([saved("Home")]));
        h.add("Home", -50);
        h.manager.enable();
        assert!(h.manager.connect("Home", None));
        assert!(h.wait_for(WifiState::Connected));

        h.manager.disable();
        assert_eq!(h.manager.state(), WifiState::Disabled);
        assert!(!h.radio.is_started());
        assert!(!h.manager.connect("Home", None));
        let networks = h.manager.get_display_networks();
        assert_eq!(networks.len(), 1);
        assert!(!networks[0].is_connected);
    }

    #[test]
    fn test_scan_failure_reports_empty_list() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_scan_error(Some(WifiRadioError::Platform(-1)));
        h.manager.enable();
        assert!(h.manager.start_scan());
        assert!(h.wait_for(WifiState::Disconnected));
        match &h.sink.scan_completions()[0] {
            RecordedEvent::ScanComplete { success, ids, .. } => {
                assert!(!success);
                assert!(ids.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_status_bars_follow_link() {
        let mut h = harness(MemoryStore::new(8, 8).with_networks([saved("Home")]));
        h.add("Home", -60);
        h.manager.enable();
        assert!(h.manager.connect("Home", None));
        assert!(h.wait_for(WifiState::Connected));

        let status = *h.sink.statuses().last().unwrap();
        assert_eq!(status.radio, RadioKind::Wifi);
        assert_eq!(status.bars, 3);
        h.radio.report_rssi(-85);
        h.manager.tick();
        assert_eq!(h.sink.statuses().last().unwrap().bars, 1);
    }
}
