//! BLE connectivity manager.
//!
//! Owns the BLE state machine and its slice of the device registry. Blocking
//! radio calls (scan, connect) run on worker threads; everything else,
//! including every registry write and every callback, happens in
//! [`BleManager::tick`], which never blocks.
//!
//! # Deferred operations
//!
//! Before touching the radio the manager checks its peer arbiter. When the
//! Wi-Fi side is busy the request is parked in a single pending slot (scans
//! show as [`BleState::ScanPending`]) and retried on every tick.
//!
//! # Late results
//!
//! A connect that outlives its timeout is abandoned: the manager reports
//! failure and keeps the worker aside. The radio counts as busy until the
//! worker returns. Its result only refreshes registry data and never fires a
//! callback; a link it brought up is torn down.

use super::platform::{BleRadio, ConnectInfo, ConnectTarget, LinkEvent};
use super::state::{BleState, PendingOperation, ScanPurpose};
use super::worker::{run_connect, run_scan, ConnectOutcome, ScanOutcome};
use crate::arbiter::{NoPeer, RadioActivity, RadioArbiter};
use crate::config::{BleManagerConfig, ConfigError};
use crate::events::{
    bars_from_rssi, ConnectionState, EventSink, RadioKind, StateChange, StatusTracker,
};
use crate::persistence::{PairedDevice, PairedDeviceStore, UpsertOutcome};
use crate::reconnect::ReconnectTimer;
use crate::registry::{DeviceRegistry, ManagedDevice, PersistedEntry, PrimaryId, ScanHit};
use crate::worker::{drain_hits, hit_channel, spawn_worker, wait_until, Worker, WorkerPoll};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// The worker currently owning the radio.
enum ActiveOp {
    Scan {
        worker: Worker<ScanOutcome>,
        hits: mpsc::Receiver<ScanHit>,
        purpose: ScanPurpose,
        deadline: Instant,
    },
    Connect {
        worker: Worker<ConnectOutcome>,
        target: ConnectTarget,
        deadline: Instant,
    },
}

/// A worker the manager gave up waiting for.
enum Abandoned {
    Scan(Worker<ScanOutcome>),
    Connect(Worker<ConnectOutcome>),
}

/// The established link.
#[derive(Debug, Clone)]
struct Link {
    id: PrimaryId,
    address: String,
    name: String,
    service_uuid: Option<String>,
    rssi: Option<i16>,
}

fn persisted_entry(record: PairedDevice, key_by_service_uuid: bool) -> PersistedEntry {
    let id = match (&record.service_uuid, key_by_service_uuid) {
        (Some(uuid), true) => PrimaryId::service_uuid(uuid),
        _ => PrimaryId::address(&record.address),
    };
    PersistedEntry {
        id,
        name: record.name,
        address: record.address,
        service_uuid: record.service_uuid,
    }
}

fn target_of(device: &ManagedDevice) -> ConnectTarget {
    ConnectTarget {
        id: device.id.clone(),
        address: device.address.clone(),
        name: device.name.clone(),
        service_uuid: device.service_uuid.clone(),
    }
}

/// BLE connectivity manager.
pub struct BleManager {
    config: BleManagerConfig,
    radio: Arc<dyn BleRadio>,
    store: Box<dyn PairedDeviceStore>,
    registry: DeviceRegistry,
    sink: Arc<dyn EventSink>,
    activity: Arc<RadioActivity>,
    peer: Arc<dyn RadioArbiter>,
    state: BleState,
    radio_ready: bool,
    deinit_when_idle: bool,
    op: Option<ActiveOp>,
    abandoned: Option<Abandoned>,
    pending: Option<PendingOperation>,
    link: Option<Link>,
    local_disconnect: bool,
    disconnect_deadline: Option<Instant>,
    reconnect: ReconnectTimer,
    status: StatusTracker,
}

impl BleManager {
    /// Create a disabled manager.
    pub fn new(
        config: BleManagerConfig,
        radio: Arc<dyn BleRadio>,
        store: Box<dyn PairedDeviceStore>,
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
            state: BleState::Disabled,
            radio_ready: false,
            deinit_when_idle: false,
            op: None,
            abandoned: None,
            pending: None,
            link: None,
            local_disconnect: false,
            disconnect_deadline: None,
            status: StatusTracker::new(RadioKind::Ble),
        })
    }

    pub fn state(&self) -> BleState {
        self.state
    }

    pub fn config(&self) -> &BleManagerConfig {
        &self.config
    }

    /// Whether a scan or connect currently holds the radio.
    pub fn is_busy(&self) -> bool {
        self.op.is_some() || self.abandoned.is_some()
    }

    /// Busy query to hand to the Wi-Fi manager.
    pub fn arbiter(&self) -> Arc<dyn RadioArbiter> {
        self.activity.clone()
    }

    /// Attach the Wi-Fi manager's busy query.
    pub fn set_peer(&mut self, peer: Arc<dyn RadioArbiter>) {
        self.peer = peer;
    }

    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        self.reconnect.set_enabled(enabled);
    }

    pub fn auto_reconnect(&self) -> bool {
        self.reconnect.is_enabled()
    }

    /// Handle to the BLE registry for UI-side reads.
    pub fn registry(&self) -> DeviceRegistry {
        self.registry.clone()
    }

    pub fn pending_operation(&self) -> Option<&PendingOperation> {
        self.pending.as_ref()
    }

    /// The currently connected device.
    pub fn connected_device(&self) -> Option<ManagedDevice> {
        self.link.as_ref().and_then(|l| self.registry.get(&l.id))
    }

    /// Paired devices as persisted.
    pub fn paired_devices(&self) -> Vec<PairedDevice> {
        self.store.load_paired_devices().unwrap_or_else(|e| {
            warn!("[ble] Failed to load paired devices: {}", e);
            Vec::new()
        })
    }

    /// Registry entries in display order.
    pub fn get_display_devices(&self) -> Vec<ManagedDevice> {
        self.registry.display_list()
    }

    /// Enable the manager, optionally scanning and reconnecting right away.
    pub fn enable(&mut self, auto_scan: bool) {
        if self.state != BleState::Disabled {
            debug!("[ble] Already enabled");
            return;
        }
        self.reload_paired();
        let now = Instant::now();
        self.transition(BleState::Disconnected);
        self.reconnect.disconnected(now);
        self.notify(None, None);
        info!("[ble] Enabled ({} known devices)", self.registry.len());

        if auto_scan {
            self.start_scan(self.config.auto_scan_duration(), false, true);
        }
        self.publish();
    }

    /// Disconnect, stop any worker, and power the stack down.
    ///
    /// Blocks at most about two disconnect timeouts.
    pub fn disable(&mut self) {
        if self.state == BleState::Disabled {
            return;
        }
        info!("[ble] Disabling");
        self.pending = None;
        if self.link.is_some() {
            self.disconnect_from_device(false);
        }

        let timeout = self.config.disconnect_timeout();
        match self.op.take() {
            Some(ActiveOp::Scan { mut worker, .. }) => {
                worker.cancel();
                if let WorkerPoll::Pending = worker.wait(timeout) {
                    warn!("[ble] Scan worker still running at disable");
                    self.abandoned = Some(Abandoned::Scan(worker));
                }
            }
            Some(ActiveOp::Connect { mut worker, .. }) => match worker.wait(timeout) {
                WorkerPoll::Ready(outcome) => self.handle_late_connect(outcome),
                WorkerPoll::Lost => {}
                WorkerPoll::Pending => {
                    warn!("[ble] Connect worker still running at disable");
                    self.abandoned = Some(Abandoned::Connect(worker));
                }
            },
            None => {}
        }

        self.link = None;
        self.registry.reset_transient();
        self.deinit_radio();
        self.transition(BleState::Disabled);
        self.notify(None, None);
        self.publish();
    }

    /// Start a scan.
    ///
    /// Returns `false` if the manager is disabled, already scanning or
    /// connecting, or has an operation queued. When Wi-Fi holds the radio the scan is deferred and `true`
    /// is returned. With `blocking`, waits for the scan to finish and its
    /// callback to fire before returning.
    pub fn start_scan(&mut self, duration: Duration, blocking: bool, auto_connect: bool) -> bool {
        if self.state == BleState::Disabled {
            warn!("[ble] Scan rejected: disabled");
            return false;
        }
        if self.op.is_some()
            || self.pending.is_some()
            || matches!(
                self.state,
                BleState::ScanPending | BleState::Scanning | BleState::Connecting
            )
        {
            debug!("[ble] Scan rejected: busy ({:?})", self.state);
            return false;
        }

        let now = Instant::now();
        let accepted = self.start_or_defer_scan(now, duration, ScanPurpose::General { auto_connect });
        if accepted && blocking && self.state == BleState::Scanning {
            let limit = duration + self.config.disconnect_timeout();
            let finished = wait_until(limit, || {
                self.tick_at(Instant::now());
                self.state != BleState::Scanning
            });
            if !finished {
                warn!("[ble] Blocking scan still running after {:?}", limit);
            }
        }
        self.publish();
        accepted
    }

    /// Connect to the device identified by `id`.
    ///
    /// An existing link to another device is torn down first. While a scan
    /// or connect is in flight the request waits in the pending slot. A
    /// device not seen recently is refreshed with a short scan first.
    pub fn connect_to_device(&mut self, id: &PrimaryId) -> bool {
        if self.state == BleState::Disabled {
            warn!("[ble] Connect rejected: disabled");
            return false;
        }
        if self.link.as_ref().is_some_and(|l| &l.id == id) {
            debug!("[ble] Already connected to {}", id);
            return true;
        }
        if let Some(ActiveOp::Connect { target, .. }) = &self.op {
            if &target.id == id {
                return true;
            }
        }
        if self.link.is_some() {
            self.disconnect_from_device(false);
        }
        if self.op.is_some() || self.state == BleState::ScanPending {
            if let Some(previous) = self.pending.take() {
                debug!("[ble] Connect to {} supersedes {:?}", id, previous);
            }
            self.pending = Some(PendingOperation::Connect { target: id.clone() });
            if self.state == BleState::ScanPending {
                self.transition(self.idle_state());
            }
            info!("[ble] Connect to {} queued", id);
            self.publish();
            return true;
        }

        let accepted = self.request_connect(Instant::now(), id.clone());
        self.publish();
        accepted
    }

    /// Disconnect from the connected device.
    ///
    /// Waits for the platform's disconnect notification, bounded by the
    /// disconnect timeout. No-op when not connected.
    pub fn disconnect_from_device(&mut self, deinit_radio_after: bool) {
        if self.link.is_some() {
            self.request_local_disconnect(Instant::now());
            let timeout = self.config.disconnect_timeout();
            let confirmed = wait_until(timeout, || {
                self.poll_link_events(Instant::now());
                self.link.is_none()
            });
            if !confirmed {
                warn!("[ble] Disconnect not confirmed within {:?}; forcing", timeout);
                self.link_lost(Instant::now(), None);
            }
        }
        if deinit_radio_after {
            self.deinit_radio();
        }
        self.publish();
    }

    /// Forget a paired device, disconnecting first if it is connected.
    ///
    /// Returns `true` if the device was known to the store or the registry.
    pub fn remove_paired_device(&mut self, id: &PrimaryId) -> bool {
        if self.link.as_ref().is_some_and(|l| &l.id == id) {
            info!("[ble] Disconnecting {} before removal", id);
            self.disconnect_from_device(false);
        }
        if matches!(&self.pending, Some(PendingOperation::Connect { target }) if target == id) {
            self.pending = None;
        }
        self.reconnect.forget_if(id);

        let stored = match self.store.remove_paired_device(id.as_str()) {
            Ok(removed) => removed,
            Err(e) => {
                error!("[ble] Failed to remove {} from store: {}", id, e);
                false
            }
        };
        let known = self.registry.remove(id);
        info!("[ble] Removed paired device {}", id);
        self.publish();
        stored || known
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
            BleState::Disabled => {}
            BleState::Failed => {
                self.transition(self.idle_state());
                self.reconnect.disconnected(now);
                self.notify(None, None);
            }
            BleState::Scanning => self.poll_scan(now),
            BleState::Connecting => self.poll_connect(now),
            BleState::ScanPending | BleState::Disconnected | BleState::Connected => {
                self.run_pending(now)
            }
        }

        if self.state == BleState::Disconnected && self.pending.is_none() && self.op.is_none() {
            if let Some(id) = self.reconnect.due(now) {
                info!("[ble] Auto-reconnecting to {}", id);
                self.request_connect(now, id);
            }
        }
        self.publish();
    }

    fn idle_state(&self) -> BleState {
        if self.link.is_some() {
            BleState::Connected
        } else {
            BleState::Disconnected
        }
    }

    fn transition(&mut self, state: BleState) {
        if self.state != state {
            debug!("[ble] {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Report the current state, with the identity of `device` (or the link).
    fn notify(&self, device: Option<&ConnectTarget>, reason: Option<String>) {
        let (address, name, service_uuid) = match (device, &self.link) {
            (Some(t), _) => (t.address.clone(), t.name.clone(), t.service_uuid.clone()),
            (None, Some(l)) => (l.address.clone(), l.name.clone(), l.service_uuid.clone()),
            (None, None) => (String::new(), String::new(), None),
        };
        self.sink.on_state_change(&StateChange {
            state: ConnectionState::Ble(self.state),
            address,
            name,
            service_uuid,
            reason,
        });
    }

    /// Publish the busy flag and any status change.
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

    fn reload_paired(&mut self) {
        match self.store.load_paired_devices() {
            Ok(records) => {
                let key_by_uuid = self.config.key_by_service_uuid;
                self.registry.sync_persisted(
                    records
                        .into_iter()
                        .map(|r| persisted_entry(r, key_by_uuid)),
                );
            }
            Err(e) => warn!("[ble] Failed to load paired devices: {}", e),
        }
    }

    fn ensure_radio(&mut self) -> bool {
        if self.radio_ready {
            return true;
        }
        match self.radio.init() {
            Ok(()) => {
                info!("[ble] Stack initialised");
                self.radio_ready = true;
                true
            }
            Err(e) => {
                error!("[ble] Stack init failed: {}", e);
                false
            }
        }
    }

    fn deinit_radio(&mut self) {
        if !self.radio_ready {
            return;
        }
        if self.is_busy() {
            debug!("[ble] Deinit deferred until workers finish");
            self.deinit_when_idle = true;
            return;
        }
        if let Err(e) = self.radio.deinit() {
            warn!("[ble] Stack deinit failed: {}", e);
        }
        info!("[ble] Stack deinitialised");
        self.radio_ready = false;
        self.deinit_when_idle = false;
    }

    /// Park `op` until the radio frees up. A queued connect is never
    /// replaced by a general scan.
    fn defer(&mut self, op: PendingOperation) -> bool {
        if let (
            PendingOperation::Scan {
                purpose: ScanPurpose::General { .. },
                ..
            },
            Some(PendingOperation::Connect { target }),
        ) = (&op, &self.pending)
        {
            debug!("[ble] Keeping queued connect to {}, dropping {:?}", target, op);
            return false;
        }
        debug!("[ble] Radio busy, deferring {:?}", op);
        if let PendingOperation::Scan { .. } = op {
            self.transition(BleState::ScanPending);
        }
        self.pending = Some(op);
        true
    }

    fn start_or_defer_scan(&mut self, now: Instant, duration: Duration, purpose: ScanPurpose) -> bool {
        if !self.radio_free() {
            return self.defer(PendingOperation::Scan { duration, purpose });
        }
        self.begin_scan(now, duration, purpose)
    }

    fn begin_scan(&mut self, now: Instant, duration: Duration, purpose: ScanPurpose) -> bool {
        if !self.ensure_radio() {
            self.scan_failed(purpose, "stack init failed");
            return false;
        }
        let (tx, rx) = hit_channel(
            self.config.scan_channel_capacity,
            self.config.backpressure_timeout(),
        );
        let radio = self.radio.clone();
        let key_by_uuid = self.config.key_by_service_uuid;
        let spawned = spawn_worker("ble-scan", move |cancel| {
            run_scan(radio, duration, cancel, tx, key_by_uuid)
        });
        match spawned {
            Ok(worker) => {
                self.registry.begin_scan_cycle();
                info!("[ble] Scanning for {:?} ({:?})", duration, purpose);
                self.op = Some(ActiveOp::Scan {
                    worker,
                    hits: rx,
                    purpose,
                    deadline: now + duration + self.config.disconnect_timeout(),
                });
                self.transition(BleState::Scanning);
                self.publish();
                true
            }
            Err(e) => {
                error!("[ble] Failed to spawn scan worker: {}", e);
                self.scan_failed(purpose, "worker spawn failed");
                false
            }
        }
    }

    fn scan_failed(&mut self, purpose: ScanPurpose, reason: &str) {
        match purpose {
            ScanPurpose::General { .. } => {
                warn!("[ble] Scan failed: {}", reason);
                if self.link.is_none() {
                    self.transition(BleState::Failed);
                } else {
                    self.transition(BleState::Connected);
                }
                self.sink.on_scan_complete(RadioKind::Ble, false, &[]);
            }
            ScanPurpose::ShortConnect { target } => {
                let device = self.registry.get(&target);
                let target = device.as_ref().map(target_of).unwrap_or(ConnectTarget {
                    address: target.to_string(),
                    id: target,
                    name: String::new(),
                    service_uuid: None,
                });
                self.connect_failed(&target, reason.to_string());
            }
        }
    }

    fn poll_scan(&mut self, now: Instant) {
        let poll = match self.op.as_mut() {
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
                if let WorkerPoll::Pending = poll {
                    if now >= *deadline {
                        warn!("[ble] Scan overran by {:?}; cancelling", worker.age());
                        worker.cancel();
                        *deadline = now + self.config.disconnect_timeout();
                    }
                }
                poll
            }
            _ => return,
        };
        match poll {
            WorkerPoll::Pending => {}
            WorkerPoll::Ready(outcome) => self.finish_scan(now, Some(outcome)),
            WorkerPoll::Lost => self.finish_scan(now, None),
        }
    }

    fn finish_scan(&mut self, now: Instant, outcome: Option<ScanOutcome>) {
        let Some(ActiveOp::Scan {
            mut hits, purpose, ..
        }) = self.op.take()
        else {
            return;
        };
        for hit in drain_hits(&mut hits, usize::MAX) {
            self.registry.merge_hit(&hit, now);
        }
        drop(hits);

        let success = outcome.as_ref().is_some_and(ScanOutcome::success);
        if !success {
            let reason = outcome
                .and_then(|o| o.error)
                .map_or_else(|| "worker lost".to_string(), |e| e.to_string());
            self.scan_failed(purpose, &reason);
            return;
        }

        let went_offline = self.registry.finish_scan_cycle();
        if went_offline > 0 {
            debug!("[ble] {} devices went offline", went_offline);
        }
        self.transition(self.idle_state());

        match purpose {
            ScanPurpose::General { auto_connect } => {
                let devices = self.registry.display_list();
                info!("[ble] Scan complete: {} devices", devices.len());
                self.sink.on_scan_complete(RadioKind::Ble, true, &devices);

                if auto_connect && self.pending.is_none() && self.link.is_none() {
                    match self.registry.strongest(|d| d.is_paired) {
                        Some(best) => {
                            info!(
                                "[ble] Auto-connecting to {} ({:?} dBm)",
                                best.display_name(),
                                best.rssi
                            );
                            self.start_or_defer_connect(now, target_of(&best));
                        }
                        None => info!("[ble] No paired device in range"),
                    }
                }
            }
            ScanPurpose::ShortConnect { target } => match self.registry.get(&target) {
                _ if matches!(self.pending, Some(PendingOperation::Connect { .. })) => {
                    info!("[ble] Connect to {} superseded by a queued connect", target);
                }
                Some(device) if device.is_online => {
                    self.start_or_defer_connect(now, target_of(&device));
                }
                device => {
                    let target = device.as_ref().map(target_of).unwrap_or(ConnectTarget {
                        address: target.to_string(),
                        id: target,
                        name: String::new(),
                        service_uuid: None,
                    });
                    self.connect_failed(&target, "device not found".to_string());
                }
            },
        }
    }

    /// Connect to `id`, running a short scan first if its address is stale.
    fn request_connect(&mut self, now: Instant, id: PrimaryId) -> bool {
        let device = self
            .registry
            .get(&id)
            .filter(|d| !d.is_stale(now, self.config.stale_address_after()));
        match device {
            Some(device) => self.start_or_defer_connect(now, target_of(&device)),
            None => {
                info!("[ble] {} not seen recently, scanning first", id);
                self.start_or_defer_scan(
                    now,
                    self.config.short_scan_duration(),
                    ScanPurpose::ShortConnect { target: id },
                )
            }
        }
    }

    fn start_or_defer_connect(&mut self, now: Instant, target: ConnectTarget) -> bool {
        if !self.radio_free() {
            return self.defer(PendingOperation::Connect { target: target.id });
        }
        self.begin_connect(now, target)
    }

    fn begin_connect(&mut self, now: Instant, target: ConnectTarget) -> bool {
        if !self.ensure_radio() {
            self.connect_failed(&target, "stack init failed".to_string());
            return false;
        }
        let radio = self.radio.clone();
        let timeout = self.config.connect_timeout();
        let job_target = target.clone();
        match spawn_worker("ble-connect", move |_| run_connect(radio, job_target, timeout)) {
            Ok(worker) => {
                info!("[ble] Connecting to {} ({})", target.name, target.address);
                self.transition(BleState::Connecting);
                self.notify(Some(&target), None);
                self.op = Some(ActiveOp::Connect {
                    worker,
                    target,
                    deadline: now + timeout,
                });
                self.publish();
                true
            }
            Err(e) => {
                error!("[ble] Failed to spawn connect worker: {}", e);
                self.connect_failed(&target, "worker spawn failed".to_string());
                false
            }
        }
    }

    fn connect_failed(&mut self, target: &ConnectTarget, reason: String) {
        warn!("[ble] Connect to {} failed: {}", target.address, reason);
        self.transition(BleState::Failed);
        self.notify(Some(target), Some(reason));
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
                if let Some(ActiveOp::Connect { target, .. }) = self.op.take() {
                    self.connect_failed(&target, "connect worker lost".to_string());
                }
            }
            WorkerPoll::Pending => {
                let timed_out =
                    matches!(&self.op, Some(ActiveOp::Connect { deadline, .. }) if now >= *deadline);
                if !timed_out {
                    return;
                }
                if let Some(ActiveOp::Connect { worker, target, .. }) = self.op.take() {
                    warn!(
                        "[ble] Connect to {} timed out after {:?}",
                        target.address,
                        self.config.connect_timeout()
                    );
                    self.abandoned = Some(Abandoned::Connect(worker));
                    self.connect_failed(&target, "connect timeout".to_string());
                }
            }
        }
    }

    fn finish_connect(&mut self, outcome: ConnectOutcome) {
        let target = outcome.target;
        let info = match outcome.result {
            Ok(info) => info,
            Err(e) => {
                self.connect_failed(&target, e.to_string());
                return;
            }
        };
        let name = if info.name.is_empty() {
            target.name.clone()
        } else {
            info.name.clone()
        };
        let paired = self.persist_paired(&name, &info);
        if paired {
            // The store may have replaced an older record matched by name
            self.reload_paired();
        }
        self.registry.mark_connected(
            &target.id,
            &name,
            &info.address,
            info.service_uuid.clone(),
            paired,
        );
        if let Some(rssi) = info.rssi {
            self.registry.update_rssi(&target.id, rssi);
        }
        info!(
            "[ble] Connected to {} ({}) in {:?}",
            name, info.address, outcome.elapsed
        );
        self.link = Some(Link {
            id: target.id.clone(),
            address: info.address,
            name,
            service_uuid: info.service_uuid,
            rssi: info.rssi,
        });
        self.reconnect.connected(target.id);
        self.transition(BleState::Connected);
        self.notify(None, None);
    }

    /// Save the connected device. Returns whether it counts as paired.
    fn persist_paired(&mut self, name: &str, info: &ConnectInfo) -> bool {
        let record = match PairedDevice::new(name, &info.address, info.service_uuid.clone()) {
            Ok(record) => record,
            Err(e) => {
                warn!("[ble] Not pairing {}: {}", info.address, e);
                return false;
            }
        };
        match self.store.save_paired_device(&record) {
            Ok(UpsertOutcome::Inserted) => {
                info!("[ble] Paired {}", record.address);
                true
            }
            Ok(UpsertOutcome::Updated(_)) => true,
            Err(e) if e.is_full() => {
                warn!("[ble] Not pairing {}: {}", record.address, e);
                false
            }
            Err(e) => {
                // Session state stays authoritative
                error!("[ble] Failed to persist {}: {}", record.address, e);
                true
            }
        }
    }

    fn poll_abandoned(&mut self) {
        let late = match self.abandoned.as_mut() {
            Some(Abandoned::Scan(worker)) => match worker.poll() {
                WorkerPoll::Pending => return,
                WorkerPoll::Ready(outcome) => {
                    debug!("[ble] Discarding late scan result ({} hits)", outcome.hits_sent);
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
        if self.deinit_when_idle {
            self.deinit_radio();
        }
    }

    /// Merge a connect result nobody is waiting for. Never fires a callback.
    fn handle_late_connect(&mut self, outcome: ConnectOutcome) {
        match outcome.result {
            Ok(info) => {
                warn!(
                    "[ble] Late connect to {} after {:?}; releasing link",
                    info.address, outcome.elapsed
                );
                if let Some(rssi) = info.rssi {
                    self.registry.update_rssi(&outcome.target.id, rssi);
                }
                if let Err(e) = self.radio.disconnect(&info.address) {
                    warn!("[ble] Failed to release {}: {}", info.address, e);
                }
            }
            Err(e) => debug!(
                "[ble] Late connect failure for {}: {}",
                outcome.target.address, e
            ),
        }
    }

    fn run_pending(&mut self, now: Instant) {
        if self.op.is_some() || self.pending.is_none() || !self.radio_free() {
            return;
        }
        match self.pending.take() {
            Some(PendingOperation::Scan { duration, purpose }) => {
                self.transition(self.idle_state());
                self.begin_scan(now, duration, purpose);
            }
            Some(PendingOperation::Connect { target }) => {
                let linked_elsewhere = self.link.as_ref().is_some_and(|l| l.id != target);
                if linked_elsewhere {
                    // Tear down without blocking; the link event re-runs this
                    if self.disconnect_deadline.is_none() {
                        self.request_local_disconnect(now);
                    }
                    self.pending = Some(PendingOperation::Connect { target });
                } else if self.link.is_none() {
                    self.request_connect(now, target);
                }
            }
            None => {}
        }
    }

    fn request_local_disconnect(&mut self, now: Instant) {
        let Some(link) = &self.link else {
            return;
        };
        info!("[ble] Disconnecting from {}", link.address);
        let address = link.address.clone();
        self.local_disconnect = true;
        self.disconnect_deadline = Some(now + self.config.disconnect_timeout());
        if let Err(e) = self.radio.disconnect(&address) {
            warn!("[ble] Platform disconnect failed: {}", e);
            self.link_lost(now, None);
        }
    }

    fn poll_link_events(&mut self, now: Instant) {
        if !self.radio_ready {
            return;
        }
        while let Some(event) = self.radio.poll_link_event() {
            match event {
                LinkEvent::Disconnected { address, reason } => {
                    let ours = self
                        .link
                        .as_ref()
                        .is_some_and(|l| l.address.eq_ignore_ascii_case(&address));
                    if ours {
                        self.link_lost(now, reason);
                    } else {
                        debug!("[ble] Ignoring disconnect for {}", address);
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
                warn!("[ble] Disconnect not confirmed; forcing");
                self.link_lost(now, None);
            }
        }
    }

    /// Finalize a link going down, locally or remotely.
    fn link_lost(&mut self, now: Instant, reason: Option<String>) {
        let Some(link) = self.link.take() else {
            return;
        };
        let local = std::mem::take(&mut self.local_disconnect);
        self.disconnect_deadline = None;
        self.registry.clear_connected();
        self.reconnect.disconnected(now);

        let reason = if local {
            info!("[ble] Disconnected from {}", link.address);
            self.reconnect.forget();
            None
        } else {
            let reason = reason.unwrap_or_else(|| "link lost".to_string());
            warn!("[ble] Link to {} lost: {}", link.address, reason);
            Some(reason)
        };
        if self.state == BleState::Connected {
            self.transition(BleState::Disconnected);
        }
        let device = ConnectTarget {
            id: link.id,
            address: link.address,
            name: link.name,
            service_uuid: link.service_uuid,
        };
        self.notify(Some(&device), reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::Advertisement;
    use crate::persistence::MemoryStore;
    use crate::sim::{run_until, RecordedEvent, RecordingSink, SimAir, SimBleRadio};
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_secs(3);

    fn advert(last: u8, rssi: i16) -> Advertisement {
        Advertisement {
            address: format!("aa:00:00:00:00:{:02x}", last),
            name: Some(format!("Dev{}", last)),
            service_uuid: None,
            rssi,
        }
    }

    fn id(last: u8) -> PrimaryId {
        PrimaryId::address(&format!("aa:00:00:00:00:{:02x}", last))
    }

    fn paired(last: u8) -> PairedDevice {
        PairedDevice::new(format!("Dev{}", last), &format!("aa:00:00:00:00:{:02x}", last), None)
            .unwrap()
    }

    struct Harness {
        manager: BleManager,
        radio: Arc<SimBleRadio>,
        store: Arc<Mutex<MemoryStore>>,
        sink: Arc<RecordingSink>,
    }

    fn harness(store: MemoryStore) -> Harness {
        harness_with(store, BleManagerConfig::default())
    }

    fn harness_with(store: MemoryStore, config: BleManagerConfig) -> Harness {
        let radio = Arc::new(SimBleRadio::new(SimAir::new()));
        let store = Arc::new(Mutex::new(store));
        let sink = RecordingSink::new();
        let manager =
            BleManager::new(config, radio.clone(), Box::new(store.clone()), sink.clone()).unwrap();
        Harness {
            manager,
            radio,
            store,
            sink,
        }
    }

    impl Harness {
        fn wait_for(&mut self, state: BleState) -> bool {
            let manager = &mut self.manager;
            run_until(WAIT, || {
                manager.tick();
                manager.state() == state
            })
        }

        fn scan_blocking(&mut self) {
            assert!(self.manager.start_scan(Duration::from_secs(5), true, false));
            assert_eq!(self.manager.state(), BleState::Disconnected);
        }

        fn connect(&mut self, last: u8) {
            self.scan_blocking();
            assert!(self.manager.connect_to_device(&id(last)));
            assert!(self.wait_for(BleState::Connected));
        }

        fn count_states(&self, state: BleState) -> usize {
            self.sink
                .state_changes()
                .iter()
                .filter(|c| c.state == ConnectionState::Ble(state))
                .count()
        }
    }

    #[test]
    fn test_operations_rejected_when_disabled() {
        let mut h = harness(MemoryStore::new(8, 8));
        assert!(!h.manager.start_scan(Duration::from_secs(1), false, false));
        assert!(!h.manager.connect_to_device(&id(1)));
        assert_eq!(h.manager.state(), BleState::Disabled);
        assert!(!h.radio.is_initialized());
    }

    #[test]
    fn test_enable_is_idempotent_and_loads_paired() {
        let mut h = harness(MemoryStore::new(8, 8).with_paired([paired(1)]));
        h.manager.enable(false);
        h.manager.enable(false);
        assert_eq!(h.manager.state(), BleState::Disconnected);
        assert_eq!(h.count_states(BleState::Disconnected), 1);

        let devices = h.manager.get_display_devices();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].is_paired);
        assert!(!devices[0].is_online);
        // Radio is brought up lazily
        assert!(!h.radio.is_initialized());
    }

    #[test]
    fn test_scan_completes_with_sorted_devices() {
        let mut h = harness(MemoryStore::new(8, 8).with_paired([paired(2)]));
        h.radio
            .set_adverts(vec![advert(1, -40), advert(2, -70), advert(3, -90)]);
        h.manager.enable(false);
        assert!(h.manager.start_scan(Duration::from_secs(5), false, false));
        assert_eq!(h.manager.state(), BleState::Scanning);
        assert!(h.manager.is_busy());
        assert!(!h.manager.start_scan(Duration::from_secs(5), false, false));

        assert!(h.wait_for(BleState::Disconnected));
        let completions = h.sink.scan_completions();
        assert_eq!(completions.len(), 1);
        match &completions[0] {
            RecordedEvent::ScanComplete { success, ids, .. } => {
                assert!(success);
                assert_eq!(
                    ids,
                    &vec![
                        "aa:00:00:00:00:02".to_string(),
                        "aa:00:00:00:00:01".to_string(),
                        "aa:00:00:00:00:03".to_string(),
                    ]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!h.manager.is_busy());
    }

    #[test]
    fn test_duplicate_advert_listed_once_with_latest_rssi() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_adverts(vec![advert(1, -80), advert(1, -60)]);
        h.manager.enable(false);
        h.scan_blocking();

        let devices = h.manager.get_display_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].rssi, Some(-60));
        assert!(devices[0].is_online);
    }

    #[test]
    fn test_auto_connect_prefers_strongest_paired_device() {
        let mut h = harness(MemoryStore::new(8, 8).with_paired([paired(2)]));
        h.radio
            .set_adverts(vec![advert(1, -40), advert(2, -70), advert(3, -90)]);
        h.manager.enable(false);
        assert!(h.manager.start_scan(Duration::from_secs(5), false, true));

        assert!(h.wait_for(BleState::Connected));
        assert_eq!(h.radio.connect_log(), vec!["aa:00:00:00:00:02".to_string()]);
        assert_eq!(h.manager.connected_device().unwrap().id, id(2));
    }

    #[test]
    fn test_auto_connect_without_paired_device_stays_disconnected() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_adverts(vec![advert(1, -40)]);
        h.manager.enable(false);
        assert!(h.manager.start_scan(Duration::from_secs(5), true, true));
        h.manager.tick();
        assert_eq!(h.manager.state(), BleState::Disconnected);
        assert!(h.radio.connect_log().is_empty());
    }

    #[test]
    fn test_connect_persists_single_paired_entry() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_adverts(vec![Advertisement {
            address: "AA:00:00:00:00:05".into(),
            name: Some("Heart".into()),
            service_uuid: Some("0000180D-0000-1000-8000-00805F9B34FB".into()),
            rssi: -55,
        }]);
        h.manager.enable(false);
        h.connect(5);

        let devices = h.manager.get_display_devices();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert!(device.is_paired && device.is_connected);
        assert_eq!(device.name, "Heart");
        assert_eq!(device.address, "aa:00:00:00:00:05");
        assert_eq!(
            device.service_uuid.as_deref(),
            Some("0000180d-0000-1000-8000-00805f9b34fb")
        );

        let stored = h.store.lock().unwrap().load_paired_devices().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "Heart");

        let connected = h.sink.state_changes();
        let last = connected.last().unwrap();
        assert_eq!(last.state, ConnectionState::Ble(BleState::Connected));
        assert_eq!(last.address, "aa:00:00:00:00:05");
    }

    #[test]
    fn test_connect_failure_reports_then_returns_to_disconnected() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_adverts(vec![advert(1, -50)]);
        h.radio
            .set_connect_error(Some(crate::ble::BleRadioError::Rejected("auth".into())));
        h.manager.enable(false);
        h.scan_blocking();
        assert!(h.manager.connect_to_device(&id(1)));

        assert!(h.wait_for(BleState::Failed));
        let failed = h.sink.state_changes().last().cloned().unwrap();
        assert!(failed.reason.unwrap().contains("auth"));
        h.manager.tick();
        assert_eq!(h.manager.state(), BleState::Disconnected);
        assert!(h.store.lock().unwrap().load_paired_devices().unwrap().is_empty());
    }

    #[test]
    fn test_connect_timeout_then_late_result_fires_no_callback() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_adverts(vec![advert(1, -50)]);
        h.manager.enable(false);
        h.scan_blocking();

        h.radio.hold_connects();
        let t0 = Instant::now();
        assert!(h.manager.connect_to_device(&id(1)));
        assert_eq!(h.manager.state(), BleState::Connecting);

        h.manager.tick_at(t0 + Duration::from_secs(11));
        assert_eq!(h.manager.state(), BleState::Failed);
        assert_eq!(h.count_states(BleState::Failed), 1);
        h.manager.tick_at(t0 + Duration::from_secs(11));
        assert_eq!(h.manager.state(), BleState::Disconnected);
        // Abandoned worker still holds the radio
        assert!(h.manager.is_busy());

        let changes_before = h.sink.state_changes().len();
        h.radio.release_connects();
        let manager = &mut h.manager;
        assert!(run_until(WAIT, || {
            manager.tick_at(t0 + Duration::from_secs(12));
            !manager.is_busy()
        }));

        assert_eq!(h.sink.state_changes().len(), changes_before);
        assert_eq!(h.manager.state(), BleState::Disconnected);
        assert!(h.manager.connected_device().is_none());
        // The orphaned link is released
        assert_eq!(h.radio.disconnect_log(), vec!["aa:00:00:00:00:01".to_string()]);
        assert!(h.radio.link().is_none());
        assert!(h.store.lock().unwrap().load_paired_devices().unwrap().is_empty());
    }

    #[test]
    fn test_remove_paired_device_while_connected() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_adverts(vec![advert(1, -50)]);
        h.manager.enable(false);
        h.connect(1);

        assert!(h.manager.remove_paired_device(&id(1)));
        assert_eq!(h.manager.state(), BleState::Disconnected);
        assert_eq!(h.radio.disconnect_log(), vec!["aa:00:00:00:00:01".to_string()]);
        assert!(h.manager.registry().get(&id(1)).is_none());
        assert!(h.store.lock().unwrap().load_paired_devices().unwrap().is_empty());
        assert!(!h.manager.remove_paired_device(&id(1)));
    }

    #[test]
    fn test_disconnect_times_out_without_notification() {
        let config = BleManagerConfig {
            disconnect_timeout_ms: 50,
            ..Default::default()
        };
        let mut h = harness_with(MemoryStore::new(8, 8), config);
        h.radio.set_adverts(vec![advert(1, -50)]);
        h.manager.enable(false);
        h.connect(1);

        h.radio.set_silent_disconnects(true);
        let started = Instant::now();
        h.manager.disconnect_from_device(false);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(h.manager.state(), BleState::Disconnected);
        assert!(h.manager.connected_device().is_none());
    }

    #[test]
    fn test_disconnect_when_not_connected_is_noop() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.manager.enable(false);
        h.manager.disconnect_from_device(false);
        assert!(h.radio.disconnect_log().is_empty());
        assert_eq!(h.manager.state(), BleState::Disconnected);
    }

    #[test]
    fn test_scan_deferred_while_peer_busy() {
        let mut h = harness(MemoryStore::new(8, 8));
        let peer = Arc::new(RadioActivity::new());
        h.manager.set_peer(peer.clone());
        h.manager.enable(false);

        peer.set_busy(true);
        assert!(h.manager.start_scan(Duration::from_secs(5), false, false));
        assert_eq!(h.manager.state(), BleState::ScanPending);
        assert!(!h.manager.is_busy());
        h.manager.tick();
        assert_eq!(h.manager.state(), BleState::ScanPending);
        assert!(!h.radio.is_initialized());

        peer.set_busy(false);
        h.manager.tick();
        assert_eq!(h.manager.state(), BleState::Scanning);
        assert!(h.wait_for(BleState::Disconnected));
        assert_eq!(h.sink.scan_completions().len(), 1);
    }

    #[test]
    fn test_stale_device_gets_transparent_short_scan() {
        let mut h = harness(MemoryStore::new(8, 8).with_paired([paired(4)]));
        h.radio.set_adverts(vec![advert(4, -60)]);
        h.manager.enable(false);

        assert!(h.manager.connect_to_device(&id(4)));
        assert_eq!(h.manager.state(), BleState::Scanning);
        assert!(h.wait_for(BleState::Connected));
        assert!(h.sink.scan_completions().is_empty());
        assert_eq!(h.radio.connect_log(), vec!["aa:00:00:00:00:04".to_string()]);
    }

    #[test]
    fn test_short_scan_miss_fails_connect() {
        let mut h = harness(MemoryStore::new(8, 8).with_paired([paired(4)]));
        h.manager.enable(false);

        assert!(h.manager.connect_to_device(&id(4)));
        assert!(h.wait_for(BleState::Failed));
        assert!(h.radio.connect_log().is_empty());
        assert!(h.sink.scan_completions().is_empty());
    }

    #[test]
    fn test_connect_queued_behind_scan() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_adverts(vec![advert(1, -50)]);
        h.manager.enable(false);
        h.scan_blocking();

        assert!(h.manager.start_scan(Duration::from_secs(5), false, false));
        assert!(h.manager.connect_to_device(&id(1)));
        assert_eq!(
            h.manager.pending_operation(),
            Some(&PendingOperation::Connect { target: id(1) })
        );
        assert!(h.wait_for(BleState::Connected));
        assert!(h.manager.pending_operation().is_none());
    }

    #[test]
    fn test_scan_rejected_while_connect_queued() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_adverts(vec![advert(1, -50)]);
        let peer = Arc::new(RadioActivity::new());
        h.manager.set_peer(peer.clone());
        h.manager.enable(false);
        h.scan_blocking();

        peer.set_busy(true);
        assert!(h.manager.connect_to_device(&id(1)));
        assert_eq!(
            h.manager.pending_operation(),
            Some(&PendingOperation::Connect { target: id(1) })
        );
        assert!(!h.manager.start_scan(Duration::from_secs(5), false, false));
        assert_eq!(
            h.manager.pending_operation(),
            Some(&PendingOperation::Connect { target: id(1) })
        );

        peer.set_busy(false);
        assert!(h.wait_for(BleState::Connected));
        assert_eq!(h.radio.connect_log(), vec!["aa:00:00:00:00:01".to_string()]);
    }

    #[test]
    fn test_queued_connect_supersedes_short_scan_target() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_adverts(vec![advert(1, -50), advert(2, -60)]);
        h.manager.enable(false);

        // Neither device has been seen yet, so this starts a short scan
        assert!(h.manager.connect_to_device(&id(1)));
        assert_eq!(h.manager.state(), BleState::Scanning);
        assert!(h.manager.connect_to_device(&id(2)));

        assert!(h.wait_for(BleState::Connected));
        assert_eq!(h.radio.connect_log(), vec!["aa:00:00:00:00:02".to_string()]);
        assert_eq!(h.manager.connected_device().unwrap().id, id(2));
    }

    #[test]
    fn test_paired_device_with_new_address_replaces_old_entry() {
        let mut h = harness(MemoryStore::new(8, 8).with_paired([paired(1)]));
        // Same name, new address
        h.radio.set_adverts(vec![Advertisement {
            address: "aa:00:00:00:00:02".into(),
            name: Some("Dev1".into()),
            service_uuid: None,
            rssi: -50,
        }]);
        h.manager.enable(false);
        h.connect(2);

        let stored: Vec<String> = h
            .store
            .lock()
            .unwrap()
            .load_paired_devices()
            .unwrap()
            .into_iter()
            .map(|d| d.address)
            .collect();
        assert_eq!(stored, vec!["aa:00:00:00:00:02".to_string()]);

        let paired_ids: Vec<PrimaryId> = h
            .manager
            .get_display_devices()
            .into_iter()
            .filter(|d| d.is_paired)
            .map(|d| d.id)
            .collect();
        assert_eq!(paired_ids, vec![id(2)]);
        assert!(h.manager.registry().get(&id(1)).is_none());
    }

    #[test]
    fn test_link_loss_and_debounced_auto_reconnect() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_adverts(vec![advert(1, -50)]);
        h.manager.enable(false);
        h.connect(1);

        assert!(h.radio.drop_link("supervision timeout"));
        let t0 = Instant::now();
        h.manager.tick_at(t0);
        assert_eq!(h.manager.state(), BleState::Disconnected);
        let lost = h.sink.state_changes().last().cloned().unwrap();
        assert_eq!(lost.reason.as_deref(), Some("supervision timeout"));

        h.radio
            .set_connect_error(Some(crate::ble::BleRadioError::Timeout));
        h.manager.tick_at(t0 + Duration::from_secs(29));
        assert_eq!(h.radio.connect_log().len(), 1);

        h.manager.tick_at(t0 + Duration::from_secs(31));
        assert_eq!(h.manager.state(), BleState::Connecting);
        let manager = &mut h.manager;
        assert!(run_until(WAIT, || {
            manager.tick_at(t0 + Duration::from_secs(32));
            manager.state() == BleState::Disconnected
        }));
        assert_eq!(h.radio.connect_log().len(), 2);

        // Still within one interval of the last attempt
        for secs in [40, 50, 60] {
            h.manager.tick_at(t0 + Duration::from_secs(secs));
            assert_eq!(h.manager.state(), BleState::Disconnected);
        }
        assert_eq!(h.radio.connect_log().len(), 2);
    }

    #[test]
    fn test_local_disconnect_suspends_auto_reconnect() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_adverts(vec![advert(1, -50)]);
        h.manager.enable(false);
        h.connect(1);

        h.manager.disconnect_from_device(false);
        assert_eq!(h.manager.state(), BleState::Disconnected);
        let local = h.sink.state_changes().last().cloned().unwrap();
        assert!(local.reason.is_none());

        h.manager.tick_at(Instant::now() + Duration::from_secs(120));
        assert_eq!(h.manager.state(), BleState::Disconnected);
        assert_eq!(h.radio.connect_log().len(), 1);
    }

    #[test]
    fn test_full_store_connects_unpaired() {
        let store = MemoryStore::new(1, 8).with_paired([paired(9)]);
        let mut h = harness(store);
        h.radio.set_adverts(vec![advert(1, -50)]);
        h.manager.enable(false);
        h.connect(1);

        let device = h.manager.connected_device().unwrap();
        assert!(!device.is_paired);
        assert_eq!(h.store.lock().unwrap().load_paired_devices().unwrap().len(), 1);
    }

    #[test]
    fn test_store_failure_keeps_session_state() {
        let mut store = MemoryStore::new(8, 8);
        store.set_fail_writes(true);
        let mut h = harness(store);
        h.radio.set_adverts(vec![advert(1, -50)]);
        h.manager.enable(false);
        h.connect(1);

        assert_eq!(h.manager.state(), BleState::Connected);
        assert!(h.manager.connected_device().unwrap().is_paired);
    }

    #[test]
    fn test_disable_disconnects_and_deinits() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_adverts(vec![advert(1, -50), advert(2, -60)]);
        h.manager.enable(false);
        h.connect(1);

        h.manager.disable();
        assert_eq!(h.manager.state(), BleState::Disabled);
        assert!(!h.radio.is_initialized());
        assert_eq!(h.radio.deinit_calls(), 1);
        // Only the paired device survives
        let devices = h.manager.get_display_devices();
        assert_eq!(devices.len(), 1);
        assert!(!devices[0].is_connected && !devices[0].is_online);
    }

    #[test]
    fn test_disconnect_with_deinit_then_lazy_reinit() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_adverts(vec![advert(1, -50)]);
        h.manager.enable(false);
        h.connect(1);

        h.manager.disconnect_from_device(true);
        assert!(!h.radio.is_initialized());
        h.scan_blocking();
        assert_eq!(h.radio.init_calls(), 2);
    }

    #[test]
    fn test_status_updates_follow_link_rssi() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio.set_adverts(vec![advert(1, -50)]);
        h.manager.enable(false);
        h.connect(1);

        let connected = *h.sink.statuses().last().unwrap();
        assert_eq!(connected.code, crate::events::StatusCode::Connected);
        assert_eq!(connected.bars, 4);

        h.radio.report_rssi(-80);
        h.manager.tick();
        assert_eq!(h.sink.statuses().last().unwrap().bars, 1);
        let count = h.sink.statuses().len();
        h.radio.report_rssi(-82);
        h.manager.tick();
        assert_eq!(h.sink.statuses().len(), count);
    }

    #[test]
    fn test_scan_failure_reports_empty_list() {
        let mut h = harness(MemoryStore::new(8, 8));
        h.radio
            .set_scan_error(Some(crate::ble::BleRadioError::Platform(-1)));
        h.manager.enable(false);
        assert!(h.manager.start_scan(Duration::from_secs(5), false, false));
        assert!(h.wait_for(BleState::Failed));
        match &h.sink.scan_completions()[0] {
            RecordedEvent::ScanComplete { success, ids, .. } => {
                assert!(!success);
                assert!(ids.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        h.manager.tick();
        assert_eq!(h.manager.state(), BleState::Disconnected);
    }
}
