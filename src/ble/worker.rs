//! BLE scan and connect worker bodies.
//!
//! Each runs on a worker thread and returns a plain result record; nothing
//! here touches the registry or the manager's state.

use super::platform::{BleRadio, BleRadioError, ConnectInfo, ConnectTarget};
use crate::registry::{bounded, ScanHit, MAX_ID_LEN, MAX_NAME_LEN};
use crate::worker::{HitSender, PushOutcome};
use log::{debug, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Result of a scan worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScanOutcome {
    pub error: Option<BleRadioError>,
    pub hits_sent: usize,
    pub hits_dropped: usize,
}

impl ScanOutcome {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a connect worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectOutcome {
    pub target: ConnectTarget,
    pub result: Result<ConnectInfo, BleRadioError>,
    pub elapsed: Duration,
}

pub(crate) fn run_scan(
    radio: Arc<dyn BleRadio>,
    duration: Duration,
    cancel: CancellationToken,
    hits: HitSender<ScanHit>,
    key_by_service_uuid: bool,
) -> ScanOutcome {
    let mut hits_sent = 0;
    let mut hits_dropped = 0;
    let result = radio.scan(duration, &cancel, &mut |advert| {
        match hits.push(advert.into_hit(key_by_service_uuid)) {
            PushOutcome::Sent => hits_sent += 1,
            PushOutcome::Dropped => hits_dropped += 1,
            // Manager abandoned this scan; stop early
            PushOutcome::Closed => cancel.cancel(),
        }
    });
    if hits_dropped > 0 {
        warn!("[ble] Scan dropped {} hits under backpressure", hits_dropped);
    }
    debug!("[ble] Scan worker done: {} hits", hits_sent);
    ScanOutcome {
        error: result.err(),
        hits_sent,
        hits_dropped,
    }
}

pub(crate) fn run_connect(
    radio: Arc<dyn BleRadio>,
    target: ConnectTarget,
    timeout: Duration,
) -> ConnectOutcome {
    let started = Instant::now();
    let result = radio.connect(&target, timeout).map(|info| ConnectInfo {
        address: bounded(&info.address.to_ascii_lowercase(), MAX_ID_LEN),
        name: bounded(&info.name, MAX_NAME_LEN),
        service_uuid: info
            .service_uuid
            .map(|u| bounded(&u.to_ascii_lowercase(), MAX_ID_LEN)),
        rssi: info.rssi,
    });
    ConnectOutcome {
        target,
        result,
        elapsed: started.elapsed(),
    }
}
