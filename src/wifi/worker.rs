//! Wi-Fi scan and connect worker bodies.

use super::platform::{strongest_per_ssid, LinkInfo, WifiRadio, WifiRadioError};
use crate::persistence::SavedNetwork;
use crate::registry::ScanHit;
use crate::worker::{HitSender, PushOutcome};
use log::{debug, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Result of a scan worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScanOutcome {
    pub error: Option<WifiRadioError>,
    pub networks: usize,
    pub hits_dropped: usize,
}

/// Result of a connect worker.
#[derive(Debug)]
pub(crate) struct ConnectOutcome {
    pub network: SavedNetwork,
    /// Credentials were supplied by the caller and should be saved on success.
    pub save: bool,
    pub result: Result<LinkInfo, WifiRadioError>,
    pub elapsed: Duration,
}

pub(crate) fn run_scan(
    radio: Arc<dyn WifiRadio>,
    cancel: CancellationToken,
    hits: HitSender<ScanHit>,
) -> ScanOutcome {
    let aps = match radio.scan(&cancel) {
        Ok(aps) => strongest_per_ssid(aps),
        Err(e) => {
            return ScanOutcome {
                error: Some(e),
                networks: 0,
                hits_dropped: 0,
            }
        }
    };

    let mut hits_dropped = 0;
    for ap in &aps {
        match hits.push(ap.to_hit()) {
            PushOutcome::Sent => {}
            PushOutcome::Dropped => hits_dropped += 1,
            PushOutcome::Closed => break,
        }
    }
    if hits_dropped > 0 {
        warn!("[wifi] Scan dropped {} networks under backpressure", hits_dropped);
    }
    debug!("[wifi] Scan worker done: {} networks", aps.len());
    ScanOutcome {
        error: None,
        networks: aps.len(),
        hits_dropped,
    }
}

pub(crate) fn run_connect(
    radio: Arc<dyn WifiRadio>,
    network: SavedNetwork,
    save: bool,
    timeout: Duration,
) -> ConnectOutcome {
    let started = Instant::now();
    let result = radio.connect(&network, timeout);
    ConnectOutcome {
        network,
        save,
        result,
        elapsed: started.elapsed(),
    }
}
