//! Radio arbitration between the BLE and Wi-Fi managers.
//!
//! Both subsystems share one radio. Before starting a scan or connect, each
//! manager asks its peer [`RadioArbiter::is_busy`]; if the peer is busy the
//! operation is deferred and retried on a later tick. Being enabled does not
//! count as busy, only an in-flight scan or connect does.
//!
//! Each manager publishes its own activity through a [`RadioActivity`] flag.
//! The flag is handed to the peer as an `Arc<dyn RadioArbiter>`, so neither
//! manager holds a reference to the other.

use std::sync::atomic::{AtomicBool, Ordering};

/// Query implemented by each manager for the other.
pub trait RadioArbiter: Send + Sync {
    /// Whether this radio is mid-scan or mid-connect.
    fn is_busy(&self) -> bool;
}

/// Busy flag owned by one manager and read by its peer.
#[derive(Debug, Default)]
pub struct RadioActivity {
    busy: AtomicBool,
}

impl RadioActivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set by the owning manager only.
    pub(crate) fn set_busy(&self, busy: bool) {
        // Release pairs with the Acquire in is_busy so the peer observes the
        // flag before any radio call the owner makes afterwards
        self.busy.store(busy, Ordering::Release);
    }
}

impl RadioArbiter for RadioActivity {
    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Peer used when no other radio is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPeer;

impl RadioArbiter for NoPeer {
    fn is_busy(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_activity_visible_through_trait_object() {
        let activity = Arc::new(RadioActivity::new());
        let peer: Arc<dyn RadioArbiter> = activity.clone();
        assert!(!peer.is_busy());
        activity.set_busy(true);
        assert!(peer.is_busy());
        activity.set_busy(false);
        assert!(!peer.is_busy());
    }

    #[test]
    fn test_no_peer_never_busy() {
        assert!(!NoPeer.is_busy());
    }
}
