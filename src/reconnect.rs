//! Debounced auto-reconnect timer shared by both managers.

use crate::registry::PrimaryId;
use std::time::{Duration, Instant};

/// Decides when a disconnected manager should retry its last link.
///
/// An attempt is due once the manager has been disconnected for at least one
/// interval and the last attempt is at least one interval old. Every attempt
/// resets the timer regardless of its outcome.
#[derive(Debug)]
pub(crate) struct ReconnectTimer {
    interval: Duration,
    enabled: bool,
    target: Option<PrimaryId>,
    disconnected_since: Option<Instant>,
    last_attempt: Option<Instant>,
}

impl ReconnectTimer {
    pub(crate) fn new(interval: Duration, enabled: bool) -> Self {
        Self {
            interval,
            enabled,
            target: None,
            disconnected_since: None,
            last_attempt: None,
        }
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// A link to `id` came up.
    pub(crate) fn connected(&mut self, id: PrimaryId) {
        self.target = Some(id);
        self.disconnected_since = None;
        self.last_attempt = None;
    }

    /// The manager entered `Disconnected` at `now`.
    pub(crate) fn disconnected(&mut self, now: Instant) {
        if self.disconnected_since.is_none() {
            self.disconnected_since = Some(now);
        }
    }

    /// Stop retrying until the next successful connect.
    pub(crate) fn forget(&mut self) {
        self.target = None;
    }

    /// Forget the target only if it is `id`.
    pub(crate) fn forget_if(&mut self, id: &PrimaryId) {
        if self.target.as_ref() == Some(id) {
            self.target = None;
        }
    }

    /// Returns the id to reconnect to if an attempt is due, recording the
    /// attempt.
    pub(crate) fn due(&mut self, now: Instant) -> Option<PrimaryId> {
        if !self.enabled {
            return None;
        }
        let target = self.target.clone()?;
        let since = match (self.disconnected_since, self.last_attempt) {
            (Some(d), Some(a)) => d.max(a),
            (Some(d), None) => d,
            (None, Some(a)) => a,
            (None, None) => {
                self.disconnected_since = Some(now);
                return None;
            }
        };
        if now.saturating_duration_since(since) < self.interval {
            return None;
        }
        self.last_attempt = Some(now);
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_target_never_due() {
        let mut timer = ReconnectTimer::new(Duration::from_secs(30), true);
        let t0 = Instant::now();
        timer.disconnected(t0);
        assert!(timer.due(t0 + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_due_once_per_interval() {
        let mut timer = ReconnectTimer::new(Duration::from_secs(30), true);
        let id = PrimaryId::address("aa:bb:cc:dd:ee:ff");
        let t0 = Instant::now();
        timer.connected(id.clone());
        timer.disconnected(t0);

        assert!(timer.due(t0 + Duration::from_secs(29)).is_none());
        assert_eq!(timer.due(t0 + Duration::from_secs(30)), Some(id.clone()));
        assert!(timer.due(t0 + Duration::from_secs(31)).is_none());
        assert!(timer.due(t0 + Duration::from_secs(59)).is_none());
        assert_eq!(timer.due(t0 + Duration::from_secs(60)), Some(id));
    }

    #[test]
    fn test_disabled_or_forgotten() {
        let mut timer = ReconnectTimer::new(Duration::from_secs(1), false);
        let id = PrimaryId::ssid("Home");
        let t0 = Instant::now();
        timer.connected(id.clone());
        timer.disconnected(t0);
        assert!(timer.due(t0 + Duration::from_secs(5)).is_none());

        timer.set_enabled(true);
        timer.forget_if(&PrimaryId::ssid("Other"));
        assert!(timer.due(t0 + Duration::from_secs(5)).is_some());
        timer.forget();
        assert!(timer.due(t0 + Duration::from_secs(10)).is_none());
    }

    #[test]
    fn test_reconnect_clears_timer() {
        let mut timer = ReconnectTimer::new(Duration::from_secs(10), true);
        let id = PrimaryId::ssid("Home");
        let t0 = Instant::now();
        timer.connected(id.clone());
        timer.disconnected(t0);
        assert!(timer.due(t0 + Duration::from_secs(10)).is_some());
        timer.connected(id);
        timer.disconnected(t0 + Duration::from_secs(12));
        assert!(timer.due(t0 + Duration::from_secs(15)).is_none());
        assert!(timer.due(t0 + Duration::from_secs(22)).is_some());
    }
}
