//! Background workers for blocking radio operations.
//!
//! Scans and connects block the radio stack for seconds, so each runs on its
//! own short-lived thread. A worker hands results back in two ways:
//!
//! - a bounded channel of scan hits ([`HitSender`]), drained incrementally by
//!   the owning manager's tick
//! - a one-shot completion carrying the worker's result record ([`Worker::poll`])
//!
//! Neither the worker nor the manager ever blocks on the other. The worker
//! only waits a short backpressure timeout when the hit channel is full, and
//! the manager polls the completion without waiting.

use log::{debug, warn};
use std::io;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::{TryRecvError as ChannelEmpty, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Stack size for worker threads. Radio calls into ESP-IDF need headroom.
const WORKER_STACK_SIZE: usize = 8 * 1024;

/// Poll interval while a caller waits synchronously on a radio.
pub(crate) const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// State of a worker's one-shot completion.
#[derive(Debug)]
pub(crate) enum WorkerPoll<T> {
    /// Still running.
    Pending,
    /// Finished with a result. Returned once.
    Ready(T),
    /// The worker exited without reporting (it panicked).
    Lost,
}

/// Handle to a running worker, owned by exactly one manager.
#[derive(Debug)]
pub(crate) struct Worker<T> {
    name: &'static str,
    started: Instant,
    cancel: CancellationToken,
    done: oneshot::Receiver<T>,
}

/// Spawn a named worker thread running `job`.
///
/// The job receives a cancellation token; honoring it is best-effort since
/// platform calls cannot be preempted.
pub(crate) fn spawn_worker<T, F>(name: &'static str, job: F) -> io::Result<Worker<T>>
where
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> T + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let (tx, rx) = oneshot::channel();

    thread::Builder::new()
        .name(name.to_string())
        .stack_size(WORKER_STACK_SIZE)
        .spawn(move || {
            let result = job(token);
            if tx.send(result).is_err() {
                debug!("[worker] {} finished after its owner went away", name);
            }
        })?;

    debug!("[worker] {} started", name);
    Ok(Worker {
        name,
        started: Instant::now(),
        cancel,
        done: rx,
    })
}

impl<T> Worker<T> {
    /// Time since the worker was spawned.
    pub(crate) fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Ask the worker to stop early.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check for completion without blocking.
    pub(crate) fn poll(&mut self) -> WorkerPoll<T> {
        match self.done.try_recv() {
            Ok(result) => WorkerPoll::Ready(result),
            Err(oneshot::error::TryRecvError::Empty) => WorkerPoll::Pending,
            Err(oneshot::error::TryRecvError::Closed) => {
                warn!("[worker] {} exited without a result", self.name);
                WorkerPoll::Lost
            }
        }
    }

    /// Block until the worker finishes or `timeout` elapses.
    ///
    /// Only for caller-initiated synchronous paths, never from a tick.
    pub(crate) fn wait(&mut self, timeout: Duration) -> WorkerPoll<T> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.poll() {
                WorkerPoll::Pending if Instant::now() < deadline => {
                    thread::sleep(WAIT_POLL_INTERVAL)
                }
                other => return other,
            }
        }
    }
}

/// Outcome of pushing one hit into the scan channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Sent,
    /// Channel stayed full past the backpressure timeout; the hit was dropped.
    Dropped,
    /// The manager dropped the receiving end.
    Closed,
}

/// Sending half of a bounded scan-hit channel, used by scan workers.
#[derive(Debug)]
pub(crate) struct HitSender<T> {
    tx: mpsc::Sender<T>,
    backpressure: Duration,
}

/// Create a bounded scan-hit channel.
pub(crate) fn hit_channel<T>(
    capacity: usize,
    backpressure: Duration,
) -> (HitSender<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (HitSender { tx, backpressure }, rx)
}

impl<T> HitSender<T> {
    /// Push a hit, waiting at most the backpressure timeout when full.
    ///
    /// A hit that still does not fit is dropped; the registry heals on the
    /// next scan.
    pub(crate) fn push(&self, hit: T) -> PushOutcome {
        let hit = match self.tx.try_send(hit) {
            Ok(()) => return PushOutcome::Sent,
            Err(TrySendError::Closed(_)) => return PushOutcome::Closed,
            Err(TrySendError::Full(hit)) => hit,
        };
        thread::sleep(self.backpressure);
        match self.tx.try_send(hit) {
            Ok(()) => PushOutcome::Sent,
            Err(TrySendError::Full(_)) => PushOutcome::Dropped,
            Err(TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }
}

/// Take at most `max` hits from `rx` without blocking.
pub(crate) fn drain_hits<T>(rx: &mut mpsc::Receiver<T>, max: usize) -> Vec<T> {
    let mut hits = Vec::new();
    while hits.len() < max {
        match rx.try_recv() {
            Ok(hit) => hits.push(hit),
            Err(ChannelEmpty::Empty) | Err(ChannelEmpty::Disconnected) => break,
        }
    }
    hits
}

/// Poll `done` every few milliseconds until it returns `true` or `timeout`
/// elapses. Returns whether `done` succeeded.
pub(crate) fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_worker_reports_once() {
        let mut worker = spawn_worker("test-worker", |_| 42u32).unwrap();
        match worker.wait(Duration::from_secs(2)) {
            WorkerPoll::Ready(v) => assert_eq!(v, 42),
            other => panic!("unexpected {:?}", other),
        }
        // The completion is consumed; the sender is gone now
        assert!(matches!(worker.poll(), WorkerPoll::Lost));
    }

    #[test]
    fn test_worker_pending_then_cancelled() {
        let mut worker = spawn_worker("test-cancel", |cancel: CancellationToken| {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            "cancelled"
        })
        .unwrap();
        assert!(matches!(worker.poll(), WorkerPoll::Pending));
        worker.cancel();
        assert!(matches!(
            worker.wait(Duration::from_secs(2)),
            WorkerPoll::Ready("cancelled")
        ));
    }

    #[test]
    fn test_panicking_worker_is_lost() {
        let mut worker = spawn_worker::<u8, _>("test-panic", |_| panic!("boom")).unwrap();
        assert!(matches!(worker.wait(Duration::from_secs(2)), WorkerPoll::Lost));
    }

    #[test]
    fn test_full_channel_drops_after_backpressure() {
        let (tx, mut rx) = hit_channel(2, Duration::from_millis(1));
        assert_eq!(tx.push(1), PushOutcome::Sent);
        assert_eq!(tx.push(2), PushOutcome::Sent);
        assert_eq!(tx.push(3), PushOutcome::Dropped);

        assert_eq!(drain_hits(&mut rx, 16), vec![1, 2]);
        assert_eq!(tx.push(4), PushOutcome::Sent);
        drop(rx);
        assert_eq!(tx.push(5), PushOutcome::Closed);
    }

    #[test]
    fn test_drain_respects_limit() {
        let (tx, mut rx) = hit_channel(8, Duration::from_millis(1));
        for i in 0..5 {
            assert_eq!(tx.push(i), PushOutcome::Sent);
        }
        assert_eq!(drain_hits(&mut rx, 3), vec![0, 1, 2]);
        assert_eq!(drain_hits(&mut rx, 3), vec![3, 4]);
        assert!(drain_hits(&mut rx, 3).is_empty());
    }

    #[test]
    fn test_wait_until() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = flag.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.store(true, Ordering::SeqCst);
        });
        assert!(wait_until(Duration::from_secs(2), || flag.load(Ordering::SeqCst)));
        assert!(!wait_until(Duration::from_millis(20), || false));
    }
}
