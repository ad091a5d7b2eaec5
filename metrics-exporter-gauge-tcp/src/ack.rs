use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering::AcqRel},
        Arc,
    },
    time::Duration,
};

use tokio::task::AbortHandle;

use crate::{connection::ConnectionId, metric::Metric};

/// A cancellable one-shot timer.
pub(crate) trait Timer {
    /// Cancels the timer.
    ///
    /// Returns `true` if the timer was cancelled before it fired, or `false` if it had already fired or been cancelled.
    /// Calling this more than once is harmless.
    fn cancel(&self) -> bool;
}

/// Timer bounding how long a write may remain unacknowledged.
///
/// The timer runs as its own task. Whichever of firing and cancelling happens first settles the timer, so an expiry
/// callback never runs after a successful `cancel`.
pub(crate) struct ExpiryTimer {
    settled: Arc<AtomicBool>,
    task: AbortHandle,
}

impl ExpiryTimer {
    /// Starts a timer that runs `on_expiry` once `timeout` has elapsed, unless cancelled first.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<F>(timeout: Duration, on_expiry: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let settled = Arc::new(AtomicBool::new(false));
        let task_settled = Arc::clone(&settled);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !task_settled.swap(true, AcqRel) {
                on_expiry();
            }
        })
        .abort_handle();

        Self { settled, task }
    }
}

impl Timer for ExpiryTimer {
    fn cancel(&self) -> bool {
        let cancelled = !self.settled.swap(true, AcqRel);
        self.task.abort();
        cancelled
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Outcome of a write, as reported by the connection.
#[derive(Debug)]
pub(crate) enum AckOutcome {
    /// The line was handed off to the collector.
    Delivered,

    /// The write was rejected.
    Failed(io::Error),
}

/// Acknowledgment of a specific write on a specific connection.
#[derive(Debug)]
pub(crate) struct Acknowledgment {
    pub connection: ConnectionId,
    pub sequence: u64,
    pub outcome: AckOutcome,
}

/// A write that has been issued but not yet acknowledged.
pub(crate) struct PendingWrite<T> {
    pub metric: Metric,
    pub sequence: u64,
    pub expiry: T,
}

/// How an acknowledgment or expiry resolved the pending write.
#[derive(Debug)]
pub(crate) enum Resolution {
    /// Nothing matched: there is no pending write, or it has a different sequence.
    Stale,

    /// The pending write was delivered.
    Delivered(Metric),

    /// The pending write failed.
    Failed(Metric, io::Error),

    /// The pending write expired before it was acknowledged.
    Expired(Metric),
}

/// Tracks the single outstanding write of a connection.
pub(crate) struct AckTracker<T> {
    pending: Option<PendingWrite<T>>,
}

impl<T: Timer> AckTracker<T> {
    /// Creates a new, empty `AckTracker`.
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// Returns `true` if a write is currently outstanding.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Starts tracking the given write.
    pub fn track(&mut self, pending: PendingWrite<T>) {
        debug_assert!(self.pending.is_none(), "write issued while another was outstanding");
        self.pending = Some(pending);
    }

    /// Resolves the pending write with the outcome reported for `sequence`.
    ///
    /// If the expiry timer fired before the acknowledgment could cancel it, the write is considered expired no matter
    /// what the acknowledgment says.
    pub fn resolve(&mut self, sequence: u64, outcome: AckOutcome) -> Resolution {
        let pending = match self.pending.take() {
            Some(pending) if pending.sequence == sequence => pending,
            other => {
                self.pending = other;
                return Resolution::Stale;
            }
        };

        if !pending.expiry.cancel() {
            return Resolution::Expired(pending.metric);
        }

        match outcome {
            AckOutcome::Delivered => Resolution::Delivered(pending.metric),
            AckOutcome::Failed(e) => Resolution::Failed(pending.metric, e),
        }
    }

    /// Expires the pending write, if it has the given sequence.
    pub fn expire(&mut self, sequence: u64) -> Resolution {
        match self.pending.take() {
            Some(pending) if pending.sequence == sequence => {
                pending.expiry.cancel();
                Resolution::Expired(pending.metric)
            }
            other => {
                self.pending = other;
                Resolution::Stale
            }
        }
    }

    /// Drops the pending write, if any, cancelling its expiry timer.
    pub fn abandon(&mut self) -> Option<Metric> {
        self.pending.take().map(|pending| {
            pending.expiry.cancel();
            pending.metric
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        io,
        sync::{
            atomic::{AtomicBool, Ordering::AcqRel},
            Arc,
        },
        time::Duration,
    };

    use tokio::sync::mpsc;

    use super::{AckOutcome, AckTracker, ExpiryTimer, PendingWrite, Resolution, Timer};
    use crate::metric::Metric;

    /// Timer whose firing is controlled by the test.
    #[derive(Clone, Default)]
    pub struct ManualTimer {
        settled: Arc<AtomicBool>,
    }

    impl ManualTimer {
        /// Fires the timer, returning `true` if it had not already been settled.
        pub fn fire(&self) -> bool {
            !self.settled.swap(true, AcqRel)
        }
    }

    impl Timer for ManualTimer {
        fn cancel(&self) -> bool {
            !self.settled.swap(true, AcqRel)
        }
    }

    fn pending(sequence: u64, timer: &ManualTimer) -> PendingWrite<ManualTimer> {
        PendingWrite { metric: Metric::gauge("m1", 6.0), sequence, expiry: timer.clone() }
    }

    #[test]
    fn matching_ack_resolves_and_cancels() {
        let timer = ManualTimer::default();
        let mut tracker = AckTracker::new();
        tracker.track(pending(1, &timer));

        let resolution = tracker.resolve(1, AckOutcome::Delivered);
        assert!(matches!(resolution, Resolution::Delivered(m) if m.name() == "m1"));
        assert!(!tracker.is_pending());

        // The timer was cancelled, so it can no longer fire.
        assert!(!timer.fire());
    }

    #[test]
    fn mismatched_ack_is_stale() {
        let timer = ManualTimer::default();
        let mut tracker = AckTracker::new();

        assert!(matches!(tracker.resolve(1, AckOutcome::Delivered), Resolution::Stale));

        tracker.track(pending(2, &timer));
        assert!(matches!(tracker.resolve(1, AckOutcome::Delivered), Resolution::Stale));
        assert!(matches!(tracker.expire(3), Resolution::Stale));
        assert!(tracker.is_pending());
        assert!(timer.fire());
    }

    #[test]
    fn failed_ack_surfaces_error() {
        let timer = ManualTimer::default();
        let mut tracker = AckTracker::new();
        tracker.track(pending(1, &timer));

        let rejected = io::Error::new(io::ErrorKind::Other, "rejected");
        let resolution = tracker.resolve(1, AckOutcome::Failed(rejected));
        assert!(matches!(resolution, Resolution::Failed(_, e) if e.to_string() == "rejected"));
    }

    #[test]
    fn fired_timer_takes_priority_over_late_ack() {
        let timer = ManualTimer::default();
        let mut tracker = AckTracker::new();
        tracker.track(pending(1, &timer));

        assert!(timer.fire());
        assert!(matches!(tracker.resolve(1, AckOutcome::Delivered), Resolution::Expired(_)));

        // The expiry event that follows finds nothing left to expire.
        assert!(matches!(tracker.expire(1), Resolution::Stale));
    }

    #[test]
    fn abandon_cancels_timer() {
        let timer = ManualTimer::default();
        let mut tracker = AckTracker::new();
        assert!(tracker.abandon().is_none());

        tracker.track(pending(1, &timer));
        assert!(tracker.abandon().is_some());
        assert!(!tracker.is_pending());
        assert!(!timer.fire());
    }

    #[tokio::test]
    async fn expiry_timer_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = ExpiryTimer::start(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });

        assert_eq!(rx.recv().await, Some(()));
        assert!(!timer.cancel());
        assert!(!timer.cancel());
    }

    #[tokio::test]
    async fn cancelled_expiry_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let timer = ExpiryTimer::start(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });

        assert!(timer.cancel());
        assert!(!timer.cancel());

        // Aborting the timer task drops the callback, and with it the only sender.
        assert_eq!(rx.recv().await, None);
    }
}
