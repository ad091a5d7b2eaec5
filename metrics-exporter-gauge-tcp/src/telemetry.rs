use metrics::{counter, Counter};

use crate::publisher::DropReason;

/// Why an issued write failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FailureCause {
    /// The write was rejected by the socket.
    Rejected,

    /// The write was not acknowledged in time.
    Timeout,

    /// The connection broke while the write was outstanding.
    Disconnected,
}

impl FailureCause {
    const fn as_str(self) -> &'static str {
        match self {
            FailureCause::Rejected => "rejected",
            FailureCause::Timeout => "timeout",
            FailureCause::Disconnected => "disconnected",
        }
    }
}

/// Publisher telemetry.
///
/// `Telemetry` counts what the publisher does with the metrics it is given, and can be optionally enabled to report
/// this through the recorder that is current when the publisher is built.
#[derive(Clone)]
pub(crate) struct Telemetry {
    publications: Counter,
    dropped_filtered: Counter,
    dropped_rate_limited: Counter,
    dropped_cooling_down: Counter,
    dropped_connecting: Counter,
    dropped_write_in_flight: Counter,
    dropped_queue_full: Counter,
    writes_acknowledged: Counter,
    writes_failed_rejected: Counter,
    writes_failed_timeout: Counter,
    writes_failed_disconnected: Counter,
    connections_opened: Counter,
    connections_failed: Counter,
    acks_stale: Counter,
}

impl Telemetry {
    /// Creates a `Telemetry` instance registered against the current recorder.
    pub fn new() -> Self {
        let base_labels = telemetry_tags!();

        let dropped = |reason: DropReason| {
            let labels = telemetry_tags!("reason" => reason.as_str());
            counter!("gauge_publisher.client.publications_dropped", labels.iter())
        };
        let failed = |cause: FailureCause| {
            let labels = telemetry_tags!("cause" => cause.as_str());
            counter!("gauge_publisher.client.writes_failed", labels.iter())
        };

        Self {
            publications: counter!("gauge_publisher.client.publications", base_labels.iter()),
            dropped_filtered: dropped(DropReason::Filtered),
            dropped_rate_limited: dropped(DropReason::RateLimited),
            dropped_cooling_down: dropped(DropReason::CoolingDown),
            dropped_connecting: dropped(DropReason::Connecting),
            dropped_write_in_flight: dropped(DropReason::WriteInFlight),
            dropped_queue_full: dropped(DropReason::QueueFull),
            writes_acknowledged: counter!(
                "gauge_publisher.client.writes_acknowledged",
                base_labels.iter()
            ),
            writes_failed_rejected: failed(FailureCause::Rejected),
            writes_failed_timeout: failed(FailureCause::Timeout),
            writes_failed_disconnected: failed(FailureCause::Disconnected),
            connections_opened: counter!(
                "gauge_publisher.client.connections_opened",
                base_labels.iter()
            ),
            connections_failed: counter!(
                "gauge_publisher.client.connections_failed",
                base_labels.iter()
            ),
            acks_stale: counter!("gauge_publisher.client.acks_stale", base_labels.iter()),
        }
    }

    /// Creates a `Telemetry` instance that discards everything.
    pub fn noop() -> Self {
        Self {
            publications: Counter::noop(),
            dropped_filtered: Counter::noop(),
            dropped_rate_limited: Counter::noop(),
            dropped_cooling_down: Counter::noop(),
            dropped_connecting: Counter::noop(),
            dropped_write_in_flight: Counter::noop(),
            dropped_queue_full: Counter::noop(),
            writes_acknowledged: Counter::noop(),
            writes_failed_rejected: Counter::noop(),
            writes_failed_timeout: Counter::noop(),
            writes_failed_disconnected: Counter::noop(),
            connections_opened: Counter::noop(),
            connections_failed: Counter::noop(),
            acks_stale: Counter::noop(),
        }
    }

    /// Tracks a publication handed to the connection manager.
    pub fn track_publication_accepted(&self) {
        self.publications.increment(1);
    }

    /// Tracks a dropped publication.
    pub fn track_publication_dropped(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Filtered => &self.dropped_filtered,
            DropReason::RateLimited => &self.dropped_rate_limited,
            DropReason::CoolingDown => &self.dropped_cooling_down,
            DropReason::Connecting => &self.dropped_connecting,
            DropReason::WriteInFlight => &self.dropped_write_in_flight,
            DropReason::QueueFull => &self.dropped_queue_full,
        };
        counter.increment(1);
    }

    /// Tracks an acknowledged write.
    pub fn track_write_acknowledged(&self) {
        self.writes_acknowledged.increment(1);
    }

    /// Tracks a failed write.
    pub fn track_write_failed(&self, cause: FailureCause) {
        let counter = match cause {
            FailureCause::Rejected => &self.writes_failed_rejected,
            FailureCause::Timeout => &self.writes_failed_timeout,
            FailureCause::Disconnected => &self.writes_failed_disconnected,
        };
        counter.increment(1);
    }

    /// Tracks an established connection.
    pub fn track_connection_opened(&self) {
        self.connections_opened.increment(1);
    }

    /// Tracks a failed connection attempt.
    pub fn track_connection_failed(&self) {
        self.connections_failed.increment(1);
    }

    /// Tracks a discarded acknowledgment.
    pub fn track_stale_ack(&self) {
        self.acks_stale.increment(1);
    }
}

macro_rules! _telemetry_tags {
    ($($k:literal => $v:expr),*) => {
        [
            ::metrics::Label::from_static_parts("client", "rust"),
            ::metrics::Label::from_static_parts("client_version", env!("CARGO_PKG_VERSION")),
            ::metrics::Label::from_static_parts("client_transport", "tcp"),
            $(::metrics::Label::from_static_parts($k, $v),)*
        ]
    };
}

pub(crate) use _telemetry_tags as telemetry_tags;
