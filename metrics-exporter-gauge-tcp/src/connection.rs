use std::{
    fmt, io,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::{
    ack::{AckTracker, Acknowledgment, PendingWrite, Resolution, Timer},
    metric::Metric,
    publisher::DropReason,
    telemetry::{FailureCause, Telemetry},
    wire::LineEncoder,
};

/// Identifies a single connection attempt.
///
/// Every connect gets a fresh identifier, so signals from a torn-down connection can always be told apart from signals
/// for the current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Performs the I/O requested by the connection manager.
///
/// Completions are reported back to the manager asynchronously: `connect` is answered by
/// [`ConnectionManager::connected`] or [`ConnectionManager::connect_failed`], and `write` by
/// [`ConnectionManager::acknowledged`] or, once the returned timer fires, [`ConnectionManager::expired`].
pub(crate) trait Driver {
    /// Timer bounding how long a write may remain unacknowledged.
    type Timer: Timer;

    /// Starts connecting to the collector.
    fn connect(&mut self, connection: ConnectionId);

    /// Writes a line on the given connection, arming the acknowledgment timer for it.
    fn write(&mut self, connection: ConnectionId, sequence: u64, line: Bytes) -> Self::Timer;

    /// Closes the given connection, or abandons the attempt to establish it.
    fn close(&mut self, connection: ConnectionId);
}

/// Connection status, as observed from outside the publisher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection. The next accepted publication will connect.
    Idle,

    /// No connection, and the reconnect cooldown after a failure has not elapsed yet.
    CoolingDown,

    /// A connection attempt is in flight.
    Connecting,

    /// Connected to the collector.
    Active,
}

enum ConnectionState {
    // No socket. Connecting is not permitted before `eligible_at`, if set.
    Idle { eligible_at: Option<Instant> },

    // Connect in flight, with the metric to write once it completes.
    Connecting { connection: ConnectionId, metric: Metric },

    // Socket usable, with at most one write outstanding.
    Active { connection: ConnectionId, last_sequence: u64 },
}

/// Drives the connection lifecycle: `Idle` → `Connecting` → `Active` → `Idle` on failure.
///
/// The manager performs no I/O itself. It asks its [`Driver`] to connect, write and close, and is told about
/// completions, acknowledgments and expiries as they happen. All calls are expected to come from a single task.
pub(crate) struct ConnectionManager<D: Driver> {
    state: ConnectionState,
    tracker: AckTracker<D::Timer>,
    encoder: LineEncoder,
    reconnect_cooldown: Duration,
    next_connection: u64,
    telemetry: Telemetry,
}

impl<D: Driver> ConnectionManager<D> {
    /// Creates a new, idle `ConnectionManager`.
    pub fn new(encoder: LineEncoder, reconnect_cooldown: Duration, telemetry: Telemetry) -> Self {
        Self {
            state: ConnectionState::Idle { eligible_at: None },
            tracker: AckTracker::new(),
            encoder,
            reconnect_cooldown,
            next_connection: 1,
            telemetry,
        }
    }

    /// Returns the connection status at `now`.
    pub fn status(&self, now: Instant) -> ConnectionStatus {
        match self.state {
            ConnectionState::Idle { eligible_at: Some(at) } if now < at => {
                ConnectionStatus::CoolingDown
            }
            ConnectionState::Idle { .. } => ConnectionStatus::Idle,
            ConnectionState::Connecting { .. } => ConnectionStatus::Connecting,
            ConnectionState::Active { .. } => ConnectionStatus::Active,
        }
    }

    /// Returns `true` if a write is outstanding.
    pub fn write_in_flight(&self) -> bool {
        self.tracker.is_pending()
    }

    /// Publishes a metric that has already passed the rate gate.
    ///
    /// When idle, this starts a connection attempt and the metric is written once it succeeds. When active, the metric
    /// is written immediately.
    ///
    /// # Errors
    ///
    /// If the metric cannot be sent right now, it is dropped and the reason is returned.
    pub fn publish(
        &mut self,
        driver: &mut D,
        now: Instant,
        metric: Metric,
    ) -> Result<(), DropReason> {
        match &mut self.state {
            ConnectionState::Idle { eligible_at } => {
                if eligible_at.is_some_and(|at| now < at) {
                    trace!(metric_name = metric.name(), "Dropping metric while cooling down.");
                    return Err(DropReason::CoolingDown);
                }

                let connection = ConnectionId(self.next_connection);
                self.next_connection += 1;

                debug!(%connection, "Connecting to collector.");
                driver.connect(connection);
                self.state = ConnectionState::Connecting { connection, metric };
                Ok(())
            }
            ConnectionState::Connecting { .. } => {
                trace!(metric_name = metric.name(), "Dropping metric while connecting.");
                Err(DropReason::Connecting)
            }
            ConnectionState::Active { connection, last_sequence } => {
                if self.tracker.is_pending() {
                    let metric_name = metric.name();
                    trace!(metric_name, "Dropping metric while a write is in flight.");
                    return Err(DropReason::WriteInFlight);
                }

                *last_sequence += 1;
                let (connection, sequence) = (*connection, *last_sequence);
                self.write(driver, connection, sequence, metric);
                Ok(())
            }
        }
    }

    /// Handles a connection attempt completing successfully.
    pub fn connected(&mut self, driver: &mut D, connection: ConnectionId) {
        let state = std::mem::replace(&mut self.state, ConnectionState::Idle { eligible_at: None });
        match state {
            ConnectionState::Connecting { connection: expected, metric }
                if expected == connection =>
            {
                debug!(%connection, "Connected to collector.");
                self.telemetry.track_connection_opened();

                self.state = ConnectionState::Active { connection, last_sequence: 1 };
                self.write(driver, connection, 1, metric);
            }
            state => {
                self.state = state;

                trace!(%connection, "Closing connection that is no longer wanted.");
                driver.close(connection);
            }
        }
    }

    /// Handles a connection attempt failing.
    pub fn connect_failed(&mut self, now: Instant, connection: ConnectionId, error: &io::Error) {
        match self.state {
            ConnectionState::Connecting { connection: expected, .. } if expected == connection => {
                warn!(%connection, %error, "Failed to connect to collector.");
                self.telemetry.track_connection_failed();
                self.enter_cooldown(now);
            }
            _ => trace!(%connection, "Ignoring stale connection failure."),
        }
    }

    /// Handles the acknowledgment of a write.
    pub fn acknowledged(&mut self, driver: &mut D, now: Instant, ack: Acknowledgment) {
        let Acknowledgment { connection, sequence, outcome } = ack;
        if !self.is_active(connection) {
            trace!(%connection, sequence, "Discarding stale acknowledgment.");
            self.telemetry.track_stale_ack();
            return;
        }

        match self.tracker.resolve(sequence, outcome) {
            Resolution::Stale => {
                trace!(%connection, sequence, "Discarding stale acknowledgment.");
                self.telemetry.track_stale_ack();
            }
            Resolution::Delivered(metric) => {
                trace!(%connection, sequence, metric_name = metric.name(), "Write acknowledged.");
                self.telemetry.track_write_acknowledged();
            }
            Resolution::Failed(metric, error) => {
                let metric_name = metric.name();
                warn!(%connection, sequence, metric_name, %error, "Write rejected.");
                self.telemetry.track_write_failed(FailureCause::Rejected);
                self.reset(driver, now, connection);
            }
            Resolution::Expired(metric) => {
                warn!(%connection, sequence, metric_name = metric.name(), "Write timed out.");
                self.telemetry.track_write_failed(FailureCause::Timeout);
                self.reset(driver, now, connection);
            }
        }
    }

    /// Handles the acknowledgment timer of a write firing.
    pub fn expired(
        &mut self,
        driver: &mut D,
        now: Instant,
        connection: ConnectionId,
        sequence: u64,
    ) {
        if !self.is_active(connection) {
            trace!(%connection, sequence, "Ignoring stale write expiry.");
            return;
        }

        match self.tracker.expire(sequence) {
            Resolution::Expired(metric) => {
                warn!(%connection, sequence, metric_name = metric.name(), "Write timed out.");
                self.telemetry.track_write_failed(FailureCause::Timeout);
                self.reset(driver, now, connection);
            }
            _ => trace!(%connection, sequence, "Ignoring stale write expiry."),
        }
    }

    /// Handles an established connection breaking, independently of any write.
    pub fn disconnected(
        &mut self,
        driver: &mut D,
        now: Instant,
        connection: ConnectionId,
        error: Option<&io::Error>,
    ) {
        if !self.is_active(connection) {
            trace!(%connection, "Ignoring stale disconnection.");
            return;
        }

        match error {
            Some(error) => warn!(%connection, %error, "Connection to collector failed."),
            None => warn!(%connection, "Connection closed by collector."),
        }

        if self.tracker.is_pending() {
            self.telemetry.track_write_failed(FailureCause::Disconnected);
        }
        self.reset(driver, now, connection);
    }

    /// Closes any connection and cancels any outstanding write.
    pub fn shutdown(&mut self, driver: &mut D) {
        self.tracker.abandon();

        let state = std::mem::replace(&mut self.state, ConnectionState::Idle { eligible_at: None });
        match state {
            ConnectionState::Connecting { connection, .. }
            | ConnectionState::Active { connection, .. } => {
                debug!(%connection, "Closing connection for shutdown.");
                driver.close(connection);
            }
            ConnectionState::Idle { .. } => {}
        }
    }

    fn is_active(&self, connection: ConnectionId) -> bool {
        matches!(
            self.state,
            ConnectionState::Active { connection: current, .. } if current == connection
        )
    }

    fn write(&mut self, driver: &mut D, connection: ConnectionId, sequence: u64, metric: Metric) {
        let line = self.encoder.encode(&metric);

        trace!(%connection, sequence, metric_name = metric.name(), "Writing metric.");
        let expiry = driver.write(connection, sequence, line);
        self.tracker.track(PendingWrite { metric, sequence, expiry });
    }

    fn reset(&mut self, driver: &mut D, now: Instant, connection: ConnectionId) {
        self.tracker.abandon();
        driver.close(connection);
        self.enter_cooldown(now);

        debug!(%connection, cooldown = ?self.reconnect_cooldown, "Connection reset.");
    }

    fn enter_cooldown(&mut self, now: Instant) {
        self.state = ConnectionState::Idle { eligible_at: Some(now + self.reconnect_cooldown) };
    }
}
