use std::{fmt, sync::Arc, time::Instant};

use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tracing::{debug, trace};

use crate::{
    connection::{ConnectionManager, ConnectionStatus, Driver as _},
    filter::MetricFilter,
    gate::RateGate,
    metric::Metric,
    telemetry::Telemetry,
    transport::{Event, TcpDriver},
};

/// Errors that could occur while publishing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The publisher has shut down.
    #[error("publisher has shut down")]
    Closed,
}

/// Why a publication was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The filtering policy rejected the metric name.
    Filtered,

    /// Another publication was accepted less than the debounce interval ago.
    RateLimited,

    /// The connection failed recently, and the reconnect cooldown has not elapsed yet.
    CoolingDown,

    /// A connection attempt is already in flight.
    Connecting,

    /// The previous write has not been acknowledged yet.
    WriteInFlight,

    /// The publisher was handed more publications than it could keep up with.
    QueueFull,
}

impl DropReason {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            DropReason::Filtered => "filtered",
            DropReason::RateLimited => "rate_limited",
            DropReason::CoolingDown => "cooling_down",
            DropReason::Connecting => "connecting",
            DropReason::WriteInFlight => "write_in_flight",
            DropReason::QueueFull => "queue_full",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a publication.
///
/// `Accepted` only means that the metric was handed off for delivery. Delivery itself is best-effort: a write that
/// later fails or times out is not retried, and is not reported back to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Publication {
    /// The metric was handed off for delivery.
    Accepted,

    /// The metric was dropped.
    Dropped(DropReason),
}

impl Publication {
    /// Returns `true` if the metric was handed off for delivery.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Publication::Accepted)
    }
}

/// Point-in-time status of a publisher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublisherStatus {
    connection: ConnectionStatus,
    write_in_flight: bool,
}

impl PublisherStatus {
    /// Returns the status of the connection to the collector.
    pub fn connection(&self) -> ConnectionStatus {
        self.connection
    }

    /// Returns `true` if a write is waiting to be acknowledged.
    pub fn write_in_flight(&self) -> bool {
        self.write_in_flight
    }
}

pub(crate) enum Command {
    Publish { metric: Metric, reply: Option<oneshot::Sender<Publication>> },
    Status(oneshot::Sender<PublisherStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle for publishing gauges to the collector.
///
/// All state is owned by a single event loop running on a Tokio runtime. Handles are cheap to clone, and every clone
/// feeds the same event loop through a bounded queue. The event loop stops once
/// [`shutdown`](GaugePublisher::shutdown) is called or every handle has been dropped, closing the connection.
#[derive(Clone)]
pub struct GaugePublisher {
    commands: mpsc::Sender<Command>,
    filter: Arc<dyn MetricFilter>,
    telemetry: Telemetry,
}

impl GaugePublisher {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        filter: Arc<dyn MetricFilter>,
        telemetry: Telemetry,
    ) -> Self {
        Self { commands, filter, telemetry }
    }

    /// Publishes a metric.
    ///
    /// The metric goes through the filtering policy, then the rate gate, and is then handed off to the connection.
    /// This never waits on the network: it only waits for room in the queue, and for the event loop to decide what to
    /// do with the metric.
    ///
    /// # Errors
    ///
    /// If the publisher has shut down, an error is returned.
    pub async fn publish(&self, metric: Metric) -> Result<Publication, PublishError> {
        if !self.passes_filter(&metric) {
            return Ok(Publication::Dropped(DropReason::Filtered));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Publish { metric, reply: Some(reply_tx) }).await?;
        reply_rx.await.map_err(|_| PublishError::Closed)
    }

    /// Publishes a metric without waiting to find out what happened to it.
    ///
    /// If the queue in front of the event loop is full, the metric is dropped.
    ///
    /// # Errors
    ///
    /// If the publisher has shut down, an error is returned.
    pub fn try_publish(&self, metric: Metric) -> Result<(), PublishError> {
        if !self.passes_filter(&metric) {
            return Ok(());
        }

        match self.commands.try_send(Command::Publish { metric, reply: None }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                trace!("Dropping metric as the queue is full.");
                self.telemetry.track_publication_dropped(DropReason::QueueFull);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(PublishError::Closed),
        }
    }

    /// Returns the current status of the publisher.
    ///
    /// # Errors
    ///
    /// If the publisher has shut down, an error is returned.
    pub async fn status(&self) -> Result<PublisherStatus, PublishError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Status(reply_tx)).await?;
        reply_rx.await.map_err(|_| PublishError::Closed)
    }

    /// Shuts down the publisher, closing the connection to the collector.
    ///
    /// Every handle to the publisher is affected: afterwards, publishing fails with [`PublishError::Closed`]. Shutting
    /// down a publisher that has already shut down does nothing.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.send(Command::Shutdown(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
    }

    fn passes_filter(&self, metric: &Metric) -> bool {
        if self.filter.should_publish(metric.name()) {
            return true;
        }

        trace!(metric_name = metric.name(), "Dropping filtered metric.");
        self.telemetry.track_publication_dropped(DropReason::Filtered);
        false
    }

    async fn send(&self, command: Command) -> Result<(), PublishError> {
        self.commands.send(command).await.map_err(|_| PublishError::Closed)
    }
}

impl fmt::Debug for GaugePublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaugePublisher")
            .field("closed", &self.commands.is_closed())
            .finish_non_exhaustive()
    }
}

/// The single owner of all publisher state.
pub(crate) struct EventLoop {
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    gate: RateGate,
    manager: ConnectionManager<TcpDriver>,
    driver: TcpDriver,
    telemetry: Telemetry,
}

impl EventLoop {
    pub fn new(
        commands: mpsc::Receiver<Command>,
        events: mpsc::UnboundedReceiver<Event>,
        gate: RateGate,
        manager: ConnectionManager<TcpDriver>,
        driver: TcpDriver,
        telemetry: Telemetry,
    ) -> Self {
        Self { commands, events, gate, manager, driver, telemetry }
    }

    /// Runs the event loop until the publisher is shut down.
    pub async fn run(mut self) {
        debug!("Publisher started.");

        loop {
            tokio::select! {
                // I/O completions are handled before new commands, so a publication always sees the
                // freshest state.
                biased;

                Some(event) = self.events.recv() => self.handle_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Publish { metric, reply }) => {
                        let publication = self.publish(metric);
                        if let Some(reply) = reply {
                            let _ = reply.send(publication);
                        }
                    }
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(self.status());
                    }
                    Some(Command::Shutdown(reply)) => {
                        self.manager.shutdown(&mut self.driver);
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.manager.shutdown(&mut self.driver);
                        break;
                    }
                },
            }
        }

        debug!("Publisher stopped.");
    }

    fn publish(&mut self, metric: Metric) -> Publication {
        let now = Instant::now();

        if !self.gate.accept(now) {
            trace!(metric_name = metric.name(), "Dropping rate limited metric.");
            self.telemetry.track_publication_dropped(DropReason::RateLimited);
            return Publication::Dropped(DropReason::RateLimited);
        }

        match self.manager.publish(&mut self.driver, now, metric) {
            Ok(()) => {
                self.telemetry.track_publication_accepted();
                Publication::Accepted
            }
            Err(reason) => {
                self.telemetry.track_publication_dropped(reason);
                Publication::Dropped(reason)
            }
        }
    }

    fn status(&self) -> PublisherStatus {
        PublisherStatus {
            connection: self.manager.status(Instant::now()),
            write_in_flight: self.manager.write_in_flight(),
        }
    }

    fn handle_event(&mut self, event: Event) {
        let now = Instant::now();
        match event {
            Event::Connected { connection, stream } => {
                self.driver.attach(connection, stream);
                self.manager.connected(&mut self.driver, connection);
            }
            Event::ConnectFailed { connection, error } => {
                self.driver.close(connection);
                self.manager.connect_failed(now, connection, &error);
            }
            Event::Acknowledged(ack) => self.manager.acknowledged(&mut self.driver, now, ack),
            Event::Expired { connection, sequence } => {
                self.manager.expired(&mut self.driver, now, connection, sequence)
            }
            Event::Disconnected { connection, error } => {
                self.manager.disconnected(&mut self.driver, now, connection, error.as_ref())
            }
        }
    }
}
