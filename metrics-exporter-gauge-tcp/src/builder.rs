use std::{net::SocketAddr, sync::Arc, thread, time::Duration};

use metrics::Label;
use thiserror::Error;
use tokio::{runtime, sync::mpsc};

use crate::{
    connection::ConnectionManager,
    filter::{AllowAll, MetricFilter},
    gate::RateGate,
    publisher::{EventLoop, GaugePublisher},
    recorder::GaugeRecorder,
    telemetry::Telemetry,
    transport::{RemoteAddr, TcpDriver},
    wire::LineEncoder,
};

const DEFAULT_DEBOUNCE_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_RECONNECT_COOLDOWN: Duration = Duration::from_secs(5);
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Errors that could occur while building or installing a publisher.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse or resolve the remote address.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// The configuration is not usable.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Details about the invalid setting.
        reason: String,
    },

    /// Failed to build the filtering policy.
    #[error("invalid filter: {reason}")]
    InvalidFilter {
        /// Details about the failure.
        reason: String,
    },

    /// Failed to create the runtime, or the thread it runs on.
    #[error("failed to create runtime for publisher: {0}")]
    FailedToCreateRuntime(String),

    /// Failed to install the recorder due to an existing global recorder already being installed.
    #[error("failed to install publisher as global recorder")]
    FailedToInstall,
}

/// Builder for a gauge publisher.
pub struct PublisherBuilder {
    remote_addr: RemoteAddr,
    debounce_interval: Duration,
    reconnect_cooldown: Duration,
    ack_timeout: Duration,
    queue_capacity: usize,
    common_tags: Vec<Label>,
    filter: Arc<dyn MetricFilter>,
    telemetry: bool,
}

impl PublisherBuilder {
    /// Creates a new [`PublisherBuilder`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address of the collector.
    ///
    /// The address must be in the format of `<host>:<port>`. Host names are resolved immediately, and the resolved
    /// addresses are used for the life of the publisher.
    ///
    /// Defaults to `127.0.0.1:8125`.
    ///
    /// # Errors
    ///
    /// If the given address is not able to be parsed or resolved, an error will be returned indicating the reason.
    pub fn with_remote_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        self.remote_addr = RemoteAddr::try_from(addr.as_ref())
            .map_err(|reason| BuildError::InvalidRemoteAddress { reason })?;
        Ok(self)
    }

    /// Set the debounce interval.
    ///
    /// Once a publication is accepted, every other publication within this interval is dropped. Setting this lower
    /// than the round trip of a single write leads to publications being dropped because a write is still in flight.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_debounce_interval(mut self, interval: Duration) -> Self {
        self.debounce_interval = interval;
        self
    }

    /// Set the reconnect cooldown.
    ///
    /// After the connection to the collector fails, no new connection is attempted until this much time has passed.
    /// Publications made during the cooldown are dropped.
    ///
    /// Defaults to 5 seconds.
    #[must_use]
    pub fn with_reconnect_cooldown(mut self, cooldown: Duration) -> Self {
        self.reconnect_cooldown = cooldown;
        self
    }

    /// Set the acknowledgment timeout.
    ///
    /// A write that is not acknowledged within this duration is considered failed, and the connection is reset. The
    /// same duration bounds a single connection attempt.
    ///
    /// Defaults to 1 second.
    ///
    /// # Errors
    ///
    /// If the timeout is zero, an error will be returned.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Result<Self, BuildError> {
        if timeout.is_zero() {
            return Err(BuildError::InvalidConfiguration {
                reason: "acknowledgment timeout must be greater than zero".to_string(),
            });
        }

        self.ack_timeout = timeout;
        Ok(self)
    }

    /// Set the capacity of the queue in front of the event loop.
    ///
    /// Publications wait in this queue until the event loop gets to them. When it is full,
    /// [`GaugePublisher::try_publish`] drops the publication, and [`GaugePublisher::publish`] waits for room.
    ///
    /// Defaults to 128.
    ///
    /// # Errors
    ///
    /// If the capacity is zero, an error will be returned.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Result<Self, BuildError> {
        if capacity == 0 {
            return Err(BuildError::InvalidConfiguration {
                reason: "queue capacity must be greater than zero".to_string(),
            });
        }

        self.queue_capacity = capacity;
        Ok(self)
    }

    /// Adds a tag sent with every publication.
    ///
    /// Tags keyed `host` are accepted, but never sent: the collector determines the host from the connection.
    #[must_use]
    pub fn with_common_tag<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<metrics::SharedString>,
        V: Into<metrics::SharedString>,
    {
        self.common_tags.push(Label::new(key, value));
        self
    }

    /// Adds tags sent with every publication.
    ///
    /// Tags are sent in the order they were added.
    #[must_use]
    pub fn with_common_tags<I>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = Label>,
    {
        self.common_tags.extend(tags);
        self
    }

    /// Set the filtering policy.
    ///
    /// Defaults to publishing every metric.
    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: MetricFilter,
    {
        self.filter = Arc::new(filter);
        self
    }

    /// Sets whether or not to enable telemetry for the publisher.
    ///
    /// When enabled, counters describing what the publisher does are registered with the recorder that is current when
    /// the publisher is built.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: bool) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Builds the publisher.
    ///
    /// When called from within a Tokio runtime, the event loop is spawned onto that runtime. Otherwise, a dedicated
    /// thread is spawned to run it.
    ///
    /// # Errors
    ///
    /// If the dedicated thread, or its runtime, cannot be created, an error will be returned.
    pub fn build(self) -> Result<GaugePublisher, BuildError> {
        let telemetry = if self.telemetry { Telemetry::new() } else { Telemetry::noop() };

        let (commands_tx, commands_rx) = mpsc::channel(self.queue_capacity);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = TcpDriver::new(self.remote_addr, self.ack_timeout, events_tx);
        let encoder = LineEncoder::new(&self.common_tags);
        let manager = ConnectionManager::new(encoder, self.reconnect_cooldown, telemetry.clone());
        let event_loop = EventLoop::new(
            commands_rx,
            events_rx,
            RateGate::new(self.debounce_interval),
            manager,
            driver,
            telemetry.clone(),
        );

        if let Ok(handle) = runtime::Handle::try_current() {
            handle.spawn(event_loop.run());
        } else {
            let runtime = runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

            thread::Builder::new()
                .name("metrics-exporter-gauge-tcp".to_string())
                .spawn(move || runtime.block_on(event_loop.run()))
                .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;
        }

        Ok(GaugePublisher::new(commands_tx, self.filter, telemetry))
    }

    /// Builds the publisher and wraps it in a recorder.
    ///
    /// The recorder must be manually installed by the caller.
    ///
    /// # Errors
    ///
    /// If the publisher cannot be built, an error will be returned.
    pub fn build_recorder(self) -> Result<GaugeRecorder, BuildError> {
        self.build().map(GaugeRecorder::new)
    }

    /// Builds the recorder and installs it as the global recorder.
    ///
    /// # Errors
    ///
    /// If the publisher cannot be built, or if a global recorder is already installed, an error will be returned.
    pub fn install(self) -> Result<(), BuildError> {
        let recorder = self.build_recorder()?;

        metrics::set_global_recorder(recorder).map_err(|_| BuildError::FailedToInstall)
    }
}

impl Default for PublisherBuilder {
    fn default() -> Self {
        PublisherBuilder {
            remote_addr: RemoteAddr::from(SocketAddr::from(([127, 0, 0, 1], 8125))),
            debounce_interval: DEFAULT_DEBOUNCE_INTERVAL,
            reconnect_cooldown: DEFAULT_RECONNECT_COOLDOWN,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            common_tags: Vec::new(),
            filter: Arc::new(AllowAll),
            telemetry: true,
        }
    }
}
