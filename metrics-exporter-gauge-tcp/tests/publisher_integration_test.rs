use std::{net::SocketAddr, time::Duration};

use metrics::{Key, Label, Recorder as _};
use metrics_exporter_gauge_tcp::{
    ConnectionStatus, DropReason, GaugePublisher, Metric, NameFilter, Publication, PublishError,
    PublisherBuilder, PublisherStatus,
};
use metrics_util::{
    debugging::{DebugValue, DebuggingRecorder},
    CompositeKey, MetricKind,
};
use tokio::{
    io::{AsyncBufReadExt as _, BufReader},
    net::{TcpListener, TcpSocket, TcpStream},
    sync::mpsc,
    time::{sleep, timeout, Instant},
};

static METADATA: metrics::Metadata =
    metrics::Metadata::new(module_path!(), metrics::Level::INFO, Some(module_path!()));

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// A loopback collector that reports every line it receives.
struct Collector {
    addr: SocketAddr,
    lines: mpsc::UnboundedReceiver<String>,
}

impl Collector {
    async fn start() -> Self {
        Self::serve(bind("127.0.0.1:0").await, false)
    }

    /// Starts a collector that closes each connection after reading a single line from it.
    async fn start_closing() -> Self {
        Self::serve(bind("127.0.0.1:0").await, true)
    }

    fn serve(listener: TcpListener, close_after_line: bool) -> Self {
        let addr = listener.local_addr().expect("Unable to obtain local address from TcpListener");
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let lines_tx = lines_tx.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stream).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let _ = lines_tx.send(line);
                        if close_after_line {
                            break;
                        }
                    }
                });
            }

            // Keep the channel open so that a silent collector is distinguishable from a dead one.
            std::future::pending::<()>().await;
        });

        Collector { addr, lines: lines_rx }
    }

    async fn next_line(&mut self) -> String {
        timeout(WAIT_TIMEOUT, self.lines.recv())
            .await
            .expect("timed out waiting for a line")
            .expect("collector stopped")
    }

    async fn assert_silent(&mut self) {
        if let Ok(line) = timeout(QUIET_PERIOD, self.lines.recv()).await {
            panic!("expected no further lines, got {:?}", line);
        }
    }
}

async fn bind(addr: &str) -> TcpListener {
    TcpListener::bind(addr).await.unwrap_or_else(|e| panic!("Unable to bind to {addr}: {:?}", e))
}

async fn get_available_port() -> SocketAddr {
    bind("127.0.0.1:0").await.local_addr().expect("Unable to obtain local address from TcpListener")
}

/// Binds a listener that never accepts, and fills its accept queue so that any further connection attempt hangs.
async fn saturated_listener() -> (TcpListener, Vec<TcpStream>) {
    let socket = TcpSocket::new_v4().expect("Unable to create socket");
    socket.bind(([127, 0, 0, 1], 0).into()).expect("Unable to bind socket");
    let listener = socket.listen(1).expect("Unable to listen on socket");
    let addr = listener.local_addr().expect("Unable to obtain local address from TcpListener");

    let mut backlog = Vec::new();
    while let Ok(stream) = timeout(Duration::from_millis(100), TcpStream::connect(addr)).await {
        backlog.push(stream.expect("connecting to a listener with room should succeed"));
        assert!(backlog.len() < 64, "accept queue never filled up");
    }

    (listener, backlog)
}

fn builder(addr: SocketAddr) -> PublisherBuilder {
    PublisherBuilder::default()
        .with_remote_address(addr.to_string())
        .unwrap_or_else(|e| panic!("failed to parse remote address: {:?}", e))
        .with_telemetry(false)
}

async fn wait_for<F>(publisher: &GaugePublisher, condition: F) -> PublisherStatus
where
    F: Fn(&PublisherStatus) -> bool,
{
    timeout(WAIT_TIMEOUT, async {
        loop {
            let status = publisher.status().await.expect("publisher should be running");
            if condition(&status) {
                return status;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for publisher status")
}

async fn wait_until_idle_and_connected(publisher: &GaugePublisher) {
    wait_for(publisher, |status| {
        status.connection() == ConnectionStatus::Active && !status.write_in_flight()
    })
    .await;
}

#[tokio::test]
async fn second_publication_within_debounce_interval_is_dropped() {
    let mut collector = Collector::start().await;
    let publisher =
        builder(collector.addr).with_debounce_interval(Duration::from_secs(60)).build().unwrap();

    assert_eq!(publisher.publish(Metric::gauge("m1", 6.0)).await, Ok(Publication::Accepted));
    assert_eq!(
        publisher.publish(Metric::gauge("m1", 7.0)).await,
        Ok(Publication::Dropped(DropReason::RateLimited))
    );

    assert_eq!(collector.next_line().await, "m1:6|g");
    collector.assert_silent().await;
}

#[tokio::test]
async fn common_tags_are_appended() {
    let mut collector = Collector::start().await;
    let publisher = builder(collector.addr).with_common_tag("tag", "test").build().unwrap();

    publisher.publish(Metric::gauge("m1", 6.0)).await.unwrap();
    assert_eq!(collector.next_line().await, "m1:6|g|#tag:test");
}

#[tokio::test]
async fn host_tag_is_never_sent() {
    let mut collector = Collector::start().await;
    let publisher =
        builder(collector.addr).with_common_tags(vec![Label::new("host", "test")]).build().unwrap();

    publisher.publish(Metric::gauge("m1", 6.0)).await.unwrap();
    assert_eq!(collector.next_line().await, "m1:6|g");
}

#[tokio::test]
async fn spaced_publications_are_all_delivered() {
    let mut collector = Collector::start().await;
    let debounce_interval = Duration::from_millis(50);
    let publisher =
        builder(collector.addr).with_debounce_interval(debounce_interval).build().unwrap();

    for value in 1..=4 {
        let publication = publisher.publish(Metric::gauge("m1", f64::from(value))).await.unwrap();
        assert_eq!(publication, Publication::Accepted);
        assert_eq!(collector.next_line().await, format!("m1:{}|g", value));

        wait_until_idle_and_connected(&publisher).await;
        sleep(debounce_interval + Duration::from_millis(10)).await;
    }

    collector.assert_silent().await;
}

#[tokio::test]
async fn unavailable_collector_recovers_after_cooldown() {
    let addr = get_available_port().await;
    let reconnect_cooldown = Duration::from_millis(300);
    let publisher = builder(addr)
        .with_debounce_interval(Duration::from_millis(10))
        .with_reconnect_cooldown(reconnect_cooldown)
        .build()
        .unwrap();

    // Nothing is listening yet, so the connection attempt fails.
    assert_eq!(publisher.publish(Metric::gauge("m1", 6.0)).await, Ok(Publication::Accepted));
    wait_for(&publisher, |status| status.connection() == ConnectionStatus::CoolingDown).await;

    let mut collector = Collector::serve(bind(&addr.to_string()).await, false);

    sleep(Duration::from_millis(20)).await;
    assert_eq!(
        publisher.publish(Metric::gauge("m1", 7.0)).await,
        Ok(Publication::Dropped(DropReason::CoolingDown))
    );

    wait_for(&publisher, |status| status.connection() == ConnectionStatus::Idle).await;
    assert_eq!(publisher.publish(Metric::gauge("m1", 8.0)).await, Ok(Publication::Accepted));

    assert_eq!(collector.next_line().await, "m1:8|g");
    collector.assert_silent().await;
}

#[tokio::test]
async fn hanging_connection_attempt_enters_cooldown() {
    let (listener, _backlog) = saturated_listener().await;
    let addr = listener.local_addr().expect("Unable to obtain local address from TcpListener");
    let ack_timeout = Duration::from_millis(100);
    let publisher = builder(addr)
        .with_debounce_interval(Duration::from_millis(10))
        .with_reconnect_cooldown(Duration::from_secs(60))
        .with_ack_timeout(ack_timeout)
        .unwrap()
        .build()
        .unwrap();

    let started = Instant::now();
    assert_eq!(publisher.publish(Metric::gauge("m1", 6.0)).await, Ok(Publication::Accepted));
    assert_eq!(publisher.status().await.unwrap().connection(), ConnectionStatus::Connecting);

    // The attempt only gives up once the acknowledgment timeout has passed.
    wait_for(&publisher, |status| status.connection() == ConnectionStatus::CoolingDown).await;
    assert!(started.elapsed() >= ack_timeout);

    sleep(Duration::from_millis(20)).await;
    assert_eq!(
        publisher.publish(Metric::gauge("m1", 7.0)).await,
        Ok(Publication::Dropped(DropReason::CoolingDown))
    );
}

#[tokio::test]
async fn collector_closing_connection_triggers_reconnect() {
    let mut collector = Collector::start_closing().await;
    let publisher = builder(collector.addr)
        .with_debounce_interval(Duration::from_millis(10))
        .with_reconnect_cooldown(Duration::from_millis(100))
        .build()
        .unwrap();

    publisher.publish(Metric::gauge("m1", 6.0)).await.unwrap();
    assert_eq!(collector.next_line().await, "m1:6|g");

    // The collector hung up after the first line.
    wait_for(&publisher, |status| status.connection() == ConnectionStatus::CoolingDown).await;
    wait_for(&publisher, |status| status.connection() == ConnectionStatus::Idle).await;

    assert_eq!(publisher.publish(Metric::gauge("m1", 7.0)).await, Ok(Publication::Accepted));
    assert_eq!(collector.next_line().await, "m1:7|g");
}

#[tokio::test]
async fn filtered_metrics_do_not_consume_the_debounce_window() {
    let mut collector = Collector::start().await;
    let filter = NameFilter::deny(["internal"]).build().unwrap();
    let publisher = builder(collector.addr)
        .with_debounce_interval(Duration::from_secs(60))
        .with_filter(filter)
        .build()
        .unwrap();

    assert_eq!(
        publisher.publish(Metric::gauge("internal.depth", 1.0)).await,
        Ok(Publication::Dropped(DropReason::Filtered))
    );
    assert_eq!(publisher.publish(Metric::gauge("m1", 6.0)).await, Ok(Publication::Accepted));

    assert_eq!(collector.next_line().await, "m1:6|g");
    collector.assert_silent().await;
}

#[tokio::test]
async fn recorder_publishes_gauge_updates() {
    let mut collector = Collector::start().await;
    let recorder = builder(collector.addr)
        .with_debounce_interval(Duration::ZERO)
        .with_common_tag("service", "checkout")
        .build_recorder()
        .unwrap();

    let key = Key::from_parts("queue_depth", vec![Label::new("shard", "1")]);
    let gauge = recorder.register_gauge(&key, &METADATA);
    gauge.set(42.0);

    assert_eq!(collector.next_line().await, "queue_depth:42|g|#service:checkout");

    wait_until_idle_and_connected(recorder.publisher()).await;
    gauge.increment(1.5);
    assert_eq!(collector.next_line().await, "queue_depth:43.5|g|#service:checkout");
}

#[tokio::test]
async fn telemetry_counts_publications_and_writes() {
    let mut collector = Collector::start().await;

    let debugging = DebuggingRecorder::new();
    let snapshotter = debugging.snapshotter();
    let publisher = metrics::with_local_recorder(&debugging, || {
        builder(collector.addr)
            .with_telemetry(true)
            .with_debounce_interval(Duration::from_secs(60))
            .build()
    })
    .unwrap();

    publisher.publish(Metric::gauge("m1", 6.0)).await.unwrap();
    publisher.publish(Metric::gauge("m1", 7.0)).await.unwrap();
    assert_eq!(collector.next_line().await, "m1:6|g");
    wait_until_idle_and_connected(&publisher).await;

    let base_labels = || {
        vec![
            Label::new("client", "rust"),
            Label::new("client_version", env!("CARGO_PKG_VERSION")),
            Label::new("client_transport", "tcp"),
        ]
    };
    let counter = |name: &'static str, extra: Option<(&'static str, &'static str)>| {
        let mut labels = base_labels();
        labels.extend(extra.map(|(k, v)| Label::new(k, v)));
        CompositeKey::new(MetricKind::Counter, Key::from_parts(name, labels))
    };

    let snapshot = snapshotter.snapshot().into_hashmap();
    let value = |key: CompositeKey| snapshot.get(&key).map(|(_, _, value)| value);

    let one = Some(&DebugValue::Counter(1));
    let rate_limited = Some(("reason", "rate_limited"));
    assert_eq!(value(counter("gauge_publisher.client.publications", None)), one);
    assert_eq!(value(counter("gauge_publisher.client.publications_dropped", rate_limited)), one);
    assert_eq!(value(counter("gauge_publisher.client.connections_opened", None)), one);
    assert_eq!(value(counter("gauge_publisher.client.writes_acknowledged", None)), one);
    assert_eq!(
        value(counter("gauge_publisher.client.writes_failed", Some(("cause", "timeout")))),
        Some(&DebugValue::Counter(0))
    );
}

#[tokio::test]
async fn shutdown_closes_every_handle() {
    let mut collector = Collector::start().await;
    let publisher = builder(collector.addr).build().unwrap();
    let other = publisher.clone();

    publisher.publish(Metric::gauge("m1", 6.0)).await.unwrap();
    assert_eq!(collector.next_line().await, "m1:6|g");

    publisher.shutdown().await;
    assert_eq!(other.publish(Metric::gauge("m1", 7.0)).await, Err(PublishError::Closed));
    assert_eq!(other.try_publish(Metric::gauge("m1", 8.0)), Err(PublishError::Closed));
    assert_eq!(publisher.status().await, Err(PublishError::Closed));

    // Shutting down twice is fine.
    other.shutdown().await;
}
