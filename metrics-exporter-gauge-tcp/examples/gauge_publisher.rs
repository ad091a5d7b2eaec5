use std::time::Duration;

use metrics::gauge;
use metrics_exporter_gauge_tcp::{Metric, NameFilter, PublisherBuilder};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let filter = NameFilter::deny(["internal."]).build().expect("failed to build filter");

    let recorder = PublisherBuilder::default()
        .with_remote_address("localhost:10516")
        .expect("failed to parse remote address")
        .with_debounce_interval(Duration::from_millis(500))
        .with_reconnect_cooldown(Duration::from_secs(2))
        .with_common_tag("service", "example")
        .with_common_tag("host", "ignored")
        .with_filter(filter)
        .build_recorder()
        .expect("failed to build gauge recorder");

    let publisher = recorder.publisher().clone();
    metrics::set_global_recorder(recorder).expect("failed to install gauge recorder");

    let queue_depth = gauge!("queue_depth");
    let internal = gauge!("internal.scratch");

    // Loop over and over, pretending to do some work.
    for iteration in 0u32.. {
        if iteration % 3 == 0 {
            queue_depth.increment(1.0);
        } else {
            queue_depth.decrement(0.5);
        }
        internal.set(f64::from(iteration));

        if iteration % 10 == 0 {
            let outcome = publisher.publish(Metric::gauge("heartbeat", f64::from(iteration))).await;
            let status = publisher.status().await;
            println!("heartbeat: {:?}, status: {:?}", outcome, status);
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
