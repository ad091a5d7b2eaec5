//! A [`metrics`]-compatible publisher that ships gauges to a remote telemetry collector over a persistent TCP
//! connection.
//!
//! Each publication is a single line in the DogStatsD-style text format:
//!
//! ```text
//! <metric-name>:<numeric-value>|g[|#<tag-key>:<tag-value>[,<tag-key>:<tag-value>]...]
//! ```
//!
//! # Usage
//!
//! ```no_run
//! # use std::time::Duration;
//! # use metrics_exporter_gauge_tcp::{Metric, PublisherBuilder};
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // Configure the publisher: where to send gauges, how often, and which tags to attach to every line.
//! let publisher = PublisherBuilder::default()
//!     .with_remote_address("127.0.0.1:10516")?
//!     .with_debounce_interval(Duration::from_secs(1))
//!     .with_common_tag("service", "checkout")
//!     .build()?;
//!
//! // Publishing never blocks on the network: the returned outcome only says whether the gauge was handed off.
//! let outcome = publisher.publish(Metric::gauge("queue_depth", 6.0)).await?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```
//!
//! Most applications will instead install the publisher as the global recorder, and update gauges through the
//! `metrics` macros:
//!
//! ```no_run
//! # use metrics_exporter_gauge_tcp::PublisherBuilder;
//! PublisherBuilder::default().install().expect("failed to install gauge publisher");
//!
//! metrics::gauge!("queue_depth").set(6.0);
//! ```
//!
//! # Behavior
//!
//! The publisher is deliberately best-effort and at-most-once:
//!
//! - **Debouncing.** Only one publication is accepted per debounce interval. The first gauge to arrive after the
//!   interval has elapsed is the one sent; anything else inside the window is dropped, not queued.
//! - **Single flight.** Exactly one write is outstanding on the connection at a time. Every write is tracked until it
//!   is acknowledged or its acknowledgment timeout expires.
//! - **Recovery.** A failed connect, a failed or timed-out write, or the collector closing the connection tears the
//!   connection down. No new connection is attempted until the reconnect cooldown has elapsed, and gauges published
//!   during the cooldown are dropped.
//! - **Tags.** Common tags are appended to every line, except any tag keyed `host`: the collector infers the host from
//!   the connection itself.
//!
//! All state transitions happen on a single event loop task per publisher, so callers on any thread can publish
//! concurrently without contending on locks. Publications reach the event loop through a bounded queue: when it is
//! full, [`GaugePublisher::try_publish`] (and so the recorder) drops the publication rather than waiting.
//!
//! # Telemetry
//!
//! The publisher counts its own accepted and dropped publications, acknowledged and failed writes, and connection
//! attempts, under the `gauge_publisher.client` namespace. These counters are registered against whichever recorder
//! is current when the publisher is built, and can be disabled with [`PublisherBuilder::with_telemetry`].

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod ack;

mod builder;
pub use self::builder::{BuildError, PublisherBuilder};

mod connection;
pub use self::connection::ConnectionStatus;

mod filter;
pub use self::filter::{AllowAll, MetricFilter, NameFilter, NameFilterBuilder};

mod gate;

mod metric;
pub use self::metric::{Metric, MetricKind};

mod publisher;
pub use self::publisher::{DropReason, GaugePublisher, Publication, PublishError, PublisherStatus};

mod recorder;
pub use self::recorder::GaugeRecorder;

mod telemetry;
mod transport;

pub mod wire;
