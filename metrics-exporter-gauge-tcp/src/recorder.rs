use std::sync::{
    atomic::{
        AtomicU64,
        Ordering::{AcqRel, Relaxed},
    },
    Arc,
};

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
    SharedString, Unit,
};
use metrics_util::registry::{Registry, Storage};
use tracing::trace;

use crate::{metric::Metric, publisher::GaugePublisher};

/// A recorder that publishes gauges to a collector.
///
/// Every update to a gauge registered through this recorder publishes the gauge's new value, subject to the same
/// filtering and rate limiting as any other publication. Counters and histograms cannot be published, and are
/// discarded.
///
/// Labels on the metric key are not forwarded: only the common tags of the publisher are sent.
pub struct GaugeRecorder {
    registry: Registry<Key, PublishingStorage>,
    publisher: GaugePublisher,
}

impl GaugeRecorder {
    pub(crate) fn new(publisher: GaugePublisher) -> Self {
        let storage = PublishingStorage { publisher: publisher.clone() };
        GaugeRecorder { registry: Registry::new(storage), publisher }
    }

    /// Returns the publisher backing this recorder.
    pub fn publisher(&self) -> &GaugePublisher {
        &self.publisher
    }
}

impl Recorder for GaugeRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, _: &Key, _: &Metadata<'_>) -> Counter {
        Counter::noop()
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |existing| Gauge::from_arc(Arc::clone(existing)))
    }

    fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

struct PublishingStorage {
    publisher: GaugePublisher,
}

impl Storage<Key> for PublishingStorage {
    type Counter = Arc<Discard>;
    type Gauge = Arc<PublishingGauge>;
    type Histogram = Arc<Discard>;

    fn counter(&self, _: &Key) -> Self::Counter {
        Arc::new(Discard)
    }

    fn gauge(&self, key: &Key) -> Self::Gauge {
        Arc::new(PublishingGauge {
            name: SharedString::from(key.name().to_string()),
            bits: AtomicU64::new(0.0f64.to_bits()),
            publisher: self.publisher.clone(),
        })
    }

    fn histogram(&self, _: &Key) -> Self::Histogram {
        Arc::new(Discard)
    }
}

struct Discard;

impl CounterFn for Discard {
    fn increment(&self, _: u64) {}
    fn absolute(&self, _: u64) {}
}

impl HistogramFn for Discard {
    fn record(&self, _: f64) {}
}

/// A gauge that publishes its value whenever it changes.
struct PublishingGauge {
    name: SharedString,
    bits: AtomicU64,
    publisher: GaugePublisher,
}

impl PublishingGauge {
    fn update<F>(&self, f: F)
    where
        F: Fn(f64) -> f64,
    {
        // The closure never returns `None`, so the update always succeeds.
        let update = |current| Some(f(f64::from_bits(current)).to_bits());
        let previous = match self.bits.fetch_update(AcqRel, Relaxed, update) {
            Ok(previous) | Err(previous) => previous,
        };
        let value = f(f64::from_bits(previous));

        if self.publisher.try_publish(Metric::gauge(self.name.clone(), value)).is_err() {
            trace!(metric_name = &*self.name, "Publisher has shut down, dropping gauge update.");
        }
    }
}

impl GaugeFn for PublishingGauge {
    fn increment(&self, value: f64) {
        self.update(|current| current + value);
    }

    fn decrement(&self, value: f64) {
        self.update(|current| current - value);
    }

    fn set(&self, value: f64) {
        self.update(|_| value);
    }
}
