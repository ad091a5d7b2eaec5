use metrics::SharedString;

/// Kind of a metric.
///
/// Gauges are the only kind the publisher sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    /// A point-in-time value, sent with the `|g` suffix.
    Gauge,
}

impl MetricKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            MetricKind::Gauge => "|g",
        }
    }
}

/// A single metric value to publish.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    name: SharedString,
    value: f64,
    kind: MetricKind,
}

impl Metric {
    /// Creates a gauge with the given name and value.
    pub fn gauge<N>(name: N, value: f64) -> Self
    where
        N: Into<SharedString>,
    {
        Metric { name: name.into(), value, kind: MetricKind::Gauge }
    }

    /// Returns the name of the metric.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value of the metric.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Returns the kind of the metric.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }
}
