//! Wire encoding for published metrics.
//!
//! A published metric is a single line of text:
//!
//! ```text
//! <metric-name>:<numeric-value>|g[|#<tag-key>:<tag-value>[,<tag-key>:<tag-value>]...]
//! ```
//!
//! Common tags are appended in the order they were configured. Any tag keyed `host` is dropped before encoding, as the
//! collector infers the host from the connection itself. No escaping is performed.

use bytes::{BufMut as _, Bytes, BytesMut};
use metrics::Label;

use crate::metric::Metric;

const HOST_TAG_KEY: &str = "host";

// Largest magnitude at which every integer is still exactly representable as an `f64`.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

struct MetricValueFormatter {
    int_writer: itoa::Buffer,
    float_writer: ryu::Buffer,
}

impl MetricValueFormatter {
    fn new() -> Self {
        Self { int_writer: itoa::Buffer::new(), float_writer: ryu::Buffer::new() }
    }

    /// Formats the value, writing integral values without a fractional part.
    fn format(&mut self, value: f64) -> &str {
        if value.fract() == 0.0 && value.abs() <= MAX_EXACT_INTEGER {
            self.int_writer.format(value as i64)
        } else {
            self.float_writer.format(value)
        }
    }
}

/// Removes any `host` tag from the given tags, preserving the order of the rest.
pub fn filter_tags<'a, I>(tags: I) -> impl Iterator<Item = &'a Label>
where
    I: IntoIterator<Item = &'a Label>,
{
    tags.into_iter().filter(|tag| tag.key() != HOST_TAG_KEY)
}

/// Encodes a metric into its wire line, without a trailing newline.
pub fn encode(metric: &Metric, tags: &[Label]) -> String {
    let mut buf = String::new();
    write_line(&mut buf, metric, filter_tags(tags));
    buf
}

fn write_line<'a, I>(buf: &mut String, metric: &Metric, tags: I)
where
    I: Iterator<Item = &'a Label>,
{
    let mut formatter = MetricValueFormatter::new();

    buf.push_str(metric.name());
    buf.push(':');
    buf.push_str(formatter.format(metric.value()));
    buf.push_str(metric.kind().as_str());

    let mut wrote_tag = false;
    for tag in tags {
        // If we haven't written a tag yet, write out the tags prefix first.
        //
        // Otherwise, write a tag separator.
        if wrote_tag {
            buf.push(',');
        } else {
            buf.push_str("|#");
            wrote_tag = true;
        }

        write_tag(buf, tag);
    }
}

fn write_tag(buf: &mut String, label: &Label) {
    buf.push_str(label.key());
    buf.push(':');
    buf.push_str(label.value());
}

/// Encodes metrics into newline-framed lines ready to be written to the collector.
///
/// The common tags are filtered once, at construction, rather than on every line.
#[derive(Clone)]
pub(crate) struct LineEncoder {
    tags: Vec<Label>,
}

impl LineEncoder {
    /// Creates a new `LineEncoder` that appends the given common tags to every line.
    pub fn new(common_tags: &[Label]) -> Self {
        Self { tags: filter_tags(common_tags).cloned().collect() }
    }

    /// Encodes the metric, including the trailing newline.
    pub fn encode(&self, metric: &Metric) -> Bytes {
        let mut buf = String::with_capacity(64);
        write_line(&mut buf, metric, self.tags.iter());

        let mut framed = BytesMut::with_capacity(buf.len() + 1);
        framed.put_slice(buf.as_bytes());
        framed.put_u8(b'\n');
        framed.freeze()
    }
}
