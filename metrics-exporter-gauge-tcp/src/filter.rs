use aho_corasick::{AhoCorasick, AhoCorasickBuilder, AhoCorasickKind};

use crate::builder::BuildError;

/// Decides which metrics get published.
///
/// The filter is consulted with the metric name before rate limiting, so a filtered metric never takes the place of a
/// metric that would have been published.
pub trait MetricFilter: Send + Sync + 'static {
    /// Returns `true` if the metric with the given name should be published.
    fn should_publish(&self, name: &str) -> bool;
}

impl<F> MetricFilter for F
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    fn should_publish(&self, name: &str) -> bool {
        self(name)
    }
}

/// Publishes every metric.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl MetricFilter for AllowAll {
    fn should_publish(&self, _: &str) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Allow,
    Deny,
}

/// Filters metrics by matching patterns against their names.
///
/// Uses an [Aho-Corasick][ahocorasick] automaton to match a metric name against all patterns at once. Patterns are
/// matched as substrings of the name.
///
/// [ahocorasick]: https://en.wikipedia.org/wiki/Aho–Corasick_algorithm
#[derive(Clone, Debug)]
pub struct NameFilter {
    automaton: AhoCorasick,
    mode: Mode,
}

impl NameFilter {
    /// Publishes only metrics whose name contains one of the given patterns.
    pub fn allow<P, I>(patterns: P) -> NameFilterBuilder
    where
        P: IntoIterator<Item = I>,
        I: AsRef<str>,
    {
        NameFilterBuilder::new(Mode::Allow, patterns)
    }

    /// Publishes every metric except those whose name contains one of the given patterns.
    pub fn deny<P, I>(patterns: P) -> NameFilterBuilder
    where
        P: IntoIterator<Item = I>,
        I: AsRef<str>,
    {
        NameFilterBuilder::new(Mode::Deny, patterns)
    }
}

impl MetricFilter for NameFilter {
    fn should_publish(&self, name: &str) -> bool {
        let matched = self.automaton.is_match(name);
        match self.mode {
            Mode::Allow => matched,
            Mode::Deny => !matched,
        }
    }
}

/// Builder for a [`NameFilter`].
#[derive(Debug)]
pub struct NameFilterBuilder {
    patterns: Vec<String>,
    mode: Mode,
    case_insensitive: bool,
}

impl NameFilterBuilder {
    fn new<P, I>(mode: Mode, patterns: P) -> Self
    where
        P: IntoIterator<Item = I>,
        I: AsRef<str>,
    {
        Self {
            patterns: patterns.into_iter().map(|s| s.as_ref().to_string()).collect(),
            mode,
            case_insensitive: false,
        }
    }

    /// Sets the case sensitivity used for pattern matching.
    ///
    /// Only ASCII letters are matched case-insensitively.
    ///
    /// Defaults to `false` i.e. matching is case sensitive.
    #[must_use]
    pub fn case_insensitive(mut self, case_insensitive: bool) -> Self {
        self.case_insensitive = case_insensitive;
        self
    }

    /// Builds the filter.
    ///
    /// # Errors
    ///
    /// If the patterns exceed the limits of the underlying automaton, an error is returned.
    pub fn build(self) -> Result<NameFilter, BuildError> {
        let automaton = AhoCorasickBuilder::new()
            .ascii_case_insensitive(self.case_insensitive)
            .kind(Some(AhoCorasickKind::DFA))
            .build(&self.patterns)
            .map_err(|e| BuildError::InvalidFilter { reason: e.to_string() })?;

        Ok(NameFilter { automaton, mode: self.mode })
    }
}

#[cfg(test)]
mod tests {
    use super::{AllowAll, MetricFilter, NameFilter};

    #[test]
    fn allow_all() {
        assert!(AllowAll.should_publish("anything"));
        assert!(AllowAll.should_publish(""));
    }

    #[test]
    fn closures_are_filters() {
        let filter = |name: &str| name.starts_with("app.");
        assert!(filter.should_publish("app.queue_depth"));
        assert!(!filter.should_publish("sys.load"));
    }

    #[test]
    fn name_filter_modes() {
        let allow = NameFilter::allow(["queue", "pool"]).build().unwrap();
        let deny = NameFilter::deny(["queue", "pool"]).build().unwrap();

        // Cases are defined as: metric name, published when allowing, published when denying.
        let cases = [
            ("queue_depth", true, false),
            ("db.pool.size", true, false),
            ("QUEUE_depth", false, true),
            ("m1", false, true),
            ("", false, true),
        ];

        for (name, allowed, denied) in cases {
            assert_eq!(allow.should_publish(name), allowed, "allow {}", name);
            assert_eq!(deny.should_publish(name), denied, "deny {}", name);
        }
    }

    #[test]
    fn name_filter_case_insensitive() {
        let filter = NameFilter::deny(["tokio"]).case_insensitive(true).build().unwrap();
        assert!(!filter.should_publish("tokio.loops"));
        assert!(!filter.should_publish("Tokio.Loops"));
        assert!(filter.should_publish("hyper.requests"));
    }

    #[test]
    fn empty_allow_list_publishes_nothing() {
        let filter = NameFilter::allow(Vec::<String>::new()).build().unwrap();
        assert!(!filter.should_publish("m1"));
    }
}
