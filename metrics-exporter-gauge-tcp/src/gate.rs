use std::time::{Duration, Instant};

/// Debounces publications.
///
/// The first publication after the debounce interval has elapsed is accepted, and every other publication inside the
/// interval is rejected. Rejected publications do not extend the window.
pub(crate) struct RateGate {
    debounce_interval: Duration,
    last_accepted: Option<Instant>,
}

impl RateGate {
    /// Creates a new `RateGate` with the given debounce interval.
    ///
    /// The gate starts open: the very first publication is always accepted.
    pub fn new(debounce_interval: Duration) -> Self {
        Self { debounce_interval, last_accepted: None }
    }

    /// Returns `true` if a publication at `now` is accepted, recording it as the last accepted publication.
    pub fn accept(&mut self, now: Instant) -> bool {
        let open = match self.last_accepted {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.debounce_interval,
        };

        if open {
            self.last_accepted = Some(now);
        }

        open
    }
}
