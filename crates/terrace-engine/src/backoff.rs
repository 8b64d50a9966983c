//! Per-object failure counting for controller error policies

use std::time::{Duration, Instant};

use dashmap::DashMap;
use terrace_common::retry::backoff_delay;

/// Base delay after the first failure
pub const BASE_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on the delay
pub const MAX_DELAY: Duration = Duration::from_secs(300);

/// Entries without a failure for this long belong to objects that are gone
pub const STALE_AFTER: Duration = Duration::from_secs(1200);

#[derive(Debug)]
struct Failures {
    count: u32,
    last: Instant,
}

/// Consecutive failures per object key
///
/// The key is usually `namespace/name`. A successful cycle resets it; a key
/// whose object disappeared while backing off is dropped once it turns stale.
#[derive(Debug, Default)]
pub struct FailureTracker {
    failures: DashMap<String, Failures>,
}

impl FailureTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the delay before the next attempt
    pub fn record_failure(&self, key: &str) -> Duration {
        self.forget_stale(STALE_AFTER);
        let now = Instant::now();
        let mut entry = self.failures.entry(key.to_string()).or_insert(Failures {
            count: 0,
            last: now,
        });
        entry.count = entry.count.saturating_add(1);
        entry.last = now;
        backoff_delay(entry.count, BASE_DELAY, MAX_DELAY)
    }

    /// Drop keys whose last failure is older than `max_age`
    pub fn forget_stale(&self, max_age: Duration) {
        self.failures
            .retain(|_, failures| failures.last.elapsed() < max_age);
    }

    /// Forget failures after a successful cycle
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Current failure count
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|f| f.count).unwrap_or(0)
    }
}

/// Key identifying an object in the tracker
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_failure_until_capped() {
        let tracker = FailureTracker::new();
        let key = object_key(Some("apps"), "bucket");

        let delays: Vec<u64> = (0..8)
            .map(|_| tracker.record_failure(&key).as_secs())
            .collect();

        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300]);
        assert_eq!(tracker.failures(&key), 8);
    }

    #[test]
    fn success_resets_the_counter() {
        let tracker = FailureTracker::new();
        tracker.record_failure("apps/bucket");
        tracker.record_failure("apps/bucket");
        tracker.reset("apps/bucket");

        assert_eq!(tracker.failures("apps/bucket"), 0);
        assert_eq!(tracker.record_failure("apps/bucket"), BASE_DELAY);
    }

    #[test]
    fn keys_of_vanished_objects_are_dropped_once_stale() {
        let tracker = FailureTracker::new();
        tracker.record_failure("apps/deleted");
        tracker.record_failure("apps/deleted");

        tracker.forget_stale(STALE_AFTER);
        assert_eq!(tracker.failures("apps/deleted"), 2);

        tracker.forget_stale(Duration::ZERO);
        assert_eq!(tracker.failures("apps/deleted"), 0);
    }

    #[test]
    fn objects_back_off_independently() {
        let tracker = FailureTracker::new();
        tracker.record_failure("apps/a");
        tracker.record_failure("apps/a");

        assert_eq!(tracker.record_failure("apps/b"), BASE_DELAY);
        assert_eq!(object_key(None, "plan-a"), "plan-a");
    }
}
