use std::{
    fmt::Display,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::Mutex;

/// A snapshot of a stage's worker activity.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct StageStats {
    /// The number of values the worker has published.
    pub published: u64,
    /// The number of cycles whose producer or transform failed.
    pub failures: u64,
    /// The message of the most recent failure.
    pub last_error: Option<String>,
}

/// Counters updated by a stage's worker and read by anyone.
#[derive(Debug, Default)]
pub(crate) struct StageMetrics {
    published: AtomicU64,
    failures: AtomicU64,
    in_flight: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl StageMetrics {
    /// Marks a cycle as running until the returned guard is dropped.
    pub(crate) fn begin_cycle(&self) -> Cycle<'_> {
        self.mark_in_flight();
        self.cycle()
    }

    pub(crate) fn mark_in_flight(&self) {
        self.in_flight.store(true, Ordering::Release);
    }

    /// Returns a guard that ends the current cycle when dropped, even while
    /// unwinding from a panicking producer.
    pub(crate) fn cycle(&self) -> Cycle<'_> {
        Cycle { metrics: self }
    }

    pub(crate) fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_failure(&self, stage: &str, error: &dyn Display) {
        let message = error.to_string();
        tracing::warn!(stage, error = %message, "cycle failed, keeping the previous value");
        *self.last_error.lock() = Some(message);
        self.failures.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn snapshot(&self) -> StageStats {
        StageStats {
            published: self.published.load(Ordering::Acquire),
            failures: self.failures.load(Ordering::Acquire),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Ends a cycle when dropped.
#[must_use]
pub(crate) struct Cycle<'a> {
    metrics: &'a StageMetrics,
}

impl Drop for Cycle<'_> {
    fn drop(&mut self) {
        self.metrics.in_flight.store(false, Ordering::Release);
    }
}

#[test]
fn records() {
    let metrics = StageMetrics::default();
    assert_eq!(metrics.snapshot(), StageStats::default());
    let cycle = metrics.begin_cycle();
    assert!(metrics.in_flight());
    metrics.record_published();
    metrics.record_failure("test", &"sensor unplugged");
    drop(cycle);
    assert!(!metrics.in_flight());
    assert_eq!(
        metrics.snapshot(),
        StageStats {
            published: 1,
            failures: 1,
            last_error: Some(String::from("sensor unplugged")),
        }
    );
}

#[test]
fn panicking_cycle_ends() {
    let metrics = StageMetrics::default();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _cycle = metrics.begin_cycle();
        panic!("producer crashed");
    }));
    assert!(result.is_err());
    assert!(!metrics.in_flight());
}
