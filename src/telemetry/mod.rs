//! Performance telemetry.
//!
//! Hypervisor and kernel counters are cumulative. The engines here sample
//! them on a fixed cycle and report rates computed against the previous
//! sample of the same key:
//!
//! - [`GuestPerfEngine`]: CPU/memory, interface traffic and disk I/O per guest
//! - [`HostPerfEngine`]: CPU/memory, interface traffic, disk usage and I/O
//!   for the host itself
//! - [`Heartbeat`] and [`StateReporter`]: periodic host identity and guest
//!   state reports
//!
//! The first observation of a key only seeds state. Keys not refreshed for
//! twice the sampling interval are purged by housekeeping.

pub mod guest;
pub mod host;
pub mod proc;
pub mod report;

pub use guest::GuestPerfEngine;
pub use host::HostPerfEngine;
pub use report::{Heartbeat, StateReporter};

use crate::hypervisor::{BlockStats, InterfaceStats};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Longest uninterrupted sleep of a telemetry loop.
const SLEEP_SLICE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct Sample<C> {
    counters: C,
    at: Instant,
}

/// Last raw counters per key.
#[derive(Debug, Clone)]
pub struct DeltaTracker<K, C> {
    entries: HashMap<K, Sample<C>>,
}

impl<K: Eq + Hash, C: Clone> DeltaTracker<K, C> {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Store `counters` as the latest sample of `key`.
    ///
    /// Returns the previous counters and the time since they were taken, or
    /// `None` on the first observation.
    pub fn observe(&mut self, key: K, counters: C, at: Instant) -> Option<(C, Duration)> {
        let previous = self
            .entries
            .insert(key, Sample { counters, at })?;
        Some((previous.counters, at.saturating_duration_since(previous.at)))
    }

    /// Drop keys whose last sample is older than `max_age`. Returns how many
    /// were dropped.
    pub fn purge_older_than(&mut self, max_age: Duration, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, sample| now.saturating_duration_since(sample.at) <= max_age);
        before - self.entries.len()
    }

    /// Whether `key` has a stored sample.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash, C: Clone> Default for DeltaTracker<K, C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-second rate of a cumulative counter.
///
/// A counter that went backwards was reset; its rate is zero.
pub fn rate(current: u64, previous: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if current < previous || secs <= 0.0 {
        return 0.0;
    }
    (current - previous) as f64 / secs
}

/// CPU load in percent from consumed CPU time, clamped to `[0, 100]`.
pub fn cpu_load(current_ns: u64, previous_ns: u64, elapsed: Duration, cpu_count: u32) -> f64 {
    let wall_ns = elapsed.as_nanos() as f64 * cpu_count.max(1) as f64;
    if current_ns < previous_ns || wall_ns <= 0.0 {
        return 0.0;
    }
    let load = (current_ns - previous_ns) as f64 / wall_ns * 100.0;
    load.clamp(0.0, 100.0)
}

/// Rates of interface counters, keyed by counter name.
pub(crate) fn traffic_rates(current: &InterfaceStats, previous: &InterfaceStats, elapsed: Duration) -> Value {
    json!({
        "rx_bytes": rate(current.rx_bytes, previous.rx_bytes, elapsed),
        "rx_packets": rate(current.rx_packets, previous.rx_packets, elapsed),
        "rx_errs": rate(current.rx_errs, previous.rx_errs, elapsed),
        "rx_drop": rate(current.rx_drop, previous.rx_drop, elapsed),
        "tx_bytes": rate(current.tx_bytes, previous.tx_bytes, elapsed),
        "tx_packets": rate(current.tx_packets, previous.tx_packets, elapsed),
        "tx_errs": rate(current.tx_errs, previous.tx_errs, elapsed),
        "tx_drop": rate(current.tx_drop, previous.tx_drop, elapsed),
    })
}

/// Rates of block counters, keyed by counter name.
pub(crate) fn block_rates(current: &BlockStats, previous: &BlockStats, elapsed: Duration) -> Value {
    json!({
        "rd_req": rate(current.rd_req, previous.rd_req, elapsed),
        "rd_bytes": rate(current.rd_bytes, previous.rd_bytes, elapsed),
        "wr_req": rate(current.wr_req, previous.wr_req, elapsed),
        "wr_bytes": rate(current.wr_bytes, previous.wr_bytes, elapsed),
    })
}

/// Merge `extra` into the object `base`.
pub(crate) fn with_fields(mut base: Value, extra: Value) -> Value {
    if let (Some(base), Value::Object(extra)) = (base.as_object_mut(), extra) {
        base.extend(extra);
    }
    base
}

/// Time until the next multiple of `interval` on the wall clock.
pub fn until_boundary(now: SystemTime, interval: Duration) -> Duration {
    let interval_ms = interval.as_millis().max(1);
    let now_ms = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let wait = interval_ms - now_ms % interval_ms;
    Duration::from_millis(wait as u64)
}

/// Sleep until the next boundary of `interval`, waking early on shutdown.
///
/// Returns `false` if `shutdown` was raised.
pub fn wait_for_boundary(interval: Duration, shutdown: &AtomicBool) -> bool {
    sleep_unless_shutdown(until_boundary(SystemTime::now(), interval), shutdown)
}

/// Sleep for `duration` in short slices. Returns `false` if `shutdown` was
/// raised first.
pub fn sleep_unless_shutdown(duration: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_is_suppressed() {
        let mut tracker = DeltaTracker::new();
        let t0 = Instant::now();

        assert!(tracker.observe("a", 100u64, t0).is_none());

        let t1 = t0 + Duration::from_secs(10);
        let (previous, elapsed) = tracker.observe("a", 600u64, t1).unwrap();
        assert_eq!(previous, 100);
        assert_eq!(elapsed, Duration::from_secs(10));
        assert_eq!(rate(600, previous, elapsed), 50.0);
    }

    #[test]
    fn test_stale_keys_are_purged() {
        let mut tracker = DeltaTracker::new();
        let t0 = Instant::now();
        let interval = Duration::from_secs(60);

        tracker.observe("gone", 1u64, t0);
        tracker.observe("alive", 1u64, t0 + Duration::from_secs(110));

        let now = t0 + Duration::from_secs(150);
        assert_eq!(tracker.purge_older_than(interval * 2, now), 1);
        assert!(!tracker.contains(&"gone"));
        assert!(tracker.contains(&"alive"));

        // A key that reappears starts over
        assert!(tracker.observe("gone", 5u64, now).is_none());
    }

    #[test]
    fn test_cpu_load_is_clamped() {
        let elapsed = Duration::from_secs(1);
        // 1.37 CPU-seconds on one CPU in one second
        assert_eq!(cpu_load(1_370_000_000, 0, elapsed, 1), 100.0);
        assert_eq!(cpu_load(500_000_000, 0, elapsed, 2), 25.0);
    }

    #[test]
    fn test_counter_reset_yields_zero_rate() {
        assert_eq!(rate(10, 500, Duration::from_secs(1)), 0.0);
        assert_eq!(cpu_load(10, 500, Duration::from_secs(1), 1), 0.0);
        assert_eq!(rate(10, 0, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_until_boundary_aligns_to_interval() {
        let interval = Duration::from_secs(60);
        let at = UNIX_EPOCH + Duration::from_secs(120 + 15);
        assert_eq!(until_boundary(at, interval), Duration::from_secs(45));

        let on_boundary = UNIX_EPOCH + Duration::from_secs(180);
        assert_eq!(until_boundary(on_boundary, interval), interval);
    }

    #[test]
    fn test_wait_returns_false_on_shutdown() {
        let shutdown = AtomicBool::new(true);
        assert!(!wait_for_boundary(Duration::from_secs(3600), &shutdown));
    }
}
