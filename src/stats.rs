//! Lock-free statistics for the concentrator.

// ============================================================================
// SECTION 12: LOCK-FREE STATISTICS
// ============================================================================

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use serde::Serialize;

use crate::measurement::Measurement;
use crate::ticks::{AtomicTicks, Ticks};

// ----------------------------------------------------------------------------
// 12.1 Atomic Float
// ----------------------------------------------------------------------------

/// An atomic f64 stored as its bit pattern.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    #[inline]
    pub const fn new(val: f64) -> Self {
        Self {
            bits: AtomicU64::new(val.to_bits()),
        }
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> f64 {
        f64::from_bits(self.bits.load(ordering))
    }

    #[inline]
    pub fn store(&self, val: f64, ordering: AtomicOrdering) {
        self.bits.store(val.to_bits(), ordering);
    }
}

// ----------------------------------------------------------------------------
// 12.2 Atomic Counter
// ----------------------------------------------------------------------------

/// Relaxed, cache-padded event counter.
#[derive(Debug)]
pub struct AtomicCounter {
    value: CachePadded<AtomicU64>,
}

impl AtomicCounter {
    pub const fn new() -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Increment by 1, returning the previous value.
    #[inline]
    pub fn inc(&self) -> u64 {
        self.value.fetch_add(1, AtomicOrdering::Relaxed)
    }

    #[inline]
    pub fn add(&self, n: u64) -> u64 {
        self.value.fetch_add(n, AtomicOrdering::Relaxed)
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(AtomicOrdering::Relaxed)
    }

    /// Reset to 0 and return previous value.
    #[inline]
    pub fn reset(&self) -> u64 {
        self.value.swap(0, AtomicOrdering::Relaxed)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// 12.3 Concentrator Statistics
// ----------------------------------------------------------------------------

/// Counters shared by producers, the publisher and the monitor.
#[derive(Debug, Default)]
pub struct ConcentratorStats {
    pub received_measurements: AtomicCounter,
    pub processed_measurements: AtomicCounter,
    pub discarded_measurements: AtomicCounter,
    pub measurements_sorted_by_arrival: AtomicCounter,
    pub missed_sorts_by_timeout: AtomicCounter,
    pub published_measurements: AtomicCounter,
    pub published_frames: AtomicCounter,
    pub frames_ahead_of_schedule: AtomicCounter,
    /// Cumulative time spent in the publish hook, in ticks.
    pub total_publish_time: AtomicCounter,
    last_discarded_measurement: ArcSwapOption<Measurement>,
    last_discarded_latency: AtomicTicks,
}

impl ConcentratorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a discard and remember it as the most recent one.
    pub fn record_discard(&self, measurement: &Measurement, real_time: Ticks) {
        self.discarded_measurements.inc();
        self.last_discarded_latency
            .store(real_time - measurement.timestamp, AtomicOrdering::Relaxed);
        self.last_discarded_measurement
            .store(Some(Arc::new(measurement.clone())));
    }

    pub fn last_discarded_measurement(&self) -> Option<Arc<Measurement>> {
        self.last_discarded_measurement.load_full()
    }

    pub fn last_discarded_latency(&self) -> Ticks {
        self.last_discarded_latency.load(AtomicOrdering::Relaxed)
    }

    pub fn reset(&self) {
        self.received_measurements.reset();
        self.processed_measurements.reset();
        self.discarded_measurements.reset();
        self.measurements_sorted_by_arrival.reset();
        self.missed_sorts_by_timeout.reset();
        self.published_measurements.reset();
        self.published_frames.reset();
        self.frames_ahead_of_schedule.reset();
        self.total_publish_time.reset();
        self.last_discarded_measurement.store(None);
        self.last_discarded_latency
            .store(Ticks::ZERO, AtomicOrdering::Relaxed);
    }

    /// Average time per published frame, in seconds.
    pub fn average_publish_time(&self) -> f64 {
        let frames = self.published_frames.get();
        if frames == 0 {
            return 0.0;
        }
        Ticks::new(self.total_publish_time.get() as i64).as_secs_f64() / frames as f64
    }
}

// ----------------------------------------------------------------------------
// 12.4 Statistics Snapshot
// ----------------------------------------------------------------------------

/// Point-in-time copy of the concentrator statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub received_measurements: u64,
    pub processed_measurements: u64,
    pub discarded_measurements: u64,
    pub measurements_sorted_by_arrival: u64,
    pub missed_sorts_by_timeout: u64,
    pub published_measurements: u64,
    pub published_frames: u64,
    pub frames_ahead_of_schedule: u64,
    /// Seconds
    pub total_publish_time: f64,
    /// Seconds
    pub average_publish_time: f64,
    pub queued_frames: usize,
    pub last_discarded_measurement: Option<Measurement>,
    /// Seconds between real-time and the last discarded timestamp.
    pub last_discarded_latency: f64,
    /// Seconds
    pub run_time: f64,
}

impl ConcentratorStats {
    pub fn snapshot(&self, queued_frames: usize, run_time: f64) -> StatsSnapshot {
        StatsSnapshot {
            received_measurements: self.received_measurements.get(),
            processed_measurements: self.processed_measurements.get(),
            discarded_measurements: self.discarded_measurements.get(),
            measurements_sorted_by_arrival: self.measurements_sorted_by_arrival.get(),
            missed_sorts_by_timeout: self.missed_sorts_by_timeout.get(),
            published_measurements: self.published_measurements.get(),
            published_frames: self.published_frames.get(),
            frames_ahead_of_schedule: self.frames_ahead_of_schedule.get(),
            total_publish_time: Ticks::new(self.total_publish_time.get() as i64).as_secs_f64(),
            average_publish_time: self.average_publish_time(),
            queued_frames,
            last_discarded_measurement: self
                .last_discarded_measurement()
                .map(|m| m.as_ref().clone()),
            last_discarded_latency: self.last_discarded_latency().as_secs_f64(),
            run_time,
        }
    }
}

impl StatsSnapshot {
    /// Append the counter lines of the status report.
    pub(crate) fn write_report(&self, out: &mut String) {
        let _ = writeln!(out, "     Received measurements: {}", self.received_measurements);
        let _ = writeln!(out, "    Processed measurements: {}", self.processed_measurements);
        let _ = writeln!(out, "    Discarded measurements: {}", self.discarded_measurements);
        let _ = writeln!(out, "  Sorted by arrival time: {}", self.measurements_sorted_by_arrival);
        let _ = writeln!(out, "   Missed sorts by timeout: {}", self.missed_sorts_by_timeout);
        let _ = writeln!(out, "    Published measurements: {}", self.published_measurements);
        let _ = writeln!(out, "          Published frames: {}", self.published_frames);
        let _ = writeln!(out, "  Frames ahead of schedule: {}", self.frames_ahead_of_schedule);
        let _ = writeln!(
            out,
            "    Average publish time: {:.4} ms",
            self.average_publish_time * 1000.0
        );
        let _ = writeln!(out, "      Queued frames: {}", self.queued_frames);
        match &self.last_discarded_measurement {
            Some(m) => {
                let _ = writeln!(
                    out,
                    "  Last discarded measurement: {} @ {} ({:.3} seconds late)",
                    m.key, m.timestamp, self.last_discarded_latency
                );
            }
            None => {
                let _ = writeln!(out, "  Last discarded measurement: <none>");
            }
        }
        let _ = writeln!(out, "      Total run time: {:.3} seconds", self.run_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasurementKey;

    #[test]
    fn test_atomic_f64() {
        let value = AtomicF64::new(0.5);
        assert_eq!(value.load(AtomicOrdering::Relaxed), 0.5);
        value.store(-2.25, AtomicOrdering::Relaxed);
        assert_eq!(value.load(AtomicOrdering::Relaxed), -2.25);
    }

    #[test]
    fn test_atomic_counter() {
        let counter = AtomicCounter::new();
        assert_eq!(counter.inc(), 0);
        counter.add(9);
        assert_eq!(counter.get(), 10);
        assert_eq!(counter.reset(), 10);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_record_discard_and_reset() {
        let stats = ConcentratorStats::new();
        let m = Measurement::new(MeasurementKey::new(7, "PMU"), 1.0, Ticks::from_secs(90));
        stats.record_discard(&m, Ticks::from_secs(100));

        assert_eq!(stats.discarded_measurements.get(), 1);
        assert_eq!(stats.last_discarded_latency(), Ticks::from_secs(10));
        assert_eq!(stats.last_discarded_measurement().unwrap().key, m.key);

        stats.reset();
        assert_eq!(stats.discarded_measurements.get(), 0);
        assert!(stats.last_discarded_measurement().is_none());
    }

    #[test]
    fn test_snapshot_averages_publish_time() {
        let stats = ConcentratorStats::new();
        stats.published_frames.add(4);
        stats.total_publish_time.add(Ticks::from_millis(8).value() as u64);
        let snapshot = stats.snapshot(3, 1.5);
        assert_eq!(snapshot.queued_frames, 3);
        assert!((snapshot.average_publish_time - 0.002).abs() < 1e-12);
        assert!((snapshot.total_publish_time - 0.008).abs() < 1e-12);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["published_frames"], 4);
    }
}
