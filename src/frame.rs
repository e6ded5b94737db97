//! A single time-aligned bucket of measurements.

// ============================================================================
// SECTION 7: FRAMES
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering as AtomicOrdering};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::measurement::{Measurement, MeasurementKey};
use crate::ticks::Ticks;

/// Mutable part of a frame, guarded by the frame lock.
#[derive(Debug, Default)]
struct FrameState {
    measurements: AHashMap<MeasurementKey, Measurement>,
    published: bool,
    last_sorted: Option<Measurement>,
}

/// One frame: every measurement whose timestamp aligns to `timestamp`.
///
/// Once published the measurement map is frozen. The published check and the
/// insert happen under the same lock, so a sample either lands before
/// publication or is rejected.
#[derive(Debug)]
pub struct Frame {
    timestamp: Ticks,
    state: Mutex<FrameState>,
    published: AtomicBool,
    published_count: AtomicI64,
}

impl Frame {
    pub fn new(timestamp: Ticks) -> Self {
        Self::with_capacity(timestamp, 0)
    }

    pub fn with_capacity(timestamp: Ticks, capacity: usize) -> Self {
        Self {
            timestamp,
            state: Mutex::new(FrameState {
                measurements: AHashMap::with_capacity(capacity),
                ..FrameState::default()
            }),
            published: AtomicBool::new(false),
            published_count: AtomicI64::new(-1),
        }
    }

    #[inline]
    pub fn timestamp(&self) -> Ticks {
        self.timestamp
    }

    /// Insert or replace the measurement for its key unless the frame has been
    /// published, and remember it as the last sorted one. Returns whether it
    /// was stored.
    pub fn try_assign(&self, measurement: Measurement) -> bool {
        let mut state = self.state.lock();
        if state.published {
            return false;
        }
        state
            .measurements
            .insert(measurement.key.clone(), measurement.clone());
        state.last_sorted = Some(measurement);
        true
    }

    /// Freeze the frame. Returns false when it was already published.
    pub fn mark_published(&self) -> bool {
        let mut state = self.state.lock();
        if state.published {
            return false;
        }
        state.published = true;
        self.published.store(true, AtomicOrdering::Release);
        true
    }

    #[inline]
    pub fn is_published(&self) -> bool {
        self.published.load(AtomicOrdering::Acquire)
    }

    /// Measurements in the frame, or the count fixed by
    /// [`Frame::set_published_count`] when one was recorded.
    pub fn sorted_measurements(&self) -> usize {
        let count = self.published_count.load(AtomicOrdering::Acquire);
        if count >= 0 {
            count as usize
        } else {
            self.state.lock().measurements.len()
        }
    }

    /// Override the count reported as published (e.g. after filtering).
    pub fn set_published_count(&self, count: usize) {
        self.published_count
            .store(count as i64, AtomicOrdering::Release);
    }

    pub fn measurement(&self, key: &MeasurementKey) -> Option<Measurement> {
        self.state.lock().measurements.get(key).cloned()
    }

    /// Copy of all measurements, ordered by key.
    pub fn measurements(&self) -> Vec<Measurement> {
        let mut all: Vec<_> = self.state.lock().measurements.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Run `f` over the measurement map while holding the frame lock.
    pub fn with_measurements<R>(&self, f: impl FnOnce(&AHashMap<MeasurementKey, Measurement>) -> R) -> R {
        f(&self.state.lock().measurements)
    }

    /// Most recent measurement stored before publication.
    pub fn last_sorted_measurement(&self) -> Option<Measurement> {
        self.state.lock().last_sorted.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: u32, value: f64) -> Measurement {
        Measurement::new(MeasurementKey::new(id, "PMU"), value, Ticks::from_secs(1))
    }

    #[test]
    fn test_assign_replaces_same_key() {
        let frame = Frame::new(Ticks::from_secs(1));
        assert!(frame.try_assign(sample(1, 1.0)));
        assert!(frame.try_assign(sample(1, 2.0)));
        assert!(frame.try_assign(sample(2, 3.0)));
        assert_eq!(frame.sorted_measurements(), 2);
        assert_eq!(frame.measurement(&MeasurementKey::new(1, "PMU")).unwrap().value, 2.0);
        assert_eq!(frame.last_sorted_measurement().unwrap().value, 3.0);
    }

    #[test]
    fn test_published_frame_is_frozen() {
        let frame = Frame::new(Ticks::from_secs(1));
        assert!(frame.try_assign(sample(1, 1.0)));
        assert!(frame.mark_published());
        assert!(!frame.mark_published());
        assert!(frame.is_published());
        assert!(!frame.try_assign(sample(2, 5.0)));
        assert_eq!(frame.sorted_measurements(), 1);
        assert_eq!(frame.last_sorted_measurement().unwrap().value, 1.0);
    }

    #[test]
    fn test_published_count_override() {
        let frame = Frame::new(Ticks::from_secs(1));
        frame.try_assign(sample(1, 1.0));
        frame.try_assign(sample(2, 1.0));
        frame.set_published_count(1);
        assert_eq!(frame.sorted_measurements(), 1);
    }

    #[test]
    fn test_measurements_sorted_by_key() {
        let frame = Frame::new(Ticks::from_secs(1));
        frame.try_assign(sample(3, 0.0));
        frame.try_assign(sample(1, 0.0));
        frame.try_assign(sample(2, 0.0));
        let ids: Vec<u32> = frame.measurements().iter().map(|m| m.key.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(frame.with_measurements(|map| map.len()), 3);
    }
}
