//! Latest known values per measurement key, with tag aggregates.

// ============================================================================
// SECTION 9: IMMEDIATE MEASUREMENTS
// ============================================================================

use std::collections::BTreeSet;
use std::sync::atomic::Ordering as AtomicOrdering;

use ahash::AHashMap;
use compact_str::CompactString;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::measurement::{Measurement, MeasurementKey, TemporalMeasurement};
use crate::stats::AtomicF64;
use crate::ticks::Ticks;

/// Cache of the newest value seen for each key.
///
/// Values are only reported while the query time is inside the entry's
/// lag/lead window; stale entries read as NaN and are skipped by aggregates.
#[derive(Debug)]
pub struct ImmediateMeasurements {
    measurements: DashMap<MeasurementKey, TemporalMeasurement, ahash::RandomState>,
    tags: RwLock<AHashMap<CompactString, BTreeSet<MeasurementKey>>>,
    lag_time: AtomicF64,
    lead_time: AtomicF64,
}

impl ImmediateMeasurements {
    pub fn new(lag_time: f64, lead_time: f64) -> Self {
        Self {
            measurements: DashMap::with_hasher(ahash::RandomState::new()),
            tags: RwLock::new(AHashMap::new()),
            lag_time: AtomicF64::new(lag_time),
            lead_time: AtomicF64::new(lead_time),
        }
    }

    pub fn lag_time(&self) -> f64 {
        self.lag_time.load(AtomicOrdering::Relaxed)
    }

    pub fn lead_time(&self) -> f64 {
        self.lead_time.load(AtomicOrdering::Relaxed)
    }

    /// Apply a new lag time to the table and every cached entry.
    pub fn set_lag_time(&self, lag_time: f64) {
        self.lag_time.store(lag_time, AtomicOrdering::Relaxed);
        for mut entry in self.measurements.iter_mut() {
            entry.set_lag_time(lag_time);
        }
    }

    /// Apply a new lead time to the table and every cached entry.
    pub fn set_lead_time(&self, lead_time: f64) {
        self.lead_time.store(lead_time, AtomicOrdering::Relaxed);
        for mut entry in self.measurements.iter_mut() {
            entry.set_lead_time(lead_time);
        }
    }

    /// Record `measurement` if it is newer than what is cached for its key.
    pub fn update(&self, measurement: &Measurement) -> bool {
        let mut entry = self
            .measurements
            .entry(measurement.key.clone())
            .or_insert_with(|| {
                TemporalMeasurement::new(measurement.key.clone(), self.lag_time(), self.lead_time())
            });
        entry.update_from(measurement)
    }

    /// Value for `key` if present and valid at `now`.
    pub fn value(&self, key: &MeasurementKey, now: Ticks) -> Option<f64> {
        self.measurements
            .get(key)
            .map(|entry| entry.get_adjusted_value(now))
            .filter(|value| !value.is_nan())
    }

    /// Newest cached sample for `key`, regardless of validity.
    pub fn measurement(&self, key: &MeasurementKey) -> Option<Measurement> {
        self.measurements
            .get(key)
            .map(|entry| entry.measurement().clone())
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Drop cached values. Tag definitions are kept.
    pub fn clear(&self) {
        self.measurements.clear();
    }

    // ---- Tags ----

    /// Define (or redefine) a tag as exactly `keys`.
    pub fn define_tag<I>(&self, name: impl Into<CompactString>, keys: I)
    where
        I: IntoIterator<Item = MeasurementKey>,
    {
        self.tags
            .write()
            .insert(name.into(), keys.into_iter().collect());
    }

    /// Add one key to a tag, creating the tag if needed.
    pub fn add_to_tag(&self, name: impl Into<CompactString>, key: MeasurementKey) {
        self.tags.write().entry(name.into()).or_default().insert(key);
    }

    pub fn tag_keys(&self, name: &str) -> Vec<MeasurementKey> {
        self.tags
            .read()
            .get(name)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn tag_values(&self, name: &str, now: Ticks) -> Vec<f64> {
        let keys = self.tag_keys(name);
        keys.iter()
            .filter_map(|key| self.value(key, now))
            .collect()
    }

    /// Smallest valid value in the tag.
    pub fn minimum(&self, tag: &str, now: Ticks) -> Option<f64> {
        self.tag_values(tag, now).into_iter().reduce(f64::min)
    }

    /// Largest valid value in the tag.
    pub fn maximum(&self, tag: &str, now: Ticks) -> Option<f64> {
        self.tag_values(tag, now).into_iter().reduce(f64::max)
    }

    /// Mean of the valid values in the tag.
    pub fn average(&self, tag: &str, now: Ticks) -> Option<f64> {
        let values = self.tag_values(tag, now);
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Ticks = Ticks::from_secs(1_000);

    fn key(id: u32) -> MeasurementKey {
        MeasurementKey::new(id, "PMU")
    }

    fn sample(id: u32, value: f64, ts: Ticks) -> Measurement {
        Measurement::new(key(id), value, ts)
    }

    fn table() -> ImmediateMeasurements {
        let table = ImmediateMeasurements::new(5.0, 5.0);
        table.define_tag("voltage", [key(1), key(2), key(3)]);
        table
    }

    #[test]
    fn test_update_is_newer_wins() {
        let t = table();
        assert!(t.update(&sample(1, 1.0, NOW)));
        assert!(!t.update(&sample(1, 2.0, NOW - Ticks::from_secs(1))));
        assert_eq!(t.value(&key(1), NOW), Some(1.0));
        assert_eq!(t.len(), 1);
        assert_eq!(t.measurement(&key(1)).unwrap().timestamp, NOW);
    }

    #[test]
    fn test_tag_aggregates() {
        let t = table();
        t.update(&sample(1, 10.0, NOW));
        t.update(&sample(2, 20.0, NOW));
        t.update(&sample(3, 60.0, NOW));
        assert_eq!(t.minimum("voltage", NOW), Some(10.0));
        assert_eq!(t.maximum("voltage", NOW), Some(60.0));
        assert_eq!(t.average("voltage", NOW), Some(30.0));
    }

    #[test]
    fn test_aggregates_skip_stale_values() {
        let t = table();
        t.update(&sample(1, 10.0, NOW - Ticks::from_secs(60)));
        t.update(&sample(2, 20.0, NOW));
        assert_eq!(t.minimum("voltage", NOW), Some(20.0));
        assert_eq!(t.average("voltage", NOW), Some(20.0));
        assert_eq!(t.value(&key(1), NOW), None);
    }

    #[test]
    fn test_aggregates_none_without_valid_values() {
        let t = table();
        assert_eq!(t.maximum("voltage", NOW), None);
        assert_eq!(t.average("missing", NOW), None);
    }

    #[test]
    fn test_add_to_tag() {
        let t = ImmediateMeasurements::new(1.0, 1.0);
        t.add_to_tag("freq", key(9));
        t.add_to_tag("freq", key(4));
        assert_eq!(t.tag_keys("freq"), vec![key(4), key(9)]);
    }

    #[test]
    fn test_lag_change_propagates() {
        let t = table();
        t.update(&sample(1, 10.0, NOW));
        let later = NOW - Ticks::from_secs(8);
        assert_eq!(t.value(&key(1), later), None);
        t.set_lag_time(10.0);
        assert_eq!(t.value(&key(1), later), Some(10.0));
        assert_eq!(t.lag_time(), 10.0);
    }

    #[test]
    fn test_clear_keeps_tags() {
        let t = table();
        t.update(&sample(1, 10.0, NOW));
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.tag_keys("voltage").len(), 3);
    }
}
