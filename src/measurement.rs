//! Measurement samples and their time-constrained variant.

// ============================================================================
// SECTION 6: MEASUREMENTS
// ============================================================================

use std::fmt::{self, Display, Formatter};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::ticks::Ticks;

// ----------------------------------------------------------------------------
// 6.1 Measurement Key
// ----------------------------------------------------------------------------

/// Identity of a measured quantity: numeric id within a named source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MeasurementKey {
    pub id: u32,
    pub source: CompactString,
}

impl MeasurementKey {
    pub fn new(id: u32, source: impl Into<CompactString>) -> Self {
        Self {
            id,
            source: source.into(),
        }
    }
}

impl Display for MeasurementKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.id)
    }
}

// ----------------------------------------------------------------------------
// 6.2 Measurement
// ----------------------------------------------------------------------------

/// A single timestamped scalar sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub key: MeasurementKey,
    pub value: f64,
    pub adder: f64,
    pub multiplier: f64,
    pub timestamp: Ticks,
    pub value_quality_is_good: bool,
    pub timestamp_quality_is_good: bool,
}

impl Measurement {
    pub fn new(key: MeasurementKey, value: f64, timestamp: Ticks) -> Self {
        Self {
            key,
            value,
            adder: 0.0,
            multiplier: 1.0,
            timestamp,
            value_quality_is_good: true,
            timestamp_quality_is_good: true,
        }
    }

    pub fn with_adder(mut self, adder: f64) -> Self {
        self.adder = adder;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_value_quality(mut self, is_good: bool) -> Self {
        self.value_quality_is_good = is_good;
        self
    }

    pub fn with_timestamp_quality(mut self, is_good: bool) -> Self {
        self.timestamp_quality_is_good = is_good;
        self
    }

    /// `value * multiplier + adder`
    #[inline]
    pub fn adjusted_value(&self) -> f64 {
        self.value * self.multiplier + self.adder
    }

    #[inline]
    pub fn key(&self) -> &MeasurementKey {
        &self.key
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    pub fn set_timestamp(&mut self, timestamp: Ticks) {
        self.timestamp = timestamp;
    }

    pub fn set_value_quality(&mut self, is_good: bool) {
        self.value_quality_is_good = is_good;
    }

    pub fn set_timestamp_quality(&mut self, is_good: bool) {
        self.timestamp_quality_is_good = is_good;
    }
}

impl Display for Measurement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {} @ {}", self.key, self.adjusted_value(), self.timestamp)
    }
}

// ----------------------------------------------------------------------------
// 6.3 Temporal Measurement
// ----------------------------------------------------------------------------

/// A measurement whose value is only meaningful near its timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalMeasurement {
    measurement: Measurement,
    /// Seconds
    lag_time: f64,
    /// Seconds
    lead_time: f64,
}

impl TemporalMeasurement {
    /// Starts with a NaN value at timestamp zero so any sample is newer.
    pub fn new(key: MeasurementKey, lag_time: f64, lead_time: f64) -> Self {
        Self {
            measurement: Measurement::new(key, f64::NAN, Ticks::ZERO),
            lag_time,
            lead_time,
        }
    }

    pub fn from_measurement(measurement: Measurement, lag_time: f64, lead_time: f64) -> Self {
        Self {
            measurement,
            lag_time,
            lead_time,
        }
    }

    #[inline]
    pub fn measurement(&self) -> &Measurement {
        &self.measurement
    }

    #[inline]
    pub fn timestamp(&self) -> Ticks {
        self.measurement.timestamp
    }

    pub fn lag_time(&self) -> f64 {
        self.lag_time
    }

    pub fn lead_time(&self) -> f64 {
        self.lead_time
    }

    pub fn set_lag_time(&mut self, lag_time: f64) {
        self.lag_time = lag_time;
    }

    pub fn set_lead_time(&mut self, lead_time: f64) {
        self.lead_time = lead_time;
    }

    /// Whether `now` lies in `[timestamp - lag_time, timestamp + lead_time]`.
    pub fn is_valid_at(&self, now: Ticks) -> bool {
        let ts = self.measurement.timestamp;
        let earliest = ts - Ticks::from_secs_f64(self.lag_time);
        let latest = ts + Ticks::from_secs_f64(self.lead_time);
        now >= earliest && now <= latest
    }

    /// Raw value, or NaN outside the validity window.
    pub fn get_value(&self, now: Ticks) -> f64 {
        if self.is_valid_at(now) {
            self.measurement.value
        } else {
            f64::NAN
        }
    }

    /// Adjusted value, or NaN outside the validity window.
    pub fn get_adjusted_value(&self, now: Ticks) -> f64 {
        if self.is_valid_at(now) {
            self.measurement.adjusted_value()
        } else {
            f64::NAN
        }
    }

    /// Store `value` when `timestamp` is strictly newer than the current one.
    pub fn set_value(&mut self, timestamp: Ticks, value: f64) -> bool {
        if timestamp > self.measurement.timestamp {
            self.measurement.timestamp = timestamp;
            self.measurement.value = value;
            true
        } else {
            false
        }
    }

    /// Take value, scaling and quality from a newer sample of the same key.
    pub fn update_from(&mut self, sample: &Measurement) -> bool {
        if !self.set_value(sample.timestamp, sample.value) {
            return false;
        }
        self.measurement.adder = sample.adder;
        self.measurement.multiplier = sample.multiplier;
        self.measurement.value_quality_is_good = sample.value_quality_is_good;
        self.measurement.timestamp_quality_is_good = sample.timestamp_quality_is_good;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key() -> MeasurementKey {
        MeasurementKey::new(12, "PMU1")
    }

    #[test]
    fn test_key_display_and_ordering() {
        assert_eq!(key().to_string(), "PMU1:12");
        assert!(MeasurementKey::new(1, "A") < MeasurementKey::new(1, "B"));
        assert!(MeasurementKey::new(1, "B") < MeasurementKey::new(2, "A"));
    }

    #[test]
    fn test_adjusted_value() {
        let m = Measurement::new(key(), 10.0, Ticks::from_secs(1))
            .with_multiplier(2.0)
            .with_adder(0.5);
        assert_eq!(m.adjusted_value(), 20.5);
        assert!(m.value_quality_is_good);
        assert!(m.timestamp_quality_is_good);
    }

    #[test]
    fn test_mutate_in_place() {
        let mut m = Measurement::new(key(), 1.0, Ticks::from_secs(1));
        m.set_value(4.0);
        m.set_timestamp(Ticks::from_secs(2));
        m.set_timestamp_quality(false);
        assert_eq!(m.value, 4.0);
        assert_eq!(m.timestamp, Ticks::from_secs(2));
        assert!(!m.timestamp_quality_is_good);
        assert_eq!(m.key(), &key());
    }

    #[test]
    fn test_temporal_window() {
        let ts = Ticks::from_secs(100);
        let tm = TemporalMeasurement::from_measurement(Measurement::new(key(), 5.0, ts), 2.0, 1.0);

        assert_eq!(tm.get_value(ts), 5.0);
        assert_eq!(tm.get_value(ts - Ticks::from_secs(2)), 5.0);
        assert_eq!(tm.get_value(ts + Ticks::from_secs(1)), 5.0);
        assert!(tm.get_value(ts - Ticks::from_secs(2) - Ticks::new(1)).is_nan());
        assert!(tm.get_value(ts + Ticks::from_secs(1) + Ticks::new(1)).is_nan());
    }

    #[test]
    fn test_temporal_newer_wins() {
        let mut tm = TemporalMeasurement::new(key(), 1.0, 1.0);
        assert!(tm.get_value(Ticks::ZERO).is_nan());
        assert!(tm.set_value(Ticks::from_secs(10), 1.5));
        assert!(!tm.set_value(Ticks::from_secs(10), 9.0));
        assert!(!tm.set_value(Ticks::from_secs(9), 9.0));
        assert_eq!(tm.get_value(Ticks::from_secs(10)), 1.5);
    }

    #[test]
    fn test_temporal_update_copies_scaling() {
        let mut tm = TemporalMeasurement::new(key(), 1.0, 1.0);
        let sample = Measurement::new(key(), 3.0, Ticks::from_secs(5)).with_multiplier(10.0);
        assert!(tm.update_from(&sample));
        assert_eq!(tm.get_adjusted_value(Ticks::from_secs(5)), 30.0);
    }
}
