//! Tick timestamps and fixed-point frame-rate arithmetic.
//!
//! A [`Ticks`] value counts 100 nanosecond intervals since the Unix epoch.
//! [`FrameRate`] keeps the frame period as the exact fraction
//! `Ticks::PER_SECOND / frames_per_second`, so bucket boundaries never drift
//! the way an accumulated floating point period would.

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM - TICKS & FRAME RATE
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ----------------------------------------------------------------------------
// 3.1 Ticks - 100ns Resolution Timestamps
// ----------------------------------------------------------------------------

/// Timestamp in 100 nanosecond ticks since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Ticks(i64);

impl Ticks {
    /// Ticks in one second.
    pub const PER_SECOND: i64 = 10_000_000;

    /// Ticks in one millisecond.
    pub const PER_MILLISECOND: i64 = 10_000;

    /// Ticks in one microsecond.
    pub const PER_MICROSECOND: i64 = 10;

    /// Zero ticks (Unix epoch). Also used as the "unset" marker for references.
    pub const ZERO: Ticks = Ticks(0);

    /// Maximum representable timestamp
    pub const MAX: Ticks = Ticks(i64::MAX);

    /// Minimum representable timestamp
    pub const MIN: Ticks = Ticks(i64::MIN);

    #[inline]
    pub const fn new(ticks: i64) -> Self {
        Self(ticks)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(Self::PER_SECOND))
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(Self::PER_MILLISECOND))
    }

    #[inline]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros.saturating_mul(Self::PER_MICROSECOND))
    }

    /// Create from fractional seconds, rounded to the nearest tick.
    #[inline]
    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * Self::PER_SECOND as f64).round() as i64)
    }

    /// Create from a duration (saturating at [`Ticks::MAX`]).
    #[inline]
    pub fn from_duration(duration: Duration) -> Self {
        let ticks = duration.as_nanos() / 100;
        Self(i64::try_from(ticks).unwrap_or(i64::MAX))
    }

    /// Current wall-clock time.
    #[inline]
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    /// Raw tick count.
    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / Self::PER_SECOND as f64
    }

    #[inline]
    pub fn as_millis_f64(self) -> f64 {
        self.0 as f64 / Self::PER_MILLISECOND as f64
    }

    /// Convert to a duration; negative values clamp to zero.
    #[inline]
    pub fn to_duration(self) -> Duration {
        let ticks = self.0.max(0) as u64;
        Duration::from_nanos(ticks.saturating_mul(100))
    }

    /// Ticks elapsed since the top of the second containing this timestamp.
    #[inline]
    pub const fn distance_beyond_second(self) -> Ticks {
        Ticks(self.0.rem_euclid(Self::PER_SECOND))
    }

    /// Timestamp truncated to its whole second.
    #[inline]
    pub const fn baseline_second(self) -> Ticks {
        Ticks(self.0 - self.0.rem_euclid(Self::PER_SECOND))
    }

    /// Determines whether this timestamp is within `lag_time` seconds before
    /// or `lead_time` seconds after `reference`. Both edges are inclusive.
    #[inline]
    pub fn is_valid_time(self, reference: Ticks, lag_time: f64, lead_time: f64) -> bool {
        let distance = (reference - self).as_secs_f64();
        distance >= -lead_time && distance <= lag_time
    }

    #[inline]
    pub const fn saturating_sub(self, rhs: Ticks) -> Ticks {
        Ticks(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    pub const fn saturating_add(self, rhs: Ticks) -> Ticks {
        Ticks(self.0.saturating_add(rhs.0))
    }

    /// Convert to chrono DateTime<Utc>
    pub fn to_datetime(self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(Self::PER_SECOND);
        let nanos = (self.0.rem_euclid(Self::PER_SECOND) * 100) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }
}

impl Add for Ticks {
    type Output = Ticks;

    #[inline]
    fn add(self, rhs: Ticks) -> Ticks {
        self.saturating_add(rhs)
    }
}

impl AddAssign for Ticks {
    #[inline]
    fn add_assign(&mut self, rhs: Ticks) {
        *self = *self + rhs;
    }
}

impl Sub for Ticks {
    type Output = Ticks;

    #[inline]
    fn sub(self, rhs: Ticks) -> Ticks {
        self.saturating_sub(rhs)
    }
}

impl SubAssign for Ticks {
    #[inline]
    fn sub_assign(&mut self, rhs: Ticks) {
        *self = *self - rhs;
    }
}

impl Display for Ticks {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%d-%b-%Y %H:%M:%S%.3f"))
    }
}

impl From<i64> for Ticks {
    #[inline]
    fn from(ticks: i64) -> Self {
        Self(ticks)
    }
}

impl From<Ticks> for i64 {
    #[inline]
    fn from(ticks: Ticks) -> Self {
        ticks.0
    }
}

impl From<SystemTime> for Ticks {
    fn from(st: SystemTime) -> Self {
        match st.duration_since(UNIX_EPOCH) {
            Ok(after) => Self::from_duration(after),
            Err(before) => Ticks(0) - Self::from_duration(before.duration()),
        }
    }
}

impl From<DateTime<Utc>> for Ticks {
    fn from(dt: DateTime<Utc>) -> Self {
        Ticks(dt.timestamp() * Self::PER_SECOND + i64::from(dt.timestamp_subsec_nanos() / 100))
    }
}

// ----------------------------------------------------------------------------
// 3.2 Atomic Ticks - Lock-Free Timestamp Cell
// ----------------------------------------------------------------------------

/// Atomic timestamp for lock-free operations
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct AtomicTicks(AtomicI64);

impl AtomicTicks {
    #[inline]
    pub const fn new(ticks: Ticks) -> Self {
        Self(AtomicI64::new(ticks.0))
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Ticks {
        Ticks(self.0.load(ordering))
    }

    #[inline]
    pub fn store(&self, ticks: Ticks, ordering: AtomicOrdering) {
        self.0.store(ticks.0, ordering);
    }

    #[inline]
    pub fn swap(&self, ticks: Ticks, ordering: AtomicOrdering) -> Ticks {
        Ticks(self.0.swap(ticks.0, ordering))
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: Ticks,
        new: Ticks,
        success: AtomicOrdering,
        failure: AtomicOrdering,
    ) -> Result<Ticks, Ticks> {
        self.0
            .compare_exchange(current.0, new.0, success, failure)
            .map(Ticks)
            .map_err(Ticks)
    }

    /// Replace the stored value with `new` if it is newer. Returns true when
    /// this call performed the update.
    #[inline]
    pub fn update_if_newer(&self, new: Ticks) -> bool {
        let mut current = self.load(AtomicOrdering::Acquire);
        while new > current {
            match self.compare_exchange(current, new, AtomicOrdering::AcqRel, AtomicOrdering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }
}

// ----------------------------------------------------------------------------
// 3.3 Frame Rate - Exact Bucket Alignment
// ----------------------------------------------------------------------------

/// Frames per second, restricted to `1..=1000`.
///
/// Bucket `k` covers `[k/F, (k+1)/F)` seconds. Its start is rounded up to a
/// whole tick so that aligning an already aligned timestamp is a no-op and the
/// aligned value never exceeds the original timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct FrameRate(u32);

impl FrameRate {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 1000;

    pub fn new(frames_per_second: u32) -> Result<Self, ConfigError> {
        if !(Self::MIN..=Self::MAX).contains(&frames_per_second) {
            return Err(ConfigError::invalid_value(
                "frames_per_second",
                format!(
                    "must be between {} and {}, got {}",
                    Self::MIN,
                    Self::MAX,
                    frames_per_second
                ),
            ));
        }
        Ok(Self(frames_per_second))
    }

    #[inline]
    pub const fn frames_per_second(self) -> u32 {
        self.0
    }

    /// Ticks per frame, for display and diagnostics only.
    #[inline]
    pub fn ticks_per_frame(self) -> f64 {
        Ticks::PER_SECOND as f64 / f64::from(self.0)
    }

    /// Nominal frame period.
    #[inline]
    pub fn frame_period(self) -> Duration {
        Duration::from_secs(1) / self.0
    }

    /// Absolute bucket number: `floor(t * F / PER_SECOND)`.
    #[inline]
    pub fn bucket_number(self, timestamp: Ticks) -> i64 {
        let scaled = i128::from(timestamp.value()) * i128::from(self.0);
        scaled.div_euclid(i128::from(Ticks::PER_SECOND)) as i64
    }

    /// First tick of bucket `number`: `ceil(number * PER_SECOND / F)`.
    #[inline]
    pub fn bucket_start(self, number: i64) -> Ticks {
        let scaled = i128::from(number) * i128::from(Ticks::PER_SECOND);
        let rate = i128::from(self.0);
        let mut start = scaled.div_euclid(rate);
        if scaled.rem_euclid(rate) != 0 {
            start += 1;
        }
        Ticks::new(start as i64)
    }

    /// Align a timestamp down to the start of its frame bucket.
    #[inline]
    pub fn align(self, timestamp: Ticks) -> Ticks {
        self.bucket_start(self.bucket_number(timestamp))
    }

    /// Index (`0..F`) of the frame containing `timestamp` within its second.
    #[inline]
    pub fn frame_index(self, timestamp: Ticks) -> usize {
        self.bucket_number(timestamp).rem_euclid(i64::from(self.0)) as usize
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self(crate::DEFAULT_FRAMES_PER_SECOND)
    }
}

impl TryFrom<u32> for FrameRate {
    type Error = ConfigError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FrameRate> for u32 {
    fn from(rate: FrameRate) -> Self {
        rate.0
    }
}

impl Display for FrameRate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} frames/sec", self.0)
    }
}
