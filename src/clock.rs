//! Local clock and the moving real-time reference.

// ============================================================================
// SECTION 5: REAL-TIME CLOCK MODEL
// ============================================================================

use std::fmt;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use quanta::{Clock, Instant, Mock};

use crate::ticks::{AtomicTicks, Ticks};

// ----------------------------------------------------------------------------
// 5.1 Local Clock
// ----------------------------------------------------------------------------

/// Wall clock in ticks, read through a monotonic `quanta` clock anchored to
/// the system time at construction.
#[derive(Clone)]
pub struct LocalClock {
    clock: Clock,
    anchor: Instant,
    anchor_ticks: Ticks,
}

impl LocalClock {
    /// Local clock anchored to the current system time.
    pub fn system() -> Self {
        Self::anchored(Clock::new(), Ticks::now())
    }

    /// Mocked clock starting at `start`. Advance it through the returned handle.
    pub fn mock(start: Ticks) -> (Self, Arc<Mock>) {
        let (clock, mock) = Clock::mock();
        (Self::anchored(clock, start), mock)
    }

    fn anchored(clock: Clock, anchor_ticks: Ticks) -> Self {
        let anchor = clock.now();
        Self {
            clock,
            anchor,
            anchor_ticks,
        }
    }

    /// Current local time.
    #[inline]
    pub fn now(&self) -> Ticks {
        let elapsed = self.clock.now().duration_since(self.anchor);
        self.anchor_ticks + Ticks::from_duration(elapsed)
    }
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for LocalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalClock")
            .field("anchor_ticks", &self.anchor_ticks)
            .field("now", &self.now())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Real-Time Reference
// ----------------------------------------------------------------------------

/// Snapshot of the settings that shape how the real-time reference moves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockPolicy {
    pub use_local_clock: bool,
    pub reasonability_check: bool,
    /// Seconds
    pub lead_time: f64,
}

/// The concentrator's notion of "now".
///
/// Either the local clock, or the newest accepted sample timestamp kept within
/// `lead_time` of the local clock. A zero value means "not yet set".
#[derive(Debug)]
pub struct RealTimeReference {
    ticks: AtomicTicks,
    clock: LocalClock,
}

impl RealTimeReference {
    pub fn new(clock: LocalClock) -> Self {
        Self {
            ticks: AtomicTicks::new(Ticks::ZERO),
            clock,
        }
    }

    #[inline]
    pub fn clock(&self) -> &LocalClock {
        &self.clock
    }

    /// Current real-time. Snaps the stored reference to the local clock when it
    /// has drifted more than `lead_time` from it.
    pub fn current(&self, policy: &ClockPolicy) -> Ticks {
        if policy.use_local_clock {
            return self.clock.now();
        }

        let stored = self.ticks.load(AtomicOrdering::Acquire);
        if !policy.reasonability_check {
            return stored;
        }

        let local = self.clock.now();
        if stored.is_valid_time(local, policy.lead_time, policy.lead_time) {
            stored
        } else {
            self.ticks.store(local, AtomicOrdering::Release);
            local
        }
    }

    /// Seconds between real-time and `timestamp`; positive for samples in the
    /// past. An unset reference is initialized first.
    pub fn seconds_from(&self, timestamp: Ticks, policy: &ClockPolicy) -> f64 {
        (self.current_or_init(timestamp, policy) - timestamp).as_secs_f64()
    }

    /// Real-time, initializing an unset reference to the local clock, or to the
    /// sample timestamp when reasonability checks are off.
    pub fn current_or_init(&self, timestamp: Ticks, policy: &ClockPolicy) -> Ticks {
        if !policy.use_local_clock && self.ticks.load(AtomicOrdering::Acquire).is_zero() {
            let initial = if policy.reasonability_check {
                self.clock.now()
            } else {
                timestamp
            };
            let _ = self.ticks.compare_exchange(
                Ticks::ZERO,
                initial,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            );
        }
        self.current(policy)
    }

    /// Move the reference forward to an accepted sample timestamp.
    pub fn observe(&self, timestamp: Ticks, policy: &ClockPolicy) {
        if policy.use_local_clock {
            return;
        }

        if !policy.reasonability_check {
            self.ticks.update_if_newer(timestamp);
            return;
        }

        let local = self.clock.now();
        if timestamp.is_valid_time(local, policy.lead_time, policy.lead_time) {
            self.ticks.update_if_newer(timestamp);
        } else if !self
            .ticks
            .load(AtomicOrdering::Acquire)
            .is_valid_time(local, policy.lead_time, policy.lead_time)
        {
            self.ticks.store(local, AtomicOrdering::Release);
        }
    }

    /// Forget the reference so it re-initializes on next use.
    pub fn reset(&self) {
        self.ticks.store(Ticks::ZERO, AtomicOrdering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const START: Ticks = Ticks::from_secs(1_700_000_000);

    fn sample_policy() -> ClockPolicy {
        ClockPolicy {
            use_local_clock: false,
            reasonability_check: true,
            lead_time: 1.0,
        }
    }

    #[test]
    fn test_mock_clock_advances() {
        let (clock, mock) = LocalClock::mock(START);
        assert_eq!(clock.now(), START);
        mock.increment(Duration::from_millis(250));
        assert_eq!(clock.now(), START + Ticks::from_millis(250));
    }

    #[test]
    fn test_system_clock_is_near_wall_time() {
        let clock = LocalClock::system();
        let drift = (clock.now() - Ticks::now()).as_secs_f64().abs();
        assert!(drift < 1.0);
    }

    #[test]
    fn test_local_clock_policy_ignores_samples() {
        let (clock, mock) = LocalClock::mock(START);
        let reference = RealTimeReference::new(clock);
        let policy = ClockPolicy {
            use_local_clock: true,
            ..sample_policy()
        };
        reference.observe(START + Ticks::from_millis(500), &policy);
        mock.increment(Duration::from_millis(10));
        assert_eq!(reference.current(&policy), START + Ticks::from_millis(10));
    }

    #[test]
    fn test_unset_reference_initializes_to_local_clock() {
        let (clock, _mock) = LocalClock::mock(START);
        let reference = RealTimeReference::new(clock);
        let seconds = reference.seconds_from(START - Ticks::from_secs(2), &sample_policy());
        assert!((seconds - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_unset_reference_without_checks_uses_sample() {
        let (clock, _mock) = LocalClock::mock(START);
        let reference = RealTimeReference::new(clock);
        let policy = ClockPolicy {
            reasonability_check: false,
            ..sample_policy()
        };
        let sample = START - Ticks::from_secs(3600);
        assert_eq!(reference.seconds_from(sample, &policy), 0.0);
        assert_eq!(reference.current(&policy), sample);
    }

    #[test]
    fn test_observe_moves_forward_within_lead() {
        let (clock, _mock) = LocalClock::mock(START);
        let reference = RealTimeReference::new(clock);
        let policy = sample_policy();
        reference.current_or_init(START, &policy);

        reference.observe(START + Ticks::from_millis(400), &policy);
        assert_eq!(reference.current(&policy), START + Ticks::from_millis(400));

        // older samples never move it backwards
        reference.observe(START + Ticks::from_millis(100), &policy);
        assert_eq!(reference.current(&policy), START + Ticks::from_millis(400));

        // samples beyond lead are ignored
        reference.observe(START + Ticks::from_secs(5), &policy);
        assert_eq!(reference.current(&policy), START + Ticks::from_millis(400));
    }

    #[test]
    fn test_reference_snaps_to_local_clock_after_drift() {
        let (clock, mock) = LocalClock::mock(START);
        let reference = RealTimeReference::new(clock);
        let policy = sample_policy();
        reference.current_or_init(START, &policy);

        mock.increment(Duration::from_secs(5));
        assert_eq!(reference.current(&policy), START + Ticks::from_secs(5));
    }

    #[test]
    fn test_reset_clears_reference() {
        let (clock, mock) = LocalClock::mock(START);
        let reference = RealTimeReference::new(clock);
        let policy = sample_policy();
        reference.current_or_init(START, &policy);
        reference.reset();
        mock.increment(Duration::from_millis(300));
        assert_eq!(
            reference.current_or_init(START, &policy),
            START + Ticks::from_millis(300)
        );
    }
}
