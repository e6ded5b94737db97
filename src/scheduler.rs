//! Publication timing: per-frame wait periods and periodic worker threads.

// ============================================================================
// SECTION 11: SCHEDULING
// ============================================================================

use std::io;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::ticks::FrameRate;

/// How far behind schedule a worker may fall before it stops catching up and
/// restarts its cadence from the current time.
const MAX_SCHEDULE_LAG: Duration = Duration::from_secs(1);

// ----------------------------------------------------------------------------
// 11.1 Wait Periods
// ----------------------------------------------------------------------------

/// Millisecond wait before each frame of a second, summing to exactly 1000.
///
/// Every frame gets `round(1000 / F)` ms; the rounding deficit is spread as
/// evenly as possible by adding (or removing) one millisecond on `|deficit|`
/// frames.
pub fn wait_periods(frame_rate: FrameRate) -> Vec<u32> {
    let frames = i64::from(frame_rate.frames_per_second());
    let base = (2000 + frames) / (2 * frames);
    let deficit = 1000 - base * frames;
    let step = deficit.signum();
    let spread = deficit.abs();

    (0..frames)
        .map(|i| {
            let adjust = if (i + 1) * spread / frames - i * spread / frames == 1 {
                step
            } else {
                0
            };
            (base + adjust) as u32
        })
        .collect()
}

// ----------------------------------------------------------------------------
// 11.2 Frame Rate Timer
// ----------------------------------------------------------------------------

/// Cycles through the wait periods of a frame rate.
#[derive(Debug, Clone)]
pub struct FrameRateTimer {
    frame_rate: FrameRate,
    periods: Vec<u32>,
    cursor: usize,
}

impl FrameRateTimer {
    pub fn new(frame_rate: FrameRate) -> Self {
        Self {
            frame_rate,
            periods: wait_periods(frame_rate),
            cursor: 0,
        }
    }

    pub fn frame_rate(&self) -> FrameRate {
        self.frame_rate
    }

    pub fn periods(&self) -> &[u32] {
        &self.periods
    }

    /// Next wait, rebuilding the period table first if the rate changed.
    pub fn next_period(&mut self, frame_rate: FrameRate) -> Duration {
        if frame_rate != self.frame_rate {
            debug!(target: "concentrator::publish", from = %self.frame_rate, to = %frame_rate, "Frame rate changed");
            *self = Self::new(frame_rate);
        }
        let period = self.periods[self.cursor];
        self.cursor = (self.cursor + 1) % self.periods.len();
        Duration::from_millis(u64::from(period))
    }
}

// ----------------------------------------------------------------------------
// 11.3 Periodic Worker
// ----------------------------------------------------------------------------

/// A named thread that runs `tick` on absolute deadlines until stopped.
#[derive(Debug)]
pub struct PeriodicWorker {
    name: String,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl PeriodicWorker {
    /// Spawn a worker. `schedule` yields the wait before each tick.
    pub fn spawn<S, T>(name: impl Into<String>, mut schedule: S, mut tick: T) -> io::Result<Self>
    where
        S: FnMut() -> Duration + Send + 'static,
        T: FnMut() + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let thread_name = name.clone();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            debug!(target: "concentrator::engine", worker = %thread_name, "Worker started");
            let mut deadline = Instant::now() + schedule();
            loop {
                let wait = deadline.saturating_duration_since(Instant::now());
                match stop_rx.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                tick();

                deadline += schedule();
                let now = Instant::now();
                if now.saturating_duration_since(deadline) > MAX_SCHEDULE_LAG {
                    warn!(
                        target: "concentrator::engine",
                        worker = %thread_name,
                        behind_ms = now.saturating_duration_since(deadline).as_millis() as u64,
                        "Worker fell behind schedule, resynchronizing"
                    );
                    deadline = now + schedule();
                }
            }
            debug!(target: "concentrator::engine", worker = %thread_name, "Worker stopped");
        })?;

        let thread_id = handle.thread().id();
        Ok(Self {
            name,
            stop: Some(stop_tx),
            handle: Some(handle),
            thread_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the worker to exit and wait for it, unless called from the
    /// worker itself, in which case it exits after the current tick.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if thread::current().id() == self.thread_id {
                return;
            }
            if handle.join().is_err() {
                warn!(target: "concentrator::engine", worker = %self.name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for PeriodicWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use test_case::test_case;

    #[test]
    fn test_wait_periods_sum_to_one_second_for_every_rate() {
        for fps in FrameRate::MIN..=FrameRate::MAX {
            let periods = wait_periods(FrameRate::new(fps).unwrap());
            assert_eq!(periods.len(), fps as usize);
            assert_eq!(periods.iter().sum::<u32>(), 1000, "fps {fps}");
            assert!(periods.iter().all(|p| *p >= 1), "fps {fps}");
        }
    }

    #[test_case(1, &[1000] ; "one per second")]
    #[test_case(4, &[250, 250, 250, 250] ; "exact division")]
    #[test_case(3, &[333, 333, 334] ; "deficit on last frame")]
    #[test_case(6, &[167, 167, 166, 167, 167, 166] ; "negative deficit spread")]
    fn test_wait_periods_table(fps: u32, expected: &[u32]) {
        assert_eq!(wait_periods(FrameRate::new(fps).unwrap()), expected);
    }

    #[test]
    fn test_timer_cycles_and_rebuilds() {
        let three = FrameRate::new(3).unwrap();
        let mut timer = FrameRateTimer::new(three);
        let waits: Vec<u128> = (0..4).map(|_| timer.next_period(three).as_millis()).collect();
        assert_eq!(waits, vec![333, 333, 334, 333]);

        let two = FrameRate::new(2).unwrap();
        assert_eq!(timer.next_period(two), Duration::from_millis(500));
        assert_eq!(timer.frame_rate(), two);
        assert_eq!(timer.periods(), &[500, 500]);
    }

    #[test]
    fn test_periodic_worker_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let worker = PeriodicWorker::spawn(
            "test-worker",
            || Duration::from_millis(2),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        let started = Instant::now();
        while ticks.load(Ordering::SeqCst) < 3 && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(worker.name(), "test-worker");
        worker.stop();

        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 3);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    proptest! {
        #[test]
        fn prop_wait_periods_evenly_spread(fps in 1u32..=1000) {
            let periods = wait_periods(FrameRate::new(fps).unwrap());
            let min = *periods.iter().min().unwrap();
            let max = *periods.iter().max().unwrap();
            prop_assert!(max - min <= 1);

            // any rotation of the cycle still covers one second
            let full_cycle: u32 = periods.iter().cycle().take(fps as usize * 2).skip(fps as usize / 2).take(fps as usize).sum();
            prop_assert_eq!(full_cycle, 1000);
        }
    }
}
