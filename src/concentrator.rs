//! The frame-synchronization engine.
//!
//! Producers hand samples to [`Concentrator::sort_measurements`]; each sample
//! is checked against the real-time reference, bucketed into the frame for its
//! aligned timestamp and, once that frame is older than the lag time, handed to
//! the [`FrameHandler`] exactly once and in timestamp order.

// ============================================================================
// SECTION 13: CONCENTRATOR ENGINE
// ============================================================================

use std::any::Any;
use std::fmt::{self, Write as _};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, error, info, trace, warn};

use crate::clock::{ClockPolicy, LocalClock, RealTimeReference};
use crate::config::{validate_tolerance, ConcentratorConfig};
use crate::error::{ConcentratorError, ConcentratorResult, ConfigError, ConfigResult, PublishError};
use crate::frame::Frame;
use crate::frame_queue::FrameQueue;
use crate::immediate::ImmediateMeasurements;
use crate::measurement::Measurement;
use crate::observer::{ConcentratorObserver, NoopObserver};
use crate::scheduler::{FrameRateTimer, PeriodicWorker};
use crate::stats::{AtomicF64, ConcentratorStats, StatsSnapshot};
use crate::ticks::{AtomicTicks, FrameRate, Ticks};

// ----------------------------------------------------------------------------
// 13.1 Frame Handler
// ----------------------------------------------------------------------------

/// Customization points of a concentrator.
///
/// Only [`FrameHandler::publish_frame`] is required. It runs on the
/// publication thread, so it should hand the frame off rather than block.
pub trait FrameHandler: Send + Sync + 'static {
    /// Build the frame for a newly seen bucket.
    fn create_new_frame(&self, timestamp: Ticks) -> Frame {
        Frame::new(timestamp)
    }

    /// Store a sample in its frame. Returns false when the frame no longer
    /// accepts samples. Overrides should still go through
    /// [`Frame::try_assign`] so the published check holds.
    fn assign_measurement_to_frame(&self, frame: &Frame, measurement: Measurement) -> bool {
        frame.try_assign(measurement)
    }

    /// Deliver a completed frame. `index` is the frame's position within its
    /// second (`0..frames_per_second`).
    fn publish_frame(&self, frame: &Frame, index: usize) -> Result<(), PublishError>;
}

impl<F> FrameHandler for F
where
    F: Fn(&Frame, usize) -> Result<(), PublishError> + Send + Sync + 'static,
{
    fn publish_frame(&self, frame: &Frame, index: usize) -> Result<(), PublishError> {
        self(frame, index)
    }
}

// ----------------------------------------------------------------------------
// 13.2 Runtime Settings
// ----------------------------------------------------------------------------

/// Settings read on the hot path; every field can change while running.
#[derive(Debug)]
struct Settings {
    lag_time: AtomicF64,
    lead_time: AtomicF64,
    lag_ticks: AtomicTicks,
    lead_ticks: AtomicTicks,
    allow_sorts_by_arrival: AtomicBool,
    use_local_clock: AtomicBool,
    track_latest_measurements: AtomicBool,
    ignore_bad_timestamps: AtomicBool,
    reasonability_check: AtomicBool,
    expected_measurements: AtomicUsize,
    allow_preemptive_publishing: AtomicBool,
    use_precision_timer: AtomicBool,
    monitor_interval: AtomicCell<Duration>,
}

impl Settings {
    fn from_config(config: &ConcentratorConfig) -> Self {
        Self {
            lag_time: AtomicF64::new(config.lag_time),
            lead_time: AtomicF64::new(config.lead_time),
            lag_ticks: AtomicTicks::new(Ticks::from_secs_f64(config.lag_time)),
            lead_ticks: AtomicTicks::new(Ticks::from_secs_f64(config.lead_time)),
            allow_sorts_by_arrival: AtomicBool::new(config.allow_sorts_by_arrival),
            use_local_clock: AtomicBool::new(config.use_local_clock_as_real_time),
            track_latest_measurements: AtomicBool::new(config.track_latest_measurements),
            ignore_bad_timestamps: AtomicBool::new(config.ignore_bad_timestamps),
            reasonability_check: AtomicBool::new(config.perform_timestamp_reasonability_check),
            expected_measurements: AtomicUsize::new(config.expected_measurements),
            allow_preemptive_publishing: AtomicBool::new(config.allow_preemptive_publishing),
            use_precision_timer: AtomicBool::new(config.use_precision_timer),
            monitor_interval: AtomicCell::new(config.monitor_interval),
        }
    }

    #[inline]
    fn flag(flag: &AtomicBool) -> bool {
        flag.load(AtomicOrdering::Relaxed)
    }

    fn clock_policy(&self) -> ClockPolicy {
        ClockPolicy {
            use_local_clock: Self::flag(&self.use_local_clock),
            reasonability_check: Self::flag(&self.reasonability_check),
            lead_time: self.lead_time.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct Workers {
    publisher: Option<PeriodicWorker>,
    monitor: Option<PeriodicWorker>,
}

struct Shared<H> {
    handler: H,
    observer: Arc<dyn ConcentratorObserver>,
    settings: Settings,
    queue: FrameQueue,
    real_time: RealTimeReference,
    stats: ConcentratorStats,
    latest: ImmediateMeasurements,
    enabled: AtomicBool,
    /// Serializes publication passes.
    publication: Mutex<()>,
    workers: Mutex<Workers>,
    start_time: AtomicTicks,
    stop_time: AtomicTicks,
}

// ----------------------------------------------------------------------------
// 13.3 Concentrator
// ----------------------------------------------------------------------------

/// Sorts samples into frames and publishes them on schedule.
pub struct Concentrator<H: FrameHandler> {
    shared: Arc<Shared<H>>,
}

/// Builder for a [`Concentrator`] with a custom clock or observer.
pub struct ConcentratorBuilder<H: FrameHandler> {
    config: ConcentratorConfig,
    handler: H,
    clock: Option<LocalClock>,
    observer: Arc<dyn ConcentratorObserver>,
}

impl<H: FrameHandler> ConcentratorBuilder<H> {
    pub fn with_clock(mut self, clock: LocalClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_observer(mut self, observer: impl ConcentratorObserver) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn with_shared_observer(mut self, observer: Arc<dyn ConcentratorObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> ConfigResult<Concentrator<H>> {
        self.config.validate()?;
        let frame_rate = self.config.frame_rate()?;

        let shared = Shared {
            handler: self.handler,
            observer: self.observer,
            settings: Settings::from_config(&self.config),
            queue: FrameQueue::new(frame_rate),
            real_time: RealTimeReference::new(self.clock.unwrap_or_default()),
            stats: ConcentratorStats::new(),
            latest: ImmediateMeasurements::new(self.config.lag_time, self.config.lead_time),
            enabled: AtomicBool::new(false),
            publication: Mutex::new(()),
            workers: Mutex::new(Workers::default()),
            start_time: AtomicTicks::new(Ticks::ZERO),
            stop_time: AtomicTicks::new(Ticks::ZERO),
        };

        debug!(
            target: "concentrator::engine",
            frame_rate = %frame_rate,
            lag_time = self.config.lag_time,
            lead_time = self.config.lead_time,
            "Concentrator created"
        );

        Ok(Concentrator {
            shared: Arc::new(shared),
        })
    }
}

impl<H: FrameHandler> Concentrator<H> {
    /// Concentrator on the system clock with no observer.
    pub fn new(config: &ConcentratorConfig, handler: H) -> ConfigResult<Self> {
        Self::builder(config.clone(), handler).build()
    }

    pub fn builder(config: ConcentratorConfig, handler: H) -> ConcentratorBuilder<H> {
        ConcentratorBuilder {
            config,
            handler,
            clock: None,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    // ---- Lifecycle ----

    /// Reset statistics, clear the queue and arm the publication and monitor
    /// threads. Does nothing when already running.
    pub fn start(&self) -> ConcentratorResult<()> {
        let shared = &self.shared;
        let mut workers = shared.workers.lock();
        if shared.enabled.load(AtomicOrdering::Acquire) {
            return Ok(());
        }

        shared.stats.reset();
        shared.queue.open();
        shared.real_time.reset();
        shared
            .start_time
            .store(shared.real_time.clock().now(), AtomicOrdering::Release);
        shared.stop_time.store(Ticks::ZERO, AtomicOrdering::Release);
        shared.enabled.store(true, AtomicOrdering::Release);

        if let Err(e) = self.spawn_workers(&mut workers) {
            shared.enabled.store(false, AtomicOrdering::Release);
            workers.publisher.take();
            workers.monitor.take();
            error!(target: "concentrator::engine", error = %e, "Failed to start worker threads");
            return Err(ConcentratorError::Io(e));
        }

        info!(
            target: "concentrator::engine",
            frame_rate = %shared.queue.frame_rate(),
            precision_timer = workers.publisher.is_some(),
            "Concentrator started"
        );
        Ok(())
    }

    fn spawn_workers(&self, workers: &mut Workers) -> std::io::Result<()> {
        let shared = &self.shared;

        if Settings::flag(&shared.settings.use_precision_timer) {
            let schedule_from = Arc::downgrade(shared);
            let tick_from = Arc::downgrade(shared);
            let mut timer = FrameRateTimer::new(shared.queue.frame_rate());
            workers.publisher = Some(PeriodicWorker::spawn(
                "concentrator-publisher",
                move || {
                    let rate = schedule_from
                        .upgrade()
                        .map_or(timer.frame_rate(), |s| s.queue.frame_rate());
                    timer.next_period(rate)
                },
                move || {
                    if let Some(shared) = tick_from.upgrade() {
                        shared.publish_ready_frames();
                    }
                },
            )?);
        }

        let schedule_from: Weak<Shared<H>> = Arc::downgrade(shared);
        let tick_from = Arc::downgrade(shared);
        let fallback = shared.settings.monitor_interval.load();
        workers.monitor = Some(PeriodicWorker::spawn(
            "concentrator-monitor",
            move || {
                schedule_from
                    .upgrade()
                    .map_or(fallback, |s| s.settings.monitor_interval.load())
            },
            move || {
                if let Some(shared) = tick_from.upgrade() {
                    shared.report_backlog();
                }
            },
        )?);
        Ok(())
    }

    /// Disarm the worker threads and clear the queue. Safe to call while
    /// producers are sorting: batches in flight stop at their next sample and
    /// no frame is created once the queue is closed.
    pub fn stop(&self) {
        let shared = &self.shared;
        let (publisher, monitor) = {
            let mut workers = shared.workers.lock();
            if !shared.enabled.swap(false, AtomicOrdering::AcqRel) {
                return;
            }
            (workers.publisher.take(), workers.monitor.take())
        };

        if let Some(worker) = publisher {
            worker.stop();
        }
        if let Some(worker) = monitor {
            worker.stop();
        }

        shared.queue.close();
        shared
            .stop_time
            .store(shared.real_time.clock().now(), AtomicOrdering::Release);

        info!(
            target: "concentrator::engine",
            published_frames = shared.stats.published_frames.get(),
            discarded = shared.stats.discarded_measurements.get(),
            "Concentrator stopped"
        );
    }

    pub fn set_enabled(&self, enabled: bool) -> ConcentratorResult<()> {
        if enabled {
            self.start()
        } else {
            self.stop();
            Ok(())
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(AtomicOrdering::Acquire)
    }

    // ---- Ingestion ----

    pub fn sort_measurement(&self, measurement: Measurement) -> usize {
        self.sort_measurements(std::iter::once(measurement))
    }

    /// Sort a batch of samples into frames. Returns how many were accepted.
    pub fn sort_measurements<I>(&self, measurements: I) -> usize
    where
        I: IntoIterator<Item = Measurement>,
    {
        self.shared.sort_measurements(measurements)
    }

    /// Publish every frame that is due. Called by the publication thread, or
    /// by the host when `use_precision_timer` is off.
    pub fn publish_ready_frames(&self) -> usize {
        self.shared.publish_ready_frames()
    }

    // ---- Settings ----

    pub fn frames_per_second(&self) -> u32 {
        self.shared.queue.frame_rate().frames_per_second()
    }

    pub fn frame_rate(&self) -> FrameRate {
        self.shared.queue.frame_rate()
    }

    pub fn set_frames_per_second(&self, frames_per_second: u32) -> ConfigResult<()> {
        let rate = FrameRate::new(frames_per_second)?;
        self.shared.queue.set_frame_rate(rate);
        Ok(())
    }

    pub fn lag_time(&self) -> f64 {
        self.shared.settings.lag_time.load(AtomicOrdering::Relaxed)
    }

    pub fn set_lag_time(&self, seconds: f64) -> ConfigResult<()> {
        validate_tolerance("lag_time", seconds)?;
        let settings = &self.shared.settings;
        settings.lag_time.store(seconds, AtomicOrdering::Relaxed);
        settings
            .lag_ticks
            .store(Ticks::from_secs_f64(seconds), AtomicOrdering::Relaxed);
        self.shared.latest.set_lag_time(seconds);
        Ok(())
    }

    pub fn lead_time(&self) -> f64 {
        self.shared.settings.lead_time.load(AtomicOrdering::Relaxed)
    }

    pub fn set_lead_time(&self, seconds: f64) -> ConfigResult<()> {
        validate_tolerance("lead_time", seconds)?;
        let settings = &self.shared.settings;
        settings.lead_time.store(seconds, AtomicOrdering::Relaxed);
        settings
            .lead_ticks
            .store(Ticks::from_secs_f64(seconds), AtomicOrdering::Relaxed);
        self.shared.latest.set_lead_time(seconds);
        Ok(())
    }

    pub fn allow_sorts_by_arrival(&self) -> bool {
        Settings::flag(&self.shared.settings.allow_sorts_by_arrival)
    }

    pub fn set_allow_sorts_by_arrival(&self, allow: bool) {
        self.shared
            .settings
            .allow_sorts_by_arrival
            .store(allow, AtomicOrdering::Relaxed);
    }

    pub fn use_local_clock_as_real_time(&self) -> bool {
        Settings::flag(&self.shared.settings.use_local_clock)
    }

    pub fn set_use_local_clock_as_real_time(&self, use_local_clock: bool) {
        self.shared
            .settings
            .use_local_clock
            .store(use_local_clock, AtomicOrdering::Relaxed);
    }

    pub fn track_latest_measurements(&self) -> bool {
        Settings::flag(&self.shared.settings.track_latest_measurements)
    }

    pub fn set_track_latest_measurements(&self, track: bool) {
        self.shared
            .settings
            .track_latest_measurements
            .store(track, AtomicOrdering::Relaxed);
    }

    pub fn ignore_bad_timestamps(&self) -> bool {
        Settings::flag(&self.shared.settings.ignore_bad_timestamps)
    }

    pub fn set_ignore_bad_timestamps(&self, ignore: bool) {
        self.shared
            .settings
            .ignore_bad_timestamps
            .store(ignore, AtomicOrdering::Relaxed);
    }

    pub fn perform_timestamp_reasonability_check(&self) -> bool {
        Settings::flag(&self.shared.settings.reasonability_check)
    }

    pub fn set_perform_timestamp_reasonability_check(&self, check: bool) {
        self.shared
            .settings
            .reasonability_check
            .store(check, AtomicOrdering::Relaxed);
    }

    pub fn expected_measurements(&self) -> usize {
        self.shared
            .settings
            .expected_measurements
            .load(AtomicOrdering::Relaxed)
    }

    pub fn set_expected_measurements(&self, expected: usize) {
        self.shared
            .settings
            .expected_measurements
            .store(expected, AtomicOrdering::Relaxed);
    }

    pub fn allow_preemptive_publishing(&self) -> bool {
        Settings::flag(&self.shared.settings.allow_preemptive_publishing)
    }

    pub fn set_allow_preemptive_publishing(&self, allow: bool) {
        self.shared
            .settings
            .allow_preemptive_publishing
            .store(allow, AtomicOrdering::Relaxed);
    }

    pub fn use_precision_timer(&self) -> bool {
        Settings::flag(&self.shared.settings.use_precision_timer)
    }

    /// Takes effect on the next start.
    pub fn set_use_precision_timer(&self, enabled: bool) {
        self.shared
            .settings
            .use_precision_timer
            .store(enabled, AtomicOrdering::Relaxed);
    }

    pub fn monitor_interval(&self) -> Duration {
        self.shared.settings.monitor_interval.load()
    }

    pub fn set_monitor_interval(&self, interval: Duration) -> ConfigResult<()> {
        if interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "monitor_interval",
                "must be greater than zero",
            ));
        }
        self.shared.settings.monitor_interval.store(interval);
        Ok(())
    }

    // ---- Status ----

    /// Current real-time reference.
    pub fn real_time(&self) -> Ticks {
        let shared = &self.shared;
        shared.real_time.current(&shared.settings.clock_policy())
    }

    pub fn seconds_from_real_time(&self, timestamp: Ticks) -> f64 {
        let shared = &self.shared;
        shared
            .real_time
            .seconds_from(timestamp, &shared.settings.clock_policy())
    }

    pub fn milliseconds_from_real_time(&self, timestamp: Ticks) -> f64 {
        self.seconds_from_real_time(timestamp) * 1000.0
    }

    pub fn latest_measurements(&self) -> &ImmediateMeasurements {
        &self.shared.latest
    }

    /// Most recently published frame.
    pub fn last_frame(&self) -> Option<Arc<Frame>> {
        self.shared.queue.last()
    }

    pub fn queued_frames(&self) -> usize {
        self.shared.queue.count()
    }

    pub fn queue_state(&self) -> String {
        self.shared.queue.examine_state(self.expected_measurements())
    }

    pub fn start_time(&self) -> Option<Ticks> {
        let start = self.shared.start_time.load(AtomicOrdering::Acquire);
        (!start.is_zero()).then_some(start)
    }

    pub fn stop_time(&self) -> Option<Ticks> {
        let stop = self.shared.stop_time.load(AtomicOrdering::Acquire);
        (!stop.is_zero()).then_some(stop)
    }

    /// Seconds since start, or the length of the last run when stopped.
    pub fn run_time(&self) -> f64 {
        let Some(start) = self.start_time() else {
            return 0.0;
        };
        let end = if self.is_enabled() {
            self.shared.real_time.clock().now()
        } else {
            self.stop_time().unwrap_or(start)
        };
        (end - start).as_secs_f64().max(0.0)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared
            .stats
            .snapshot(self.shared.queue.count(), self.run_time())
    }

    pub fn reset_statistics(&self) {
        self.shared.stats.reset();
    }

    /// Multi-line human readable report.
    pub fn status(&self) -> String {
        let mut out = String::with_capacity(1024);
        let enabled = self.is_enabled();

        let _ = writeln!(out, "Concentrator status:");
        let _ = writeln!(out, "     Frames per second: {}", self.frames_per_second());
        let _ = writeln!(out, "              Lag time: {:.3} seconds", self.lag_time());
        let _ = writeln!(out, "             Lead time: {:.3} seconds", self.lead_time());
        let _ = writeln!(
            out,
            "  Local clock real-time: {}",
            self.use_local_clock_as_real_time()
        );
        let _ = writeln!(
            out,
            "  Reasonability checks: {}",
            self.perform_timestamp_reasonability_check()
        );
        let _ = writeln!(out, "   Sorts by arrival: {}", self.allow_sorts_by_arrival());
        let _ = writeln!(out, "     Precision timer: {}", self.use_precision_timer());
        match self.expected_measurements() {
            0 => {
                let _ = writeln!(out, "  Expected measurements: not defined");
            }
            expected => {
                let _ = writeln!(
                    out,
                    "  Expected measurements: {} (preemptive publishing {})",
                    expected,
                    if self.allow_preemptive_publishing() { "allowed" } else { "disabled" }
                );
            }
        }
        let _ = writeln!(out, "               Enabled: {enabled}");
        if let Some(start) = self.start_time() {
            let _ = writeln!(out, "            Start time: {start}");
        }
        if let (false, Some(stop)) = (enabled, self.stop_time()) {
            let _ = writeln!(out, "             Stop time: {stop}");
        }
        let _ = writeln!(out, "             Real-time: {}", self.real_time());
        if let Some(frame) = self.last_frame() {
            let _ = writeln!(
                out,
                "  Last published frame: {} ({} measurements)",
                frame.timestamp(),
                frame.sorted_measurements()
            );
        }
        if self.track_latest_measurements() {
            let _ = writeln!(out, "  Latest measurements: {}", self.shared.latest.len());
        }

        self.stats().write_report(&mut out);
        out
    }
}

impl<H: FrameHandler> Drop for Concentrator<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<H: FrameHandler> fmt::Debug for Concentrator<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Concentrator")
            .field("enabled", &self.is_enabled())
            .field("frame_rate", &self.frame_rate())
            .field("lag_time", &self.lag_time())
            .field("lead_time", &self.lead_time())
            .field("queued_frames", &self.queued_frames())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// 13.4 Sorting
// ----------------------------------------------------------------------------

impl<H: FrameHandler> Shared<H> {
    fn sort_measurements<I>(&self, measurements: I) -> usize
    where
        I: IntoIterator<Item = Measurement>,
    {
        if !self.enabled.load(AtomicOrdering::Acquire) {
            return 0;
        }

        let settings = &self.settings;
        let policy = settings.clock_policy();
        let lag_ticks = settings.lag_ticks.load(AtomicOrdering::Relaxed);
        let lead_ticks = settings.lead_ticks.load(AtomicOrdering::Relaxed);
        let ignore_bad_timestamps = Settings::flag(&settings.ignore_bad_timestamps);
        let allow_sorts_by_arrival = Settings::flag(&settings.allow_sorts_by_arrival);
        let track_latest = Settings::flag(&settings.track_latest_measurements);

        let mut discarded: SmallVec<[Measurement; 8]> = SmallVec::new();
        let mut last_frame: Option<Arc<Frame>> = None;
        let mut accepted = 0;

        for mut measurement in measurements {
            if !self.enabled.load(AtomicOrdering::Acquire) {
                break;
            }
            self.stats.received_measurements.inc();

            if !measurement.timestamp_quality_is_good && !ignore_bad_timestamps {
                if allow_sorts_by_arrival {
                    let arrival = self
                        .real_time
                        .current_or_init(self.real_time.clock().now(), &policy);
                    measurement.set_timestamp(arrival);
                    self.stats.measurements_sorted_by_arrival.inc();
                } else {
                    self.discard(measurement, &policy, &mut discarded);
                    continue;
                }
            }

            let timestamp = measurement.timestamp;
            let age = self.real_time.current_or_init(timestamp, &policy) - timestamp;
            if age > lag_ticks || (policy.reasonability_check && age < Ticks::ZERO - lead_ticks) {
                self.discard(measurement, &policy, &mut discarded);
                continue;
            }

            let reuse = last_frame
                .as_ref()
                .filter(|frame| self.queue.frame_rate().align(timestamp) == frame.timestamp())
                .cloned();
            let frame = match reuse.or_else(|| {
                self.queue
                    .get_frame(timestamp, |aligned| self.handler.create_new_frame(aligned))
            }) {
                Some(frame) => frame,
                None if self.queue.is_closed() => break,
                None => {
                    self.stats.missed_sorts_by_timeout.inc();
                    self.discard(measurement, &policy, &mut discarded);
                    continue;
                }
            };

            // Latest values follow every sample that reached a frame, even
            // one that has just been published.
            if track_latest {
                self.latest.update(&measurement);
            }

            if self
                .handler
                .assign_measurement_to_frame(&frame, measurement.clone())
            {
                self.stats.processed_measurements.inc();
                self.real_time.observe(timestamp, &policy);
                accepted += 1;
                last_frame = Some(frame);
            } else {
                self.stats.missed_sorts_by_timeout.inc();
                self.discard(measurement, &policy, &mut discarded);
                last_frame = None;
            }
        }

        if !discarded.is_empty() {
            debug!(
                target: "concentrator::sort",
                count = discarded.len(),
                accepted,
                "Discarding measurements"
            );
            self.notify("discarding_measurements", |observer| {
                observer.discarding_measurements(&discarded)
            });
        }
        accepted
    }

    fn discard(
        &self,
        measurement: Measurement,
        policy: &ClockPolicy,
        discarded: &mut SmallVec<[Measurement; 8]>,
    ) {
        let real_time = self.real_time.current(policy);
        trace!(
            target: "concentrator::sort",
            key = %measurement.key,
            timestamp = %measurement.timestamp,
            "Discarded measurement"
        );
        self.stats.record_discard(&measurement, real_time);
        discarded.push(measurement);
    }

    // ------------------------------------------------------------------------
    // 13.5 Publication
    // ------------------------------------------------------------------------

    fn publish_ready_frames(&self) -> usize {
        if !self.enabled.load(AtomicOrdering::Acquire) {
            return 0;
        }
        let _pass = self.publication.lock();
        let mut published = 0;

        while let Some(frame) = self.queue.head() {
            let policy = self.settings.clock_policy();
            let lag_ticks = self.settings.lag_ticks.load(AtomicOrdering::Relaxed);
            let real_time = self.real_time.current(&policy);
            let remaining = lag_ticks - (real_time - frame.timestamp());

            let mut ahead_of_schedule = false;
            if remaining > Ticks::ZERO {
                let expected = self.settings.expected_measurements.load(AtomicOrdering::Relaxed);
                if expected >= 1
                    && Settings::flag(&self.settings.allow_preemptive_publishing)
                    && frame.sorted_measurements() >= expected
                {
                    ahead_of_schedule = true;
                } else {
                    break;
                }
            }

            // An earlier bucket was inserted since the head was read.
            if !self.queue.claim(&frame) {
                continue;
            }
            if ahead_of_schedule {
                self.stats.frames_ahead_of_schedule.inc();
            }

            self.publish(&frame);
            published += 1;
        }

        published
    }

    fn publish(&self, frame: &Arc<Frame>) {
        let timestamp = frame.timestamp();
        let index = self.queue.frame_rate().frame_index(timestamp);
        frame.mark_published();

        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.handler.publish_frame(frame, index)
        }));
        let elapsed = started.elapsed();

        if !self.queue.pop_frame(frame) {
            warn!(target: "concentrator::publish", frame = %timestamp, "Published frame was no longer at the queue head");
        }

        let measurements = frame.sorted_measurements();
        self.stats.published_frames.inc();
        self.stats.published_measurements.add(measurements as u64);
        self.stats
            .total_publish_time
            .add(Ticks::from_duration(elapsed).value() as u64);

        let failure = match outcome {
            Ok(Ok(())) => {
                trace!(
                    target: "concentrator::publish",
                    frame = %timestamp,
                    index,
                    measurements,
                    "Published frame"
                );
                return;
            }
            Ok(Err(e)) => e,
            Err(payload) => PublishError::Panicked {
                timestamp,
                message: panic_message(payload.as_ref()),
            },
        };
        self.process_exception(failure.into());
    }

    fn process_exception(&self, error: ConcentratorError) {
        error!(target: "concentrator::publish", category = error.category(), "{}", error);
        self.notify("process_exception", |observer| observer.process_exception(&error));
    }

    /// Run an observer callback; a panicking observer must not take the
    /// calling worker thread down with it.
    fn notify(&self, callback: &'static str, f: impl FnOnce(&dyn ConcentratorObserver)) {
        let observer = self.observer.as_ref();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(observer))) {
            error!(
                target: "concentrator::engine",
                callback,
                panic = %panic_message(payload.as_ref()),
                "Observer panicked"
            );
        }
    }

    // ------------------------------------------------------------------------
    // 13.6 Monitoring
    // ------------------------------------------------------------------------

    fn report_backlog(&self) {
        let frames_per_second = self.queue.frame_rate().frames_per_second() as usize;
        let seconds = (self.queue.count() / frames_per_second).saturating_sub(1) as u64;
        if seconds > 0 {
            debug!(target: "concentrator::monitor", seconds, queued = self.queue.count(), "Unpublished samples");
        }
        self.notify("unpublished_samples", |observer| observer.unpublished_samples(seconds));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
