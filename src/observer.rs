//! Notifications raised by a running concentrator.

// ============================================================================
// SECTION 10: OBSERVERS
// ============================================================================

use crossbeam::channel::{Receiver, Sender, TrySendError};
use tracing::warn;

use crate::error::ConcentratorError;
use crate::measurement::Measurement;

/// Receives concentrator notifications. Every method defaults to a no-op.
///
/// Callbacks run on the thread that raised them (producers for discards, the
/// scheduler for exceptions, the monitor for backlog) and should return quickly.
pub trait ConcentratorObserver: Send + Sync + 'static {
    /// Seconds of data still waiting in the frame queue.
    fn unpublished_samples(&self, _seconds: u64) {}

    /// A publish hook failed or panicked.
    fn process_exception(&self, _error: &ConcentratorError) {}

    /// Samples dropped by one `sort_measurements` call.
    fn discarding_measurements(&self, _measurements: &[Measurement]) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConcentratorObserver for NoopObserver {}

/// Owned form of a notification.
#[derive(Debug)]
pub enum ConcentratorEvent {
    UnpublishedSamples(u64),
    ProcessException(String),
    DiscardingMeasurements(Vec<Measurement>),
}

/// Forwards notifications over a crossbeam channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: Sender<ConcentratorEvent>,
}

impl ChannelObserver {
    /// Bounded channel; events are dropped with a warning when it is full.
    pub fn bounded(capacity: usize) -> (Self, Receiver<ConcentratorEvent>) {
        let (sender, receiver) = crossbeam::channel::bounded(capacity);
        (Self { sender }, receiver)
    }

    pub fn unbounded() -> (Self, Receiver<ConcentratorEvent>) {
        let (sender, receiver) = crossbeam::channel::unbounded();
        (Self { sender }, receiver)
    }

    fn send(&self, event: ConcentratorEvent) {
        if let Err(TrySendError::Full(event)) = self.sender.try_send(event) {
            warn!(target: "concentrator::engine", ?event, "Observer channel full, dropping event");
        }
    }
}

impl ConcentratorObserver for ChannelObserver {
    fn unpublished_samples(&self, seconds: u64) {
        self.send(ConcentratorEvent::UnpublishedSamples(seconds));
    }

    fn process_exception(&self, error: &ConcentratorError) {
        self.send(ConcentratorEvent::ProcessException(error.to_string()));
    }

    fn discarding_measurements(&self, measurements: &[Measurement]) {
        self.send(ConcentratorEvent::DiscardingMeasurements(measurements.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishError;
    use crate::measurement::MeasurementKey;
    use crate::ticks::Ticks;

    #[test]
    fn test_channel_observer_forwards_events() {
        let (observer, events) = ChannelObserver::unbounded();
        observer.unpublished_samples(3);
        observer.process_exception(&PublishError::failed(Ticks::ZERO, "sink down").into());
        observer.discarding_measurements(&[Measurement::new(MeasurementKey::new(1, "A"), 0.0, Ticks::ZERO)]);

        assert!(matches!(events.try_recv(), Ok(ConcentratorEvent::UnpublishedSamples(3))));
        match events.try_recv() {
            Ok(ConcentratorEvent::ProcessException(message)) => assert!(message.contains("sink down")),
            other => panic!("unexpected event {other:?}"),
        }
        match events.try_recv() {
            Ok(ConcentratorEvent::DiscardingMeasurements(batch)) => assert_eq!(batch.len(), 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_full_channel_drops_events() {
        let (observer, events) = ChannelObserver::bounded(1);
        observer.unpublished_samples(1);
        observer.unpublished_samples(2);
        assert_eq!(events.len(), 1);
    }
}
