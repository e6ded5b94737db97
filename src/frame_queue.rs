//! Ordered queue of unpublished frames with direct timestamp lookup.

// ============================================================================
// SECTION 8: FRAME QUEUE
// ============================================================================

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use ahash::AHashMap;
use arc_swap::ArcSwapOption;
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use tracing::trace;

use crate::frame::Frame;
use crate::ticks::{AtomicTicks, FrameRate, Ticks};

/// List and index share membership; both change only under this lock.
#[derive(Debug, Default)]
struct QueueInner {
    frames: VecDeque<Arc<Frame>>,
    index: AHashMap<Ticks, Arc<Frame>>,
    /// Timestamp of the frame the publisher is working on.
    claimed_ticks: Option<Ticks>,
    /// Set while the owning concentrator is stopped; no frames are created.
    closed: bool,
}

/// Unpublished frames in ascending timestamp order.
///
/// Every queued timestamp is strictly greater than [`FrameQueue::published_ticks`].
/// The head and the last published frame can be read without taking the lock.
#[derive(Debug)]
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    head: ArcSwapOption<Frame>,
    last: ArcSwapOption<Frame>,
    published_ticks: AtomicTicks,
    count: AtomicUsize,
    frame_rate: AtomicCell<FrameRate>,
}

impl FrameQueue {
    pub fn new(frame_rate: FrameRate) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            head: ArcSwapOption::empty(),
            last: ArcSwapOption::empty(),
            published_ticks: AtomicTicks::new(Ticks::MIN),
            count: AtomicUsize::new(0),
            frame_rate: AtomicCell::new(frame_rate),
        }
    }

    #[inline]
    pub fn frame_rate(&self) -> FrameRate {
        self.frame_rate.load()
    }

    pub fn set_frame_rate(&self, frame_rate: FrameRate) {
        self.frame_rate.store(frame_rate);
    }

    /// Frame for the bucket containing `timestamp`, created with `create` when
    /// absent. `None` when that bucket has already been published or is being
    /// published right now.
    pub fn get_frame<F>(&self, timestamp: Ticks, create: F) -> Option<Arc<Frame>>
    where
        F: FnOnce(Ticks) -> Frame,
    {
        let aligned = self.frame_rate().align(timestamp);
        let mut inner = self.inner.lock();

        if inner.closed {
            return None;
        }
        if aligned <= self.published_ticks.load(AtomicOrdering::Acquire) {
            return None;
        }
        if inner.claimed_ticks.is_some_and(|claimed| aligned <= claimed) {
            return None;
        }

        if let Some(frame) = inner.index.get(&aligned) {
            return Some(frame.clone());
        }

        let frame = Arc::new(create(aligned));

        // New frames are usually the newest, so scan from the tail.
        let mut position = inner.frames.len();
        while position > 0 && inner.frames[position - 1].timestamp() > aligned {
            position -= 1;
        }
        inner.frames.insert(position, frame.clone());
        inner.index.insert(aligned, frame.clone());
        self.count.store(inner.frames.len(), AtomicOrdering::Release);

        if position == 0 {
            self.head.store(Some(frame.clone()));
        }

        trace!(target: "concentrator::sort", frame = %aligned, position, "Created frame");
        Some(frame)
    }

    /// Reserve `frame` for publication. Succeeds only while it is still the
    /// head; afterwards no bucket at or before it can be created.
    pub fn claim(&self, frame: &Arc<Frame>) -> bool {
        let mut inner = self.inner.lock();
        let is_head = inner
            .frames
            .front()
            .is_some_and(|head| Arc::ptr_eq(head, frame));
        if is_head {
            inner.claimed_ticks = Some(frame.timestamp());
        }
        is_head
    }

    /// Remove the head frame and record it as the last published one.
    pub fn pop(&self) -> Option<Arc<Frame>> {
        let mut inner = self.inner.lock();
        self.head.store(inner.frames.get(1).cloned());
        let frame = inner.frames.pop_front()?;
        self.retire(&mut inner, &frame);
        Some(frame)
    }

    /// Pop the head only if it is `frame`. Returns whether it was removed.
    pub fn pop_frame(&self, frame: &Arc<Frame>) -> bool {
        let mut inner = self.inner.lock();
        let is_head = inner
            .frames
            .front()
            .is_some_and(|head| Arc::ptr_eq(head, frame));
        if !is_head {
            return false;
        }
        self.head.store(inner.frames.get(1).cloned());
        inner.frames.pop_front();
        self.retire(&mut inner, frame);
        true
    }

    fn retire(&self, inner: &mut QueueInner, frame: &Arc<Frame>) {
        inner.index.remove(&frame.timestamp());
        if inner.claimed_ticks == Some(frame.timestamp()) {
            inner.claimed_ticks = None;
        }
        self.published_ticks
            .update_if_newer(frame.timestamp());
        self.last.store(Some(frame.clone()));
        self.count.store(inner.frames.len(), AtomicOrdering::Release);
    }

    /// Drop every queued frame.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        Self::empty(&mut inner);
        self.head.store(None);
        self.count.store(0, AtomicOrdering::Release);
    }

    /// Drop every queued frame and refuse new ones until [`FrameQueue::open`].
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        Self::empty(&mut inner);
        inner.closed = true;
        self.head.store(None);
        self.count.store(0, AtomicOrdering::Release);
    }

    /// Start accepting frames again, from an empty queue.
    pub fn open(&self) {
        let mut inner = self.inner.lock();
        Self::empty(&mut inner);
        inner.closed = false;
        self.head.store(None);
        self.count.store(0, AtomicOrdering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn empty(inner: &mut QueueInner) {
        inner.frames.clear();
        inner.index.clear();
        inner.claimed_ticks = None;
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(AtomicOrdering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    #[inline]
    pub fn head(&self) -> Option<Arc<Frame>> {
        self.head.load_full()
    }

    #[inline]
    pub fn last(&self) -> Option<Arc<Frame>> {
        self.last.load_full()
    }

    /// Timestamp of the most recently popped frame, [`Ticks::MIN`] before any.
    #[inline]
    pub fn published_ticks(&self) -> Ticks {
        self.published_ticks.load(AtomicOrdering::Acquire)
    }

    /// Human readable summary of the queued frames.
    pub fn examine_state(&self, expected_measurements: usize) -> String {
        let frames: Vec<Arc<Frame>> = self.inner.lock().frames.iter().cloned().collect();
        let rate = self.frame_rate();

        let mut out = String::new();
        let _ = writeln!(out, "Frame queue: {} frame(s) at {}", frames.len(), rate);
        for (position, frame) in frames.iter().enumerate() {
            let _ = write!(
                out,
                "  [{position:>3}] {} (index {:>3}): {} measurement(s)",
                frame.timestamp(),
                rate.frame_index(frame.timestamp()),
                frame.sorted_measurements()
            );
            if expected_measurements > 0 {
                let _ = write!(out, " of {expected_measurements} expected");
            }
            if frame.is_published() {
                out.push_str(" [published]");
            }
            out.push('\n');
        }
        out
    }

    #[cfg(test)]
    fn timestamps(&self) -> Vec<Ticks> {
        let inner = self.inner.lock();
        assert_eq!(inner.frames.len(), inner.index.len());
        inner.frames.iter().map(|f| f.timestamp()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BASE: Ticks = Ticks::from_secs(1_700_000_000);

    fn queue(fps: u32) -> FrameQueue {
        FrameQueue::new(FrameRate::new(fps).unwrap())
    }

    fn frame_at(queue: &FrameQueue, ts: Ticks) -> Option<Arc<Frame>> {
        queue.get_frame(ts, Frame::new)
    }

    #[test]
    fn test_same_bucket_returns_same_frame() {
        let q = queue(10);
        let a = frame_at(&q, BASE + Ticks::from_millis(10)).unwrap();
        let b = frame_at(&q, BASE + Ticks::from_millis(90)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.timestamp(), BASE);
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn test_out_of_order_inserts_stay_sorted() {
        let q = queue(10);
        for ms in [300, 100, 500, 0, 200] {
            frame_at(&q, BASE + Ticks::from_millis(ms)).unwrap();
        }
        let expected: Vec<Ticks> = [0, 100, 200, 300, 500]
            .iter()
            .map(|ms| BASE + Ticks::from_millis(*ms))
            .collect();
        assert_eq!(q.timestamps(), expected);
        assert_eq!(q.head().unwrap().timestamp(), BASE);
    }

    #[test]
    fn test_pop_advances_head_and_records_last() {
        let q = queue(10);
        frame_at(&q, BASE).unwrap();
        frame_at(&q, BASE + Ticks::from_millis(100)).unwrap();

        let popped = q.pop().unwrap();
        assert_eq!(popped.timestamp(), BASE);
        assert_eq!(q.published_ticks(), BASE);
        assert_eq!(q.last().unwrap().timestamp(), BASE);
        assert_eq!(q.head().unwrap().timestamp(), BASE + Ticks::from_millis(100));
        assert_eq!(q.count(), 1);

        q.pop().unwrap();
        assert!(q.head().is_none());
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_published_bucket_is_never_recreated() {
        let q = queue(10);
        frame_at(&q, BASE + Ticks::from_millis(100)).unwrap();
        q.pop().unwrap();

        assert!(frame_at(&q, BASE + Ticks::from_millis(150)).is_none());
        assert!(frame_at(&q, BASE).is_none());
        assert!(frame_at(&q, BASE + Ticks::from_millis(200)).is_some());
    }

    #[test]
    fn test_claim_blocks_earlier_buckets() {
        let q = queue(10);
        let head = frame_at(&q, BASE + Ticks::from_millis(200)).unwrap();
        assert!(q.claim(&head));

        assert!(frame_at(&q, BASE + Ticks::from_millis(100)).is_none());
        assert!(frame_at(&q, BASE + Ticks::from_millis(250)).is_none());
        assert!(frame_at(&q, BASE + Ticks::from_millis(300)).is_some());

        assert!(q.pop_frame(&head));
        assert_eq!(q.published_ticks(), BASE + Ticks::from_millis(200));
    }

    #[test]
    fn test_claim_fails_when_not_head() {
        let q = queue(10);
        let later = frame_at(&q, BASE + Ticks::from_millis(200)).unwrap();
        frame_at(&q, BASE).unwrap();
        assert!(!q.claim(&later));
        assert!(!q.pop_frame(&later));
        assert_eq!(q.count(), 2);
    }

    #[test]
    fn test_clear_empties_queue() {
        let q = queue(30);
        frame_at(&q, BASE).unwrap();
        frame_at(&q, BASE + Ticks::from_millis(40)).unwrap();
        q.clear();
        assert!(q.is_empty());
        assert!(q.head().is_none());
        assert!(q.timestamps().is_empty());
    }

    #[test]
    fn test_examine_state_lists_frames() {
        let q = queue(10);
        let frame = frame_at(&q, BASE + Ticks::from_millis(100)).unwrap();
        frame.try_assign(crate::measurement::Measurement::new(
            crate::measurement::MeasurementKey::new(1, "A"),
            1.0,
            BASE,
        ));
        let state = q.examine_state(4);
        assert!(state.starts_with("Frame queue: 1 frame(s) at 10 frames/sec"));
        assert!(state.contains("1 measurement(s) of 4 expected"));
        assert!(state.contains("(index   1)"));
    }

    #[test]
    fn test_closed_queue_refuses_frames() {
        let q = queue(10);
        frame_at(&q, BASE).unwrap();
        q.close();
        assert!(q.is_closed());
        assert_eq!(q.count(), 0);
        assert!(frame_at(&q, BASE + Ticks::from_millis(100)).is_none());
        assert_eq!(q.count(), 0);

        q.open();
        assert!(!q.is_closed());
        assert!(frame_at(&q, BASE + Ticks::from_millis(100)).is_some());
        assert_eq!(q.count(), 1);
    }
}
