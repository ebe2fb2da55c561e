//! Restores spatial order of slice output.
//!
//! A multi-threaded compressor may finish slices out of order, but the
//! packetizer downstream derives frame boundaries from position: fragments
//! must leave in increasing unit order and only the fragment covering the
//! final unit carries `is_last`.
//!
//! A unit is one 16x16 block of the padded frame.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::backend::FragmentSink;

/// Size in pixels of one reassembly unit.
pub const UNIT_SIZE: u32 = 16;

/// Number of units covering a padded `video_width` x `video_height` frame.
#[must_use]
pub fn total_units(video_width: u32, video_height: u32) -> u32 {
    video_width.div_ceil(UNIT_SIZE) * video_height.div_ceil(UNIT_SIZE)
}

/// Slice output waiting for the units before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFragment {
    pub first_unit: u32,
    pub last_unit: u32,
    pub payload: Bytes,
}

/// Outcome of one frame, returned by [`Reassembler::finish_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSummary {
    /// Units flushed to the sink.
    pub units_flushed: u32,
    /// Units the frame was expected to cover.
    pub total_units: u32,
    /// Fragments still queued when the frame ended (discarded).
    pub discarded: usize,
}

impl FrameSummary {
    /// Whether every unit of the frame reached the sink.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.units_flushed == self.total_units && self.discarded == 0
    }
}

/// Ordering state for one encoder instance.
pub struct Reassembler {
    total_units: u32,
    next_unit: u32,
    /// Keyed by `first_unit`; ranges never overlap.
    pending: BTreeMap<u32, PendingFragment>,
    sink: Arc<dyn FragmentSink>,
}

impl Reassembler {
    #[must_use]
    pub fn new(total_units: u32, sink: Arc<dyn FragmentSink>) -> Self {
        Self {
            total_units,
            next_unit: 0,
            pending: BTreeMap::new(),
            sink,
        }
    }

    /// First unit not yet flushed.
    #[must_use]
    pub fn next_unit(&self) -> u32 {
        self.next_unit
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the final unit of the frame has been flushed.
    #[must_use]
    pub fn is_frame_complete(&self) -> bool {
        self.next_unit >= self.total_units
    }

    /// Forward a parameter-set fragment. Never marked as last.
    pub fn push_header(&mut self, payload: Bytes) {
        self.sink.send(payload, false);
    }

    /// Accept the output covering units `first_unit..=last_unit`.
    pub fn push(&mut self, first_unit: u32, last_unit: u32, payload: Bytes) {
        if last_unit < first_unit || last_unit >= self.total_units {
            tracing::warn!(
                first_unit,
                last_unit,
                total_units = self.total_units,
                "slice range outside frame, dropping fragment"
            );
            return;
        }

        if first_unit == self.next_unit {
            self.flush(first_unit, last_unit, payload);
        } else if first_unit < self.next_unit || self.overlaps_pending(first_unit, last_unit) {
            tracing::warn!(
                first_unit,
                last_unit,
                next_unit = self.next_unit,
                "slice overlaps already received units, dropping fragment"
            );
            return;
        } else {
            self.pending.insert(
                first_unit,
                PendingFragment {
                    first_unit,
                    last_unit,
                    payload,
                },
            );
        }

        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.next_unit {
                break;
            }
            let fragment = entry.remove();
            self.flush(fragment.first_unit, fragment.last_unit, fragment.payload);
        }
    }

    /// Close the current frame and reset for the next one.
    ///
    /// A frame that did not cover every unit is logged; queued fragments
    /// are discarded.
    pub fn finish_frame(&mut self) -> FrameSummary {
        let summary = FrameSummary {
            units_flushed: self.next_unit,
            total_units: self.total_units,
            discarded: self.pending.len(),
        };
        if !summary.is_complete() {
            tracing::warn!(
                units_flushed = summary.units_flushed,
                total_units = summary.total_units,
                discarded = summary.discarded,
                "unexpected unit count at end of frame"
            );
        }
        self.pending.clear();
        self.next_unit = 0;
        summary
    }

    fn overlaps_pending(&self, first_unit: u32, last_unit: u32) -> bool {
        let before = self
            .pending
            .range(..=first_unit)
            .next_back()
            .is_some_and(|(_, f)| f.last_unit >= first_unit);
        let after = self
            .pending
            .range(first_unit..)
            .next()
            .is_some_and(|(_, f)| f.first_unit <= last_unit);
        before || after
    }

    fn flush(&mut self, first_unit: u32, last_unit: u32, payload: Bytes) {
        let is_last = last_unit + 1 == self.total_units;
        tracing::trace!(first_unit, last_unit, len = payload.len(), is_last, "flushing slice");
        self.sink.send(payload, is_last);
        self.next_unit = last_unit + 1;
    }
}

/// [`Reassembler`] behind the per-encoder mutex, shared with the
/// compressor's output threads.
#[derive(Clone)]
pub struct SharedReassembler {
    inner: Arc<Mutex<Reassembler>>,
}

impl SharedReassembler {
    #[must_use]
    pub fn new(reassembler: Reassembler) -> Self {
        Self {
            inner: Arc::new(Mutex::new(reassembler)),
        }
    }

    /// Lock the state, logging a warning if the mutex was poisoned.
    pub fn lock(&self) -> MutexGuard<'_, Reassembler> {
        self.inner.lock().unwrap_or_else(|e| {
            tracing::warn!("reassembly: mutex was poisoned, recovering (possible inconsistency)");
            e.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(Bytes, bool)>>,
    }

    impl FragmentSink for Recorder {
        fn send(&self, data: Bytes, is_last: bool) {
            self.calls.lock().expect("recorder lock").push((data, is_last));
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<(Bytes, bool)> {
            std::mem::take(&mut *self.calls.lock().expect("recorder lock"))
        }
    }

    const RANGES: [(u32, u32); 3] = [(0, 2), (3, 5), (6, 9)];

    fn payload(first: u32) -> Bytes {
        Bytes::from(format!("slice{first}"))
    }

    fn expected() -> Vec<(Bytes, bool)> {
        vec![(payload(0), false), (payload(3), false), (payload(6), true)]
    }

    fn permutations() -> Vec<[usize; 3]> {
        vec![[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]]
    }

    #[test]
    fn total_units_round_up() {
        assert_eq!(total_units(64, 32), 8);
        assert_eq!(total_units(65, 32), 10);
        assert_eq!(total_units(1920, 1088), 120 * 68);
    }

    #[test]
    fn every_submission_order_flushes_in_unit_order() {
        for order in permutations() {
            let sink = Arc::new(Recorder::default());
            let mut r = Reassembler::new(10, sink.clone());
            for i in order {
                let (first, last) = RANGES[i];
                r.push(first, last, payload(first));
            }
            assert_eq!(sink.take(), expected(), "order {order:?}");
            assert!(r.is_frame_complete());
            assert_eq!(r.pending_len(), 0);
            assert_eq!(r.next_unit(), 10);
        }
    }

    #[test]
    fn concurrent_submission_flushes_in_unit_order() {
        for order in permutations() {
            let sink = Arc::new(Recorder::default());
            let shared = SharedReassembler::new(Reassembler::new(10, sink.clone()));
            std::thread::scope(|s| {
                for i in order {
                    let shared = shared.clone();
                    s.spawn(move || {
                        let (first, last) = RANGES[i];
                        shared.lock().push(first, last, payload(first));
                    });
                }
            });
            assert_eq!(sink.take(), expected(), "order {order:?}");
            let summary = shared.lock().finish_frame();
            assert!(summary.is_complete());
        }
    }

    #[test]
    fn state_resets_for_next_frame() {
        let sink = Arc::new(Recorder::default());
        let mut r = Reassembler::new(10, sink.clone());
        for (first, last) in RANGES {
            r.push(first, last, payload(first));
        }
        let summary = r.finish_frame();
        assert_eq!(
            summary,
            FrameSummary {
                units_flushed: 10,
                total_units: 10,
                discarded: 0
            }
        );
        assert_eq!(r.next_unit(), 0);
        sink.take();

        r.push(6, 9, payload(6));
        assert!(sink.take().is_empty());
        r.push(0, 5, payload(0));
        assert_eq!(sink.take(), vec![(payload(0), false), (payload(6), true)]);
    }

    #[test]
    fn headers_bypass_ordering_and_are_never_last() {
        let sink = Arc::new(Recorder::default());
        let mut r = Reassembler::new(10, sink.clone());
        r.push(3, 9, payload(3));
        r.push_header(Bytes::from_static(b"vps"));
        r.push_header(Bytes::from_static(b"sps"));
        r.push(0, 2, payload(0));
        assert_eq!(
            sink.take(),
            vec![
                (Bytes::from_static(b"vps"), false),
                (Bytes::from_static(b"sps"), false),
                (payload(0), false),
                (payload(3), true),
            ]
        );
    }

    #[test]
    fn missing_slice_is_reported_and_discarded() {
        let sink = Arc::new(Recorder::default());
        let mut r = Reassembler::new(10, sink.clone());
        r.push(0, 2, payload(0));
        r.push(6, 9, payload(6));
        let summary = r.finish_frame();
        assert!(!summary.is_complete());
        assert_eq!(summary.units_flushed, 3);
        assert_eq!(summary.discarded, 1);
        assert_eq!(sink.take(), vec![(payload(0), false)]);
        assert_eq!(r.pending_len(), 0);
        assert_eq!(r.next_unit(), 0);
    }

    #[test]
    fn overlapping_and_out_of_frame_fragments_are_dropped() {
        let sink = Arc::new(Recorder::default());
        let mut r = Reassembler::new(10, sink.clone());
        r.push(4, 6, payload(4));
        r.push(5, 7, payload(5));
        r.push(2, 4, payload(2));
        r.push(8, 12, payload(8));
        assert_eq!(r.pending_len(), 1);

        r.push(0, 3, payload(0));
        r.push(1, 2, payload(1));
        assert_eq!(sink.take(), vec![(payload(0), false), (payload(4), false)]);
        assert_eq!(r.next_unit(), 7);
    }
}
