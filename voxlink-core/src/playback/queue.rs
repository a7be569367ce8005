//! Gapless scheduling bookkeeping, independent of any audio API.
//!
//! ## Rule
//!
//! ```text
//! start      = max(next_start, now)
//! next_start = start + frames
//! ```
//!
//! `next_start` only ever moves on submission (or on `clear`), never on
//! completion, so completions arriving late or out of order cannot cause
//! two segments to overlap.

use std::collections::BTreeMap;

/// Monotonic identifier assigned at scheduling time.
pub type SegmentId = u64;

/// A segment's placement on the device clock (frames at the playback rate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSegment {
    pub id: SegmentId,
    pub start: u64,
    pub frames: u64,
}

impl ScheduledSegment {
    /// First frame after this segment.
    pub fn end(&self) -> u64 {
        self.start + self.frames
    }
}

/// The active set plus the `next_start` cursor.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    next_start: u64,
    next_id: SegmentId,
    active: BTreeMap<SegmentId, ScheduledSegment>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a segment of `frames` length given the device clock `now`.
    pub fn schedule(&mut self, now: u64, frames: u64) -> ScheduledSegment {
        let start = self.next_start.max(now);
        let segment = ScheduledSegment {
            id: self.next_id,
            start,
            frames,
        };
        self.next_id += 1;
        self.next_start = segment.end();
        self.active.insert(segment.id, segment);
        segment
    }

    /// Roll back a segment the device refused.
    ///
    /// The cursor is only rewound when nothing was scheduled after it.
    pub fn unschedule(&mut self, segment: &ScheduledSegment) {
        self.active.remove(&segment.id);
        if self.next_start == segment.end() {
            self.next_start = segment.start;
        }
    }

    /// Completion bookkeeping. Returns `false` for unknown or already-cleared ids.
    pub fn complete(&mut self, id: SegmentId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Forget every segment and restart the cursor at `now`.
    pub fn clear(&mut self, now: u64) -> Vec<ScheduledSegment> {
        self.next_start = now;
        std::mem::take(&mut self.active).into_values().collect()
    }

    pub fn next_start(&self) -> u64 {
        self.next_start
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Active segments in scheduling order.
    pub fn active(&self) -> impl Iterator<Item = &ScheduledSegment> {
        self.active.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 100 ms at 24 kHz.
    const SEG: u64 = 2_400;

    fn ms(v: u64) -> u64 {
        v * 24
    }

    #[test]
    fn first_segment_starts_now() {
        let mut q = PlaybackQueue::new();
        let s = q.schedule(ms(50), SEG);
        assert_eq!(s.start, ms(50));
        assert_eq!(q.next_start(), ms(50) + SEG);
    }

    #[test]
    fn bursty_arrivals_never_overlap() {
        let mut q = PlaybackQueue::new();
        let segs: Vec<_> = (0..16).map(|i| q.schedule(i, SEG + i * 7)).collect();
        for pair in segs.windows(2) {
            assert_eq!(pair[0].end(), pair[1].start);
        }
    }

    #[test]
    fn backlog_absorbs_arrival_jitter() {
        let mut q = PlaybackQueue::new();
        let mut now = 0;

        let s1 = q.schedule(now, SEG);
        now += ms(10);
        let s2 = q.schedule(now, SEG);
        let s3 = q.schedule(now, SEG);
        now += ms(200);
        // backlog runs to 300 ms, arrival at 210 ms
        let s4 = q.schedule(now, SEG);

        assert_eq!(s1.start, 0);
        assert_eq!(s2.start, s1.end());
        assert_eq!(s3.start, s2.end());
        assert_eq!(s4.start, s3.end());
    }

    #[test]
    fn drained_backlog_starts_on_arrival() {
        let mut q = PlaybackQueue::new();
        let s1 = q.schedule(0, SEG);
        // 200 ms later the 100 ms segment is long over
        let s2 = q.schedule(ms(200), SEG);
        assert_eq!(s2.start, ms(200));
        assert!(s1.end() <= s2.start);
    }

    #[test]
    fn late_arrival_starts_on_the_clock() {
        let mut q = PlaybackQueue::new();
        let s1 = q.schedule(0, SEG);
        let s2 = q.schedule(s1.end() + 100, SEG);
        assert_eq!(s2.start, s1.end() + 100);
    }

    #[test]
    fn completion_does_not_move_cursor() {
        let mut q = PlaybackQueue::new();
        let s1 = q.schedule(0, SEG);
        let s2 = q.schedule(0, SEG);
        let cursor = q.next_start();

        // out-of-order completion
        assert!(q.complete(s2.id));
        assert!(q.complete(s1.id));
        assert!(!q.complete(s1.id));
        assert_eq!(q.next_start(), cursor);
        assert_eq!(q.active_len(), 0);
    }

    #[test]
    fn clear_resets_cursor_and_empties() {
        let mut q = PlaybackQueue::new();
        q.schedule(0, SEG);
        q.schedule(0, SEG);
        let dropped = q.clear(ms(30));
        assert_eq!(dropped.len(), 2);
        assert_eq!(q.active_len(), 0);
        assert_eq!(q.next_start(), ms(30));

        // clearing an empty queue is fine
        assert!(q.clear(ms(40)).is_empty());
        let s = q.schedule(ms(40), SEG);
        assert_eq!(s.start, ms(40));
    }

    #[test]
    fn unschedule_rewinds_only_the_tail() {
        let mut q = PlaybackQueue::new();
        let s1 = q.schedule(0, SEG);
        let s2 = q.schedule(0, SEG);
        q.unschedule(&s1);
        assert_eq!(q.next_start(), s2.end());
        q.unschedule(&s2);
        assert_eq!(q.next_start(), s2.start);
        assert_eq!(q.active_len(), 0);
    }
}
