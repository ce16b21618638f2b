use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::segment::Segment;

/// A segment that has left the live window but may still be on disk until
/// its grace period passes (spec §4.1 "expired list").
struct Expired {
    segment: Segment,
    become_stale_at: Instant,
}

struct Entry {
    segment: Segment,
    entered_at: Instant,
}

fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_micros(ticks * 1_000_000 / 90_000)
}

/// Ordered collection of closed segments currently enumerated in the live
/// playlist, plus a deferred-unlink list for segments that just fell out of
/// it (§4.1 Fragment window / C1).
pub struct FragmentWindow {
    segments: VecDeque<Entry>,
    expired: Vec<Expired>,
    total_duration: u64,
}

impl FragmentWindow {
    pub fn new() -> Self {
        FragmentWindow {
            segments: VecDeque::new(),
            expired: Vec::new(),
            total_duration: 0,
        }
    }

    /// O(1) push at tail; no copy of payload.
    pub fn append(&mut self, seg: Segment) {
        self.total_duration += seg.duration;
        self.segments.push_back(Entry {
            segment: seg,
            entered_at: Instant::now(),
        });
    }

    /// Evict from the head while the remaining duration still covers
    /// `window_dur` and the head has sat in the window longer than
    /// `window_dur`. Evicted segments move to the expired list with a
    /// grace period of `window_dur` (spec §4.1).
    pub fn shrink(&mut self, window_dur: u64) {
        let window_wall = ticks_to_duration(window_dur);
        while let Some(head) = self.segments.front() {
            let remaining_without_head = self.total_duration.saturating_sub(head.segment.duration);
            if remaining_without_head < window_dur {
                break;
            }
            if head.entered_at.elapsed() <= window_wall {
                break;
            }
            let head = self.segments.pop_front().unwrap();
            self.total_duration -= head.segment.duration;
            trace!(seq = head.segment.sequence_no, "evicting segment from live window");
            self.expired.push(Expired {
                segment: head.segment,
                become_stale_at: Instant::now() + window_wall,
            });
        }
    }

    /// Unlink files for expired entries whose grace has passed. Unlink
    /// failures are logged and the entry dropped; they never propagate
    /// (spec §4.1 "Failure").
    pub fn clear_expired(&mut self, unlink_files: bool) {
        let now = Instant::now();
        let (ready, still_pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.expired)
            .into_iter()
            .partition(|e| e.become_stale_at <= now);
        self.expired = still_pending;

        for e in ready {
            if unlink_files {
                if let Err(err) = std::fs::remove_file(&e.segment.path) {
                    warn!(path = %e.segment.path.display(), %err, "failed to unlink expired segment");
                }
            }
        }
    }

    pub fn empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn size(&self) -> usize {
        self.segments.len()
    }

    pub fn first(&self) -> Option<&Segment> {
        self.segments.front().map(|e| &e.segment)
    }

    pub fn at(&self, i: usize) -> Option<&Segment> {
        self.segments.get(i).map(|e| &e.segment)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().map(|e| &e.segment)
    }

    pub fn max_duration(&self) -> u64 {
        self.segments
            .iter()
            .map(|e| e.segment.duration)
            .max()
            .unwrap_or(0)
    }

    pub fn total_duration(&self) -> u64 {
        self.total_duration
    }

    /// Full disposal on unpublish: move everything to expired with zero
    /// grace so the next `clear_expired` removes it all from disk.
    pub fn dispose(&mut self) {
        let now = Instant::now();
        for e in self.segments.drain(..) {
            self.expired.push(Expired {
                segment: e.segment,
                become_stale_at: now,
            });
        }
        self.total_duration = 0;
    }
}

impl Default for FragmentWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{Container, SegmentKey};
    use std::path::PathBuf;

    fn seg(seq: u64, duration: u64) -> Segment {
        Segment {
            sequence_no: seq,
            path: PathBuf::from(format!("/tmp/seg-{seq}.ts")),
            tmp_path: PathBuf::from(format!("/tmp/seg-{seq}.ts.tmp")),
            uri: format!("seg-{seq}.ts"),
            duration,
            discontinuity: false,
            key: SegmentKey::None,
            closed: true,
            container: Container::Ts,
            key_rotation_id: 0,
        }
    }

    #[test]
    fn shrink_does_not_evict_freshly_appended_segments() {
        // All entries just entered the window, so the "sat longer than
        // window_dur" half of the eviction condition can't be true yet.
        let mut w = FragmentWindow::new();
        for i in 0..5 {
            w.append(seg(i, 90_000)); // 1s each, 90kHz
        }
        w.shrink(3 * 90_000);
        assert_eq!(w.size(), 5);
        assert_eq!(w.total_duration(), 5 * 90_000);
    }

    #[test]
    fn shrink_evicts_head_once_it_has_aged_past_window() {
        let mut w = FragmentWindow::new();
        w.append(seg(0, 90_000));
        std::thread::sleep(Duration::from_millis(5));
        w.append(seg(1, 90_000));
        // 90 ticks == 1ms, tiny relative to the 5ms sleep above, so head counts as "old enough".
        w.shrink(90);
        assert_eq!(w.size(), 1);
        assert_eq!(w.first().unwrap().sequence_no, 1);
    }

    #[test]
    fn append_is_ordered_and_size_tracks() {
        let mut w = FragmentWindow::new();
        assert!(w.empty());
        w.append(seg(0, 90_000));
        w.append(seg(1, 90_000));
        assert_eq!(w.size(), 2);
        assert_eq!(w.first().unwrap().sequence_no, 0);
        assert_eq!(w.at(1).unwrap().sequence_no, 1);
    }
}
