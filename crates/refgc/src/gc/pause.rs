//! Pause recording and system-pause aggregation.
//!
//! Every mutator records the intervals it spent stopped for a collection.
//! A *system pause* is a stretch of time during which every reporting thread
//! was stopped at once: the intersection of the per-thread interval sets.
//! The result is a reporting heuristic; nothing in the collector acts on it.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::mutator::MutatorId;

/// One stretch of time a thread spent stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseInterval {
    /// Thread that was stopped.
    pub thread: MutatorId,
    pub start: Instant,
    pub end: Instant,
}

impl PauseInterval {
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

/// A stretch of time during which all reporting threads were stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemPause {
    pub start: Instant,
    pub end: Instant,
}

impl SystemPause {
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

/// Summary of the recorded pauses.
#[derive(Debug, Clone, Default)]
pub struct PauseReport {
    /// Longest recorded pause per thread, ordered by thread id.
    pub longest_per_thread: Vec<(MutatorId, Duration)>,
    /// Aggregated system pauses in time order.
    pub system_pauses: Vec<SystemPause>,
}

impl PauseReport {
    /// Longest system pause, or zero when none was recorded.
    #[must_use]
    pub fn longest_system_pause(&self) -> Duration {
        self.system_pauses
            .iter()
            .map(SystemPause::duration)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Bounded log of per-thread pauses above a threshold.
#[derive(Debug)]
pub(crate) struct PauseLog {
    intervals: Mutex<VecDeque<PauseInterval>>,
    threshold: Duration,
    capacity: usize,
}

impl PauseLog {
    pub fn new(threshold: Duration, capacity: usize) -> Self {
        Self {
            intervals: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            threshold,
            capacity,
        }
    }

    /// Records `[start, end)` for `thread` if it is at least the threshold
    /// long. The oldest entry is dropped once the log is full.
    pub fn record(&self, thread: MutatorId, start: Instant, end: Instant) {
        let interval = PauseInterval { thread, start, end };
        if interval.duration() < self.threshold || self.capacity == 0 {
            return;
        }
        let mut intervals = self.intervals.lock();
        if intervals.len() == self.capacity {
            intervals.pop_front();
        }
        intervals.push_back(interval);
    }

    pub fn snapshot(&self) -> Vec<PauseInterval> {
        self.intervals.lock().iter().copied().collect()
    }

    pub fn report(&self) -> PauseReport {
        build_report(&self.snapshot())
    }
}

/// Builds a [`PauseReport`] from raw intervals.
#[must_use]
pub fn build_report(intervals: &[PauseInterval]) -> PauseReport {
    let per_thread = group_by_thread(intervals);
    let longest_per_thread = per_thread
        .iter()
        .map(|(&thread, list)| {
            let longest = list
                .iter()
                .map(|(s, e)| e.saturating_duration_since(*s))
                .max()
                .unwrap_or(Duration::ZERO);
            (thread, longest)
        })
        .collect();

    PauseReport {
        longest_per_thread,
        system_pauses: system_pauses(intervals),
    }
}

/// Intersects the pause sets of every thread that appears in `intervals`.
#[must_use]
pub fn system_pauses(intervals: &[PauseInterval]) -> Vec<SystemPause> {
    let per_thread = group_by_thread(intervals);
    let mut lists = per_thread.into_values();
    let Some(mut acc) = lists.next() else {
        return Vec::new();
    };
    for list in lists {
        acc = intersect(&acc, &list);
        if acc.is_empty() {
            break;
        }
    }
    acc.into_iter()
        .map(|(start, end)| SystemPause { start, end })
        .collect()
}

type Span = (Instant, Instant);

/// Sorted, merged interval lists per thread.
fn group_by_thread(intervals: &[PauseInterval]) -> BTreeMap<MutatorId, Vec<Span>> {
    let mut map: BTreeMap<MutatorId, Vec<Span>> = BTreeMap::new();
    for iv in intervals {
        if iv.end > iv.start {
            map.entry(iv.thread).or_default().push((iv.start, iv.end));
        }
    }
    for list in map.values_mut() {
        list.sort_by_key(|&(start, _)| start);
        let mut merged: Vec<Span> = Vec::with_capacity(list.len());
        for &(start, end) in list.iter() {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        *list = merged;
    }
    map
}

/// Two-pointer intersection of two sorted, disjoint interval lists.
fn intersect(a: &[Span], b: &[Span]) -> Vec<Span> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let start = a[i].0.max(b[j].0);
        let end = a[i].1.min(b[j].1);
        if start < end {
            out.push((start, end));
        }
        if a[i].1 < b[j].1 {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    fn iv(thread: u64, base: Instant, start: u64, end: u64) -> PauseInterval {
        PauseInterval {
            thread: MutatorId::from_raw(thread),
            start: at(base, start),
            end: at(base, end),
        }
    }

    #[test]
    fn test_single_thread_pauses_are_system_pauses() {
        let t = Instant::now();
        let pauses = system_pauses(&[iv(1, t, 0, 10), iv(1, t, 20, 25)]);
        assert_eq!(pauses.len(), 2);
        assert_eq!(pauses[0].duration(), Duration::from_millis(10));
        assert_eq!(pauses[1].duration(), Duration::from_millis(5));
    }

    #[test]
    fn test_overlap_across_threads() {
        let t = Instant::now();
        let intervals = [
            iv(1, t, 0, 10),
            iv(2, t, 5, 15),
            iv(3, t, 2, 8),
            iv(1, t, 30, 40),
            iv(2, t, 35, 50),
        ];
        let pauses = system_pauses(&intervals);
        // Thread 3 has nothing near 30..40, so only 5..8 survives.
        assert_eq!(pauses, vec![SystemPause {
            start: at(t, 5),
            end: at(t, 8)
        }]);
    }

    #[test]
    fn test_disjoint_threads_have_no_system_pause() {
        let t = Instant::now();
        let pauses = system_pauses(&[iv(1, t, 0, 5), iv(2, t, 5, 10)]);
        assert!(pauses.is_empty());
    }

    #[test]
    fn test_overlapping_intervals_of_one_thread_merge() {
        let t = Instant::now();
        let intervals = [iv(1, t, 0, 6), iv(1, t, 4, 10), iv(2, t, 0, 10)];
        let pauses = system_pauses(&intervals);
        assert_eq!(pauses.len(), 1);
        assert_eq!(pauses[0].duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_report_longest_per_thread() {
        let t = Instant::now();
        let report = build_report(&[iv(2, t, 0, 3), iv(1, t, 0, 7), iv(2, t, 10, 19)]);
        assert_eq!(report.longest_per_thread, vec![
            (MutatorId::from_raw(1), Duration::from_millis(7)),
            (MutatorId::from_raw(2), Duration::from_millis(9)),
        ]);
        assert_eq!(report.longest_system_pause(), Duration::from_millis(3));
    }

    #[test]
    fn test_log_threshold_and_capacity() {
        let log = PauseLog::new(Duration::from_millis(2), 2);
        let t = Instant::now();
        let id = MutatorId::from_raw(1);
        log.record(id, t, at(t, 1));
        assert!(log.snapshot().is_empty());

        log.record(id, t, at(t, 2));
        log.record(id, at(t, 10), at(t, 13));
        log.record(id, at(t, 20), at(t, 24));
        let kept = log.snapshot();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].start, at(t, 10));
    }
}
