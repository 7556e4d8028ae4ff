//! Collection metrics.
//!
//! Every collection produces a [`GcMetrics`] snapshot. A heap folds the
//! snapshots into [`CumulativeMetrics`] and keeps the latest ones in a
//! [`GcHistory`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::gc::CollectionCause;

/// Statistics from one garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcMetrics {
    /// Stop-the-world duration of the collection.
    pub duration: Duration,
    /// Why the collection ran; `None` before the first collection.
    pub cause: Option<CollectionCause>,
    /// Collections completed by this heap, this one included.
    pub total_collections: usize,
    /// Time spent resetting mark bits.
    pub clear_duration: Duration,
    /// Duration of root scanning and strong marking.
    pub mark_duration: Duration,
    /// Duration of soft, weak and phantom processing.
    pub reference_duration: Duration,
    /// Duration of finalizable-object discovery.
    pub finalization_duration: Duration,
    /// Time spent freeing unmarked blocks.
    pub sweep_duration: Duration,
    /// Objects marked, including those kept alive for finalization.
    pub objects_marked: usize,
    /// Block bytes returned to their space by the sweep.
    pub bytes_reclaimed: usize,
    /// Block bytes still charged after the sweep.
    pub bytes_surviving: usize,
    pub objects_reclaimed: usize,
    pub objects_surviving: usize,
    /// Soft referents kept alive by the retention policy.
    pub soft_retained: usize,
    /// Soft and weak records cleared.
    pub references_cleared: usize,
    /// Phantom records whose referent died.
    pub phantoms_retired: usize,
    /// Records pushed onto a queue.
    pub references_enqueued: usize,
    /// Objects moved onto the finalization queue.
    pub finalizers_queued: usize,
    /// Finalized objects found reachable again and re-armed.
    pub objects_resurrected: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// An all-zero snapshot with no cause.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            cause: None,
            total_collections: 0,
            clear_duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            reference_duration: Duration::ZERO,
            finalization_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            objects_marked: 0,
            bytes_reclaimed: 0,
            bytes_surviving: 0,
            objects_reclaimed: 0,
            objects_surviving: 0,
            soft_retained: 0,
            references_cleared: 0,
            phantoms_retired: 0,
            references_enqueued: 0,
            finalizers_queued: 0,
            objects_resurrected: 0,
        }
    }
}

/// Accumulates per-phase durations of one collection.
///
/// `start` opens a phase and the matching `end_*` closes it; a phase may be
/// opened more than once and its durations add up.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PhaseTimer {
    pub clear: Duration,
    pub mark: Duration,
    pub references: Duration,
    pub finalization: Duration,
    pub sweep: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    pub const fn new() -> Self {
        Self {
            clear: Duration::ZERO,
            mark: Duration::ZERO,
            references: Duration::ZERO,
            finalization: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn take(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    pub fn end_clear(&mut self) {
        let elapsed = self.take();
        self.clear += elapsed;
    }

    pub fn end_mark(&mut self) {
        let elapsed = self.take();
        self.mark += elapsed;
    }

    pub fn end_references(&mut self) {
        let elapsed = self.take();
        self.references += elapsed;
    }

    pub fn end_finalization(&mut self) {
        let elapsed = self.take();
        self.finalization += elapsed;
    }

    pub fn end_sweep(&mut self) {
        let elapsed = self.take();
        self.sweep += elapsed;
    }
}

/// Cumulative statistics of one heap.
///
/// Collection counters are updated once per collection; finalizer counters
/// are updated by the finalizer threads as they go.
#[derive(Debug, Default)]
pub struct CumulativeMetrics {
    collections: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    objects_reclaimed: AtomicUsize,
    pause_ns: AtomicU64,
    max_pause_ns: AtomicU64,
    references_cleared: AtomicUsize,
    references_enqueued: AtomicUsize,
    finalizers_queued: AtomicUsize,
    finalizers_run: AtomicUsize,
    finalizer_failures: AtomicUsize,
    allocation_failures: AtomicUsize,
}

impl CumulativeMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
            objects_reclaimed: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
            max_pause_ns: AtomicU64::new(0),
            references_cleared: AtomicUsize::new(0),
            references_enqueued: AtomicUsize::new(0),
            finalizers_queued: AtomicUsize::new(0),
            finalizers_run: AtomicUsize::new(0),
            finalizer_failures: AtomicUsize::new(0),
            allocation_failures: AtomicUsize::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn total_bytes_reclaimed(&self) -> usize {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn total_objects_reclaimed(&self) -> usize {
        self.objects_reclaimed.load(Ordering::Relaxed)
    }

    /// Summed collection pauses, in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    /// Longest collection pause, in nanoseconds.
    #[inline]
    #[must_use]
    pub fn max_pause_ns(&self) -> u64 {
        self.max_pause_ns.load(Ordering::Relaxed)
    }

    /// Soft and weak records cleared by the collector.
    #[inline]
    #[must_use]
    pub fn references_cleared(&self) -> usize {
        self.references_cleared.load(Ordering::Relaxed)
    }

    /// Records enqueued by the collector.
    #[inline]
    #[must_use]
    pub fn references_enqueued(&self) -> usize {
        self.references_enqueued.load(Ordering::Relaxed)
    }

    /// Objects queued for finalization.
    #[inline]
    #[must_use]
    pub fn finalizers_queued(&self) -> usize {
        self.finalizers_queued.load(Ordering::Relaxed)
    }

    /// Finalizers that completed, successfully or not.
    #[inline]
    #[must_use]
    pub fn finalizers_run(&self) -> usize {
        self.finalizers_run.load(Ordering::Relaxed)
    }

    /// Finalizers that returned an error or panicked.
    #[inline]
    #[must_use]
    pub fn finalizer_failures(&self) -> usize {
        self.finalizer_failures.load(Ordering::Relaxed)
    }

    /// Allocations that reported `OutOfMemory`.
    #[inline]
    #[must_use]
    pub fn allocation_failures(&self) -> usize {
        self.allocation_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_collection(&self, metrics: &GcMetrics) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.bytes_reclaimed
            .fetch_add(metrics.bytes_reclaimed, Ordering::Relaxed);
        self.objects_reclaimed
            .fetch_add(metrics.objects_reclaimed, Ordering::Relaxed);
        let pause = u64::try_from(metrics.duration.as_nanos()).unwrap_or(u64::MAX);
        self.pause_ns.fetch_add(pause, Ordering::Relaxed);
        self.max_pause_ns.fetch_max(pause, Ordering::Relaxed);
        self.references_cleared
            .fetch_add(metrics.references_cleared, Ordering::Relaxed);
        self.references_enqueued
            .fetch_add(metrics.references_enqueued, Ordering::Relaxed);
        self.finalizers_queued
            .fetch_add(metrics.finalizers_queued, Ordering::Relaxed);
    }

    pub(crate) fn record_finalizer(&self, failed: bool) {
        self.finalizers_run.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.finalizer_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_allocation_failure(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshots kept by [`GcHistory`].
const HISTORY_SIZE: usize = 64;

/// The most recent 64 collections of one heap, for trend analysis.
#[derive(Debug, Default)]
pub struct GcHistory {
    ring: Mutex<VecDeque<GcMetrics>>,
    recorded: AtomicUsize,
}

impl GcHistory {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: Mutex::new(VecDeque::new()),
            recorded: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, metrics: GcMetrics) {
        let mut ring = self.ring.lock();
        if ring.len() == HISTORY_SIZE {
            ring.pop_front();
        }
        ring.push_back(metrics);
        self.recorded.fetch_add(1, Ordering::Release);
    }

    /// Collections recorded over the heap's lifetime, including those that
    /// have rotated out.
    #[inline]
    #[must_use]
    pub fn total_recorded(&self) -> usize {
        self.recorded.load(Ordering::Acquire)
    }

    /// Up to `n` of the most recent snapshots, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<GcMetrics> {
        let ring = self.ring.lock();
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).copied().collect()
    }

    /// Average pause of the most recent `n` collections.
    #[must_use]
    pub fn average_pause_time(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = recent.iter().map(|m| m.duration).sum();
        sum / u32::try_from(recent.len()).unwrap_or(u32::MAX)
    }

    /// Longest pause of the most recent `n` collections.
    #[must_use]
    pub fn max_pause_time(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(|m| m.duration)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}
