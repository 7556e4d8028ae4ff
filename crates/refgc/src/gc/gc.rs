//! Stop-the-world mark-sweep collection.
//!
//! One collection runs in five phases while every registered mutator is
//! stopped: clear marks, trace from roots, process references, discover
//! newly unreachable finalizable objects, and sweep.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::gc::mark::{clear_marks, Classification, RootKind, Tracer};
use crate::gc::reference_processor::{ReferenceProcessor, SoftRefPolicy};
use crate::gc::safepoint::{MutatorState, THREAD_STATE_EXECUTING};
use crate::heap::{HeapUsage, Spaces};
use crate::metrics::{GcMetrics, PhaseTimer};
use crate::mutator::current_state;
use crate::object::{FinalizeState, ObjectRef, ObjectTable};
use crate::reference::ReferenceRegistry;
use crate::roots::GlobalRoots;
use crate::runtime::{HeapShared, HeapState};

#[cfg(feature = "tracing")]
use crate::tracing::internal::{
    log_phase_end, log_phase_start, next_gc_id, trace_gc_collection, trace_phase, GcPhase,
};

// ============================================================================
// Collection statistics
// ============================================================================

/// Why a collection ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionCause {
    /// [`HeapHandle::collect`](crate::HeapHandle::collect) or a synchronous
    /// request.
    Explicit,
    /// An asynchronous request, picked up at a safepoint.
    Requested,
    /// The collect condition fired after an allocation.
    Threshold,
    /// An allocation found no free block.
    AllocationFailure,
    /// Heap shutdown with finalizers-on-exit enabled.
    Shutdown,
}

impl CollectionCause {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Requested => "requested",
            Self::Threshold => "threshold",
            Self::AllocationFailure => "allocation_failure",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Statistics about the current heap state, used to decide when to collect.
#[derive(Debug, Clone, Copy)]
pub struct CollectInfo {
    pub(crate) allocated_since_collect: usize,
    pub(crate) threshold: usize,
    pub(crate) usage: HeapUsage,
    pub(crate) live_objects: usize,
    pub(crate) pending_finalizers: usize,
    pub(crate) collections: u64,
}

impl CollectInfo {
    /// Block bytes allocated since the last collection.
    #[must_use]
    pub const fn allocated_since_collect(&self) -> usize {
        self.allocated_since_collect
    }

    /// The configured collection threshold in bytes.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    #[must_use]
    pub const fn usage(&self) -> HeapUsage {
        self.usage
    }

    /// Objects currently in the heap, garbage included.
    #[must_use]
    pub const fn live_objects(&self) -> usize {
        self.live_objects
    }

    /// Objects waiting for a finalizer thread.
    #[must_use]
    pub const fn pending_finalizers(&self) -> usize {
        self.pending_finalizers
    }

    /// Collections completed so far.
    #[must_use]
    pub const fn collections(&self) -> u64 {
        self.collections
    }
}

// ============================================================================
// Collection condition
// ============================================================================

/// Type for collection condition functions.
pub type CollectCondition = fn(&CollectInfo) -> bool;

/// The default collection condition.
///
/// Returns `true` once the bytes allocated since the last collection reach
/// the configured threshold.
#[must_use]
pub const fn default_collect_condition(info: &CollectInfo) -> bool {
    info.allocated_since_collect >= info.threshold
}

// ============================================================================
// Driver
// ============================================================================

/// Runs one collection on the calling thread.
///
/// If another thread is already collecting, waits for it to finish and
/// returns `None`. The calling thread, if it is an executing mutator of this
/// heap, counts as stopped for the duration.
pub(crate) fn collect(shared: &HeapShared, cause: CollectionCause) -> Option<GcMetrics> {
    let me = current_state(shared.id).filter(|s| s.state() == THREAD_STATE_EXECUTING);
    let me = me.as_deref();
    if !shared.coordinator.begin_collection(me, &shared.pause_log) {
        return None;
    }

    #[cfg(feature = "tracing")]
    let gc_id = next_gc_id();
    #[cfg(feature = "tracing")]
    let _gc_span = trace_gc_collection(cause.as_str(), gc_id);

    let start = Instant::now();
    let threads = shared.coordinator.threads();
    let policy = SoftRefPolicy::from_config(&shared.config);
    let cycle = shared.cycles.load(Ordering::Acquire);

    let mut metrics = {
        let mut state = shared.state.lock();
        run_cycle(&mut state, &threads, &shared.references, &policy, cause, cycle)
    };

    let total = shared.cycles.fetch_add(1, Ordering::AcqRel) + 1;
    metrics.duration = start.elapsed();
    metrics.cause = Some(cause);
    metrics.total_collections = usize::try_from(total).unwrap_or(usize::MAX);

    shared.metrics.record_collection(&metrics);
    shared.history.push(metrics);
    *shared.last_metrics.lock() = metrics;

    if metrics.finalizers_queued > 0 {
        shared.finalizer_cond.notify_all();
    }
    if let Some(me) = me {
        shared.pause_log.record(me.id, start, Instant::now());
    }
    shared.coordinator.end_collection(me);
    Some(metrics)
}

/// The pause body. Every mutator is stopped and the heap lock is held.
fn run_cycle(
    state: &mut HeapState,
    threads: &[std::sync::Arc<MutatorState>],
    registry: &ReferenceRegistry,
    policy: &SoftRefPolicy,
    cause: CollectionCause,
    cycle: u64,
) -> GcMetrics {
    let HeapState {
        spaces,
        objects,
        globals,
        finalization,
        allocated_since_gc,
    } = state;

    let mut timer = PhaseTimer::new();
    let mut metrics = GcMetrics::new();
    #[cfg(feature = "tracing")]
    let bytes_before = spaces.usage().used();

    // Clear
    {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::Clear);
        timer.start();
        clear_marks(objects);
        timer.end_clear();
    }

    // Mark
    let mut tracer = Tracer::new();
    {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::Mark);
        #[cfg(feature = "tracing")]
        log_phase_start(GcPhase::Mark, bytes_before);
        timer.start();
        mark_roots(&mut tracer, objects, globals, threads);
        tracer.drain(objects);

        // Resurrection is judged against mutator and global roots only. An
        // object reached solely through a queued or running finalizer is not
        // resurrected.
        metrics.objects_resurrected = finalization.rearm_resurrected(objects);

        for handle in finalization.roots() {
            tracer.mark_root(objects, handle, RootKind::Finalization);
        }
        tracer.drain(objects);
        timer.end_mark();
    }

    // References
    let processor = ReferenceProcessor::scan(registry);
    {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::References);
        timer.start();
        if policy.retention_enabled(cause, &spaces.usage()) {
            metrics.soft_retained = processor.retain_soft(&mut tracer, objects, policy, cycle);
            tracer.drain(objects);
        }
        let stats = processor.process_soft_and_weak(objects);
        metrics.references_cleared = stats.retired;
        metrics.references_enqueued = stats.enqueued;
        timer.end_references();
    }

    let strongly_reachable = tracer.marked();

    // Finalization
    {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::Finalization);
        timer.start();
        metrics.finalizers_queued = finalization.enqueue_unreachable(objects, &mut tracer);
        tracer.drain(objects);
        timer.end_finalization();
    }

    // Phantoms see the post-finalization marks.
    timer.start();
    let phantom = processor.process_phantom(objects);
    metrics.phantoms_retired = phantom.retired;
    metrics.references_enqueued += phantom.enqueued;
    timer.end_references();

    // Sweep
    {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::Sweep);
        timer.start();
        let (objects_reclaimed, bytes_reclaimed) = sweep(objects, spaces);
        finalization.prune_swept(objects);
        *allocated_since_gc = 0;
        metrics.objects_reclaimed = objects_reclaimed;
        metrics.bytes_reclaimed = bytes_reclaimed;
        timer.end_sweep();
        #[cfg(feature = "tracing")]
        log_phase_end(GcPhase::Sweep, bytes_reclaimed);
    }

    let classification = Classification {
        strongly_reachable,
        finalizer_pending: tracer.marked() - strongly_reachable,
        reclaimable: metrics.objects_reclaimed,
        reference_dead: metrics.references_cleared + metrics.phantoms_retired,
    };
    debug_assert_eq!(
        classification.strongly_reachable + classification.finalizer_pending,
        objects.len()
    );
    crate::tracing::internal::log_classification(
        classification.strongly_reachable,
        classification.finalizer_pending,
        classification.reclaimable,
        classification.reference_dead,
    );

    metrics.objects_marked = tracer.marked();
    metrics.objects_surviving = objects.len();
    metrics.bytes_surviving = spaces.usage().used();
    metrics.clear_duration = timer.clear;
    metrics.mark_duration = timer.mark;
    metrics.reference_duration = timer.references;
    metrics.finalization_duration = timer.finalization;
    metrics.sweep_duration = timer.sweep;
    metrics
}

fn mark_roots(
    tracer: &mut Tracer,
    objects: &mut ObjectTable,
    globals: &GlobalRoots,
    threads: &[std::sync::Arc<MutatorState>],
) {
    for handle in globals.iter() {
        tracer.mark_root(objects, handle, RootKind::Global);
    }
    for thread in threads {
        let roots = thread.roots.lock();
        for handle in roots.iter() {
            tracer.mark_root(objects, handle, RootKind::Frame);
        }
    }
}

/// Frees every unmarked object. Returns `(objects, block bytes)` reclaimed.
///
/// # Panics
///
/// Panics on a block whose header does not match its object, or on an
/// unmarked object whose finalizer has not run.
fn sweep(objects: &mut ObjectTable, spaces: &mut Spaces) -> (usize, usize) {
    let dead: Vec<ObjectRef> = objects
        .iter()
        .filter(|(_, o)| !o.is_marked())
        .map(|(handle, _)| handle)
        .collect();

    let mut bytes = 0;
    for &handle in &dead {
        let Some(object) = objects.remove(handle) else {
            continue;
        };
        assert!(
            !matches!(object.finalize, FinalizeState::Armed | FinalizeState::Pending),
            "object {handle} of type `{}` reclaimed before its finalizer ran",
            object.ty.name()
        );
        assert!(
            spaces.header_matches(&object.placement, handle.index(), object.size),
            "heap corruption: header mismatch for object {handle} at {:?}",
            object.placement
        );
        bytes += object.placement.block;
        spaces.free(&object.placement);
    }

    #[cfg(feature = "paranoid-sweep")]
    for (handle, object) in objects.iter() {
        assert!(
            spaces.header_matches(&object.placement, handle.index(), object.size),
            "heap corruption: header mismatch for surviving object {handle}"
        );
    }

    (dead.len(), bytes)
}
