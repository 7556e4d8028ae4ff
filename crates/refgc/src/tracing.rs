//! Structured logging for collections, finalizers and safepoints.
//!
//! With the `tracing` feature, collections get a `gc_collect` span with one
//! `gc_phase` child per phase, and failures are reported as warnings. Without
//! it, warnings go to stderr and the spans compile away.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::fmt::Display;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use tracing::{span, Level};

    use crate::error::SpaceKind;
    use crate::object::ObjectRef;

    /// Phases of one collection, in order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Reset mark colors.
        Clear,
        /// Trace the strongly reachable graph.
        Mark,
        /// Soft retention, weak clearing and phantom enqueueing.
        References,
        /// Queue newly unreachable finalizable objects.
        Finalization,
        /// Reclaim unmarked objects.
        Sweep,
    }

    /// Process-wide collection number, shared by every heap. Tags the
    /// `gc_collect` span so events from concurrent heaps can be told apart.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering one whole collection.
    pub fn trace_gc_collection(cause: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", cause = cause, gc_id = gc_id.0).entered()
    }

    /// Child span of `gc_collect` for one phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    pub fn log_phase_start(phase: GcPhase, bytes_before: usize) {
        tracing::debug!(phase = ?phase, bytes_before, "phase_start");
    }

    pub fn log_phase_end(phase: GcPhase, bytes_reclaimed: usize) {
        tracing::debug!(phase = ?phase, bytes_reclaimed, "phase_end");
    }

    /// Where every object stood at the end of a collection.
    pub fn log_classification(
        strongly_reachable: usize,
        finalizer_pending: usize,
        reclaimable: usize,
        reference_dead: usize,
    ) {
        tracing::debug!(
            strongly_reachable,
            finalizer_pending,
            reclaimable,
            reference_dead,
            "classified"
        );
    }

    /// The collector is still waiting for threads to reach a safepoint.
    pub fn log_safepoint_timeout(missing: usize, waited: Duration) {
        tracing::warn!(
            missing,
            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            "threads have not reached a safepoint"
        );
    }

    /// A finalizer returned an error or panicked.
    pub fn log_finalizer_failure(type_name: &str, object: ObjectRef, error: &dyn Display) {
        tracing::warn!(type_name, object = %object, error = %error, "finalizer failed");
    }

    /// A finalizer thread died outside a finalizer.
    pub fn log_finalizer_thread_panic() {
        tracing::error!("finalizer thread panicked");
    }

    /// An allocation failed after a forced collection.
    pub fn log_out_of_memory(requested: usize, space: SpaceKind) {
        tracing::warn!(requested, space = %space, "allocation failed after collection");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    use std::fmt::Display;
    use std::time::Duration;

    use crate::error::SpaceKind;
    use crate::object::ObjectRef;

    pub const fn log_classification(
        _strongly_reachable: usize,
        _finalizer_pending: usize,
        _reclaimable: usize,
        _reference_dead: usize,
    ) {
    }

    pub fn log_safepoint_timeout(missing: usize, waited: Duration) {
        eprintln!("[GC] {missing} thread(s) have not reached a safepoint after {waited:?}");
    }

    pub fn log_finalizer_failure(type_name: &str, object: ObjectRef, error: &dyn Display) {
        eprintln!("[GC] finalizer for {type_name} {object} failed: {error}");
    }

    pub fn log_finalizer_thread_panic() {
        eprintln!("[GC] finalizer thread panicked");
    }

    pub const fn log_out_of_memory(_requested: usize, _space: SpaceKind) {}
}
