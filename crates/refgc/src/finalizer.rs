//! Finalization scheduling.
//!
//! An object whose type carries a finalizer is *armed* at allocation. The
//! first collection that finds it unreachable moves it to the pending queue
//! and keeps it (and everything it reaches) alive. A dedicated finalizer
//! thread, itself a registered mutator, runs the finalizer with the object
//! rooted. Afterwards the object is *finalized*: the next collection that
//! finds it unreachable reclaims it, and one that finds it reachable again
//! re-arms it so it is finalized again at its next death.

use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use crate::error::{GcError, Result};
use crate::gc::mark::Tracer;
use crate::gc::{self, CollectionCause};
use crate::mutator::{current_state, Mutator};
use crate::object::{FinalizeState, ObjectRef, ObjectTable};
use crate::runtime::{HeapHandle, HeapShared};

thread_local! {
    static IS_FINALIZER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is a finalizer worker.
pub(crate) fn is_finalizer_thread() -> bool {
    IS_FINALIZER_THREAD.try_with(Cell::get).unwrap_or(false)
}

/// Counts of the finalization pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizationStats {
    /// Live finalizable objects whose finalizer has not been queued.
    pub armed: usize,
    /// Objects waiting for a finalizer thread.
    pub pending: usize,
    /// Objects whose finalizer is running.
    pub running: usize,
    /// Objects finalized and not yet reclaimed.
    pub finalized: usize,
    /// Finalizers queued over the heap's lifetime.
    pub total_queued: u64,
    /// Finalizers completed over the heap's lifetime.
    pub total_completed: u64,
}

/// Finalization state of one heap. Lives under the heap lock.
#[derive(Debug, Default)]
pub(crate) struct FinalizationQueue {
    candidates: Vec<ObjectRef>,
    pending: VecDeque<ObjectRef>,
    in_flight: Vec<ObjectRef>,
    finalized: Vec<ObjectRef>,
    /// Set once at shutdown; workers exit when they see it.
    pub shutting_down: bool,
    total_queued: u64,
    total_completed: u64,
}

impl FinalizationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a freshly allocated finalizable object.
    pub fn register(&mut self, handle: ObjectRef) {
        self.candidates.push(handle);
    }

    /// Objects the finalization machinery keeps alive.
    pub fn roots(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.pending.iter().chain(&self.in_flight).copied()
    }

    /// Re-arms finalized objects that are strongly reachable again.
    pub fn rearm_resurrected(&mut self, objects: &mut ObjectTable) -> usize {
        let candidates = &mut self.candidates;
        let before = self.finalized.len();
        self.finalized.retain(|&handle| match objects.get_mut(handle) {
            Some(object) if object.is_marked() => {
                object.finalize = FinalizeState::Armed;
                candidates.push(handle);
                false
            }
            Some(_) => true,
            None => false,
        });
        before - self.finalized.len()
    }

    /// Queues every unmarked armed object and greys it, so it and its
    /// closure survive this collection. The caller drains the tracer.
    pub fn enqueue_unreachable(&mut self, objects: &mut ObjectTable, tracer: &mut Tracer) -> usize {
        let start = self.pending.len();
        let pending = &mut self.pending;
        self.candidates.retain(|&handle| {
            let Some(object) = objects.get_mut(handle) else {
                return false;
            };
            if object.is_marked() {
                return true;
            }
            object.finalize = FinalizeState::Pending;
            pending.push_back(handle);
            false
        });
        let queued = self.pending.len() - start;
        for &handle in self.pending.iter().skip(start) {
            tracer.mark(objects, handle);
        }
        self.total_queued += queued as u64;
        queued
    }

    /// Drops records of objects reclaimed by the sweep.
    pub fn prune_swept(&mut self, objects: &ObjectTable) {
        self.finalized.retain(|&handle| objects.contains(handle));
        self.candidates.retain(|&handle| objects.contains(handle));
    }

    /// Moves the oldest pending object to the running set.
    pub fn start_next(&mut self) -> Option<ObjectRef> {
        let handle = self.pending.pop_front()?;
        self.in_flight.push(handle);
        Some(handle)
    }

    /// Records a completed finalizer.
    pub fn complete(&mut self, handle: ObjectRef, objects: &mut ObjectTable) {
        self.in_flight.retain(|&h| h != handle);
        if let Some(object) = objects.get_mut(handle) {
            object.finalize = FinalizeState::Finalized;
            self.finalized.push(handle);
        }
        self.total_completed += 1;
    }

    /// No finalizer is queued or running.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> FinalizationStats {
        FinalizationStats {
            armed: self.candidates.len(),
            pending: self.pending.len(),
            running: self.in_flight.len(),
            finalized: self.finalized.len(),
            total_queued: self.total_queued,
            total_completed: self.total_completed,
        }
    }
}

// ============================================================================
// Worker threads
// ============================================================================

/// Starts the finalizer threads of a heap. If one fails to start, the
/// threads already running are stopped again.
pub(crate) fn spawn_workers(handle: &HeapHandle, count: usize) -> Result<Vec<JoinHandle<()>>> {
    let mut workers = Vec::with_capacity(count);
    for i in 0..count {
        let worker = handle.clone();
        let spawned = thread::Builder::new()
            .name(format!("refgc-finalizer-{i}"))
            .spawn(move || worker_loop(&worker));
        match spawned {
            Ok(join) => workers.push(join),
            Err(err) => {
                stop_workers(handle.shared(), workers);
                return Err(GcError::Spawn(err));
            }
        }
    }
    Ok(workers)
}

fn worker_loop(handle: &HeapHandle) {
    IS_FINALIZER_THREAD.with(|f| f.set(true));
    let mutator = handle.bind_mutator();
    let shared = handle.shared();
    while let Some(object) = mutator.blocking(|| next_pending(shared)) {
        run_one(&mutator, shared, object);
    }
}

fn next_pending(shared: &HeapShared) -> Option<ObjectRef> {
    let mut state = shared.state.lock();
    loop {
        if state.finalization.shutting_down {
            return None;
        }
        if let Some(object) = state.finalization.start_next() {
            return Some(object);
        }
        shared.finalizer_cond.wait(&mut state);
    }
}

fn run_one(mutator: &Mutator, shared: &HeapShared, object: ObjectRef) {
    // The in-flight set keeps `object` alive; rooting it here would count
    // as a resurrection of everything it reaches.
    let _frame = mutator.frame();

    let ty = shared.state.lock().objects.get(object).map(|o| o.ty.clone());
    let failure = ty.as_ref().and_then(|ty| {
        let finalizer = ty.finalizer()?;
        match catch_unwind(AssertUnwindSafe(|| finalizer.finalize(mutator, object))) {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        }
    });

    if let Some(message) = &failure {
        let type_name = ty.as_ref().map_or("<reclaimed>", |ty| ty.name());
        crate::tracing::internal::log_finalizer_failure(type_name, object, message);
    }
    shared.metrics.record_finalizer(failure.is_some());

    {
        let mut guard = shared.state.lock();
        let state = &mut *guard;
        state.finalization.complete(object, &mut state.objects);
    }
    shared.progress_cond.notify_all();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_owned()
    }
}

// ============================================================================
// Waiting and shutdown
// ============================================================================

/// Runs `f` with the calling thread counted as stopped if it is an
/// executing mutator of this heap.
pub(crate) fn while_stopped<R>(shared: &HeapShared, f: impl FnOnce() -> R) -> R {
    let me = current_state(shared.id)
        .filter(|s| s.state() == crate::gc::safepoint::THREAD_STATE_EXECUTING);
    let Some(me) = me else {
        return f();
    };
    shared.coordinator.enter_safe_region(&me);
    let result = f();
    shared.coordinator.leave_safe_region(&me, &shared.pause_log);
    result
}

/// Blocks until no finalizer is queued or running.
///
/// Returns immediately on a finalizer thread, which could otherwise wait on
/// itself.
pub(crate) fn run_finalization(shared: &HeapShared) {
    if is_finalizer_thread() {
        return;
    }
    while_stopped(shared, || {
        let mut state = shared.state.lock();
        while !state.finalization.is_idle() && !state.finalization.shutting_down {
            shared.progress_cond.wait(&mut state);
        }
    });
}

/// Stops the finalizer threads, first draining finalization if
/// finalizers-on-exit is enabled.
pub(crate) fn shutdown(shared: &HeapShared, workers: Vec<JoinHandle<()>>) {
    if shared.run_finalizers_on_exit.load(Ordering::Acquire) {
        for _ in 0..shared.config.exit_collection_limit {
            let queued = gc::collect(shared, CollectionCause::Shutdown)
                .map_or(0, |m| m.finalizers_queued);
            run_finalization(shared);
            if queued == 0 {
                break;
            }
        }
    }

    stop_workers(shared, workers);
}

fn stop_workers(shared: &HeapShared, workers: Vec<JoinHandle<()>>) {
    shared.state.lock().finalization.shutting_down = true;
    shared.finalizer_cond.notify_all();
    shared.progress_cond.notify_all();

    while_stopped(shared, || {
        for worker in workers {
            if worker.join().is_err() {
                crate::tracing::internal::log_finalizer_thread_panic();
            }
        }
    });
}
