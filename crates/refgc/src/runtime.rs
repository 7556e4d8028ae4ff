//! Heap ownership and the shared runtime state.
//!
//! A [`Heap`] owns the spaces, the object table, the root tables and the
//! finalizer threads. [`HeapHandle`] is the cheap, cloneable, `Send + Sync`
//! view that everything else holds; mutator threads bind to a heap through
//! it.
//!
//! Lock order: the pause coordinator's lock is never requested while the
//! heap state lock is held.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::config::GcConfig;
use crate::descriptor::{ObjectLayout, TypeRef};
use crate::error::{GcError, Result, SpaceKind};
use crate::finalizer::{self, FinalizationQueue, FinalizationStats};
use crate::gc::pause::{PauseLog, PauseReport};
use crate::gc::safepoint::PauseCoordinator;
use crate::gc::{self, default_collect_condition, CollectCondition, CollectInfo, CollectionCause};
use crate::heap::{HeapUsage, Spaces};
use crate::metrics::{CumulativeMetrics, GcHistory, GcMetrics};
use crate::mutator::Mutator;
use crate::object::{Color, FinalizeState, HeapObject, ObjectRef, ObjectTable};
use crate::reference::ReferenceRegistry;
use crate::roots::{GlobalId, GlobalRoots};

static NEXT_HEAP_ID: AtomicUsize = AtomicUsize::new(1);

/// Everything guarded by the heap lock.
pub(crate) struct HeapState {
    pub spaces: Spaces,
    pub objects: ObjectTable,
    pub globals: GlobalRoots,
    pub finalization: FinalizationQueue,
    /// Block bytes allocated since the last collection.
    pub allocated_since_gc: usize,
}

pub(crate) struct HeapShared {
    pub id: usize,
    pub config: GcConfig,
    pub state: Mutex<HeapState>,
    pub coordinator: PauseCoordinator,
    pub references: ReferenceRegistry,
    pub pause_log: PauseLog,
    pub metrics: CumulativeMetrics,
    pub history: GcHistory,
    pub last_metrics: Mutex<GcMetrics>,
    /// Signalled when finalizers are queued or shutdown begins. Waits on
    /// `state`.
    pub finalizer_cond: Condvar,
    /// Signalled when a finalizer completes. Waits on `state`.
    pub progress_cond: Condvar,
    pub collect_condition: Mutex<CollectCondition>,
    /// Set by an asynchronous collection request; cleared by the mutator
    /// that picks it up.
    pub collection_requested: AtomicBool,
    pub run_finalizers_on_exit: AtomicBool,
    shutting_down: AtomicBool,
    shut_down: AtomicBool,
    next_mutator_id: AtomicU64,
    /// Completed collections; also the clock of soft-reference aging.
    pub cycles: AtomicU64,
}

impl HeapShared {
    pub fn next_mutator_id(&self) -> u64 {
        self.next_mutator_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn cycle(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }

    pub fn can_ever_fit(&self, size: usize) -> bool {
        self.state.lock().spaces.can_ever_fit(size)
    }

    /// Places and registers one object. On failure names the exhausted
    /// space; nothing is modified then.
    pub fn try_allocate(
        &self,
        ty: &TypeRef,
        layout: &ObjectLayout,
    ) -> std::result::Result<ObjectRef, SpaceKind> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let placement = state.spaces.allocate(layout.size)?;
        let finalizable = ty.is_finalizable();
        let handle = state.objects.insert(HeapObject {
            ty: Arc::clone(ty),
            size: layout.size,
            placement,
            fields: vec![None; layout.reference_slots].into_boxed_slice(),
            array_len: layout.array_len,
            data_offset: layout.data_offset,
            data_len: layout.data_len,
            color: Color::White,
            finalize: if finalizable {
                FinalizeState::Armed
            } else {
                FinalizeState::None
            },
        });
        state
            .spaces
            .init_block(&placement, handle.index(), layout.size, layout.array_len);
        if finalizable {
            state.finalization.register(handle);
        }
        state.allocated_since_gc += placement.block;
        Ok(handle)
    }

    pub fn collect_info(&self) -> CollectInfo {
        let state = self.state.lock();
        CollectInfo {
            allocated_since_collect: state.allocated_since_gc,
            threshold: self.config.collect_threshold_bytes,
            usage: state.spaces.usage(),
            live_objects: state.objects.len(),
            pending_finalizers: state.finalization.pending_len(),
            collections: self.cycle(),
        }
    }

    pub fn should_collect(&self) -> bool {
        let condition = *self.collect_condition.lock();
        condition(&self.collect_info())
    }
}

// ============================================================================
// HeapHandle
// ============================================================================

/// Shared handle to a heap.
///
/// Handles keep the heap's memory alive but not its finalizer threads; the
/// owning [`Heap`] shuts those down when dropped.
#[derive(Clone)]
pub struct HeapHandle {
    shared: Arc<HeapShared>,
}

impl HeapHandle {
    pub(crate) fn shared(&self) -> &HeapShared {
        &self.shared
    }

    /// Heap-unique id.
    #[must_use]
    pub fn id(&self) -> usize {
        self.shared.id
    }

    #[must_use]
    pub fn config(&self) -> &GcConfig {
        &self.shared.config
    }

    /// Registers the calling thread as a mutator of this heap.
    ///
    /// # Panics
    ///
    /// Panics if the thread is already bound to this heap.
    #[must_use]
    pub fn bind_mutator(&self) -> Mutator {
        Mutator::bind(self.clone())
    }

    /// Runs a full collection now. Returns `None` if another thread was
    /// already collecting; that collection has completed on return.
    #[allow(clippy::must_use_candidate)]
    pub fn collect(&self) -> Option<GcMetrics> {
        gc::collect(&self.shared, CollectionCause::Explicit)
    }

    /// Requests a collection. A synchronous request collects on the calling
    /// thread; an asynchronous one is picked up by the next mutator to reach
    /// a safepoint.
    pub fn request_collection(&self, synchronous: bool) {
        if synchronous {
            gc::collect(&self.shared, CollectionCause::Explicit);
        } else {
            self.shared
                .collection_requested
                .store(true, Ordering::Release);
        }
    }

    /// Blocks until every queued finalizer has run.
    pub fn run_finalization(&self) {
        finalizer::run_finalization(&self.shared);
    }

    /// Collects and runs finalizers until a collection queues no new ones or
    /// `max_rounds` is reached. Returns the number of collections run.
    pub fn collect_and_finalize(&self, max_rounds: usize) -> usize {
        let mut rounds = 0;
        while rounds < max_rounds {
            rounds += 1;
            let queued = gc::collect(&self.shared, CollectionCause::Explicit)
                .map_or(0, |m| m.finalizers_queued);
            self.run_finalization();
            if queued == 0 {
                break;
            }
        }
        rounds
    }

    /// Whether shutdown collects and finalizes before stopping the
    /// finalizer threads. Off by default.
    pub fn set_run_finalizers_on_exit(&self, enabled: bool) {
        self.shared
            .run_finalizers_on_exit
            .store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn run_finalizers_on_exit(&self) -> bool {
        self.shared.run_finalizers_on_exit.load(Ordering::Acquire)
    }

    /// Bytes not charged to any live block.
    #[must_use]
    pub fn free_memory(&self) -> usize {
        self.usage().free()
    }

    /// Bytes the heap currently manages.
    #[must_use]
    pub fn total_memory(&self) -> usize {
        self.usage().capacity()
    }

    /// Bytes the heap may ever manage. Spaces are reserved up front, so this
    /// equals [`total_memory`](Self::total_memory).
    #[must_use]
    pub fn max_memory(&self) -> usize {
        self.usage().capacity()
    }

    #[must_use]
    pub fn usage(&self) -> HeapUsage {
        self.shared.state.lock().spaces.usage()
    }

    /// Number of objects in the heap, unreclaimed garbage included.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.shared.state.lock().objects.len()
    }

    /// Roots `object` in the global table.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::StaleHandle`] if `object` has been reclaimed.
    pub fn add_global(&self, object: ObjectRef) -> Result<GlobalId> {
        let mut state = self.shared.state.lock();
        if !state.objects.contains(object) {
            return Err(GcError::StaleHandle(object));
        }
        Ok(state.globals.insert(object))
    }

    /// Unroots a global slot, returning its last value.
    #[allow(clippy::must_use_candidate)]
    pub fn remove_global(&self, id: GlobalId) -> Option<ObjectRef> {
        self.shared.state.lock().globals.remove(id)
    }

    #[must_use]
    pub fn global(&self, id: GlobalId) -> Option<ObjectRef> {
        self.shared.state.lock().globals.get(id)
    }

    /// Replaces the object held in a global slot. Returns `false` if the
    /// slot was removed.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::StaleHandle`] if `object` has been reclaimed.
    pub fn set_global(&self, id: GlobalId, object: ObjectRef) -> Result<bool> {
        let mut state = self.shared.state.lock();
        if !state.objects.contains(object) {
            return Err(GcError::StaleHandle(object));
        }
        Ok(state.globals.set(id, object))
    }

    /// Replaces the condition checked after each allocation.
    pub fn set_collect_condition(&self, condition: CollectCondition) {
        *self.shared.collect_condition.lock() = condition;
    }

    #[must_use]
    pub fn collect_info(&self) -> CollectInfo {
        self.shared.collect_info()
    }

    /// Totals over the heap's lifetime.
    #[must_use]
    pub fn metrics(&self) -> &CumulativeMetrics {
        &self.shared.metrics
    }

    /// Metrics of the most recent collection.
    #[must_use]
    pub fn last_gc_metrics(&self) -> GcMetrics {
        *self.shared.last_metrics.lock()
    }

    #[must_use]
    pub fn gc_history(&self) -> &GcHistory {
        &self.shared.history
    }

    /// Per-thread longest pauses and aggregated system pauses.
    #[must_use]
    pub fn pause_report(&self) -> PauseReport {
        self.shared.pause_log.report()
    }

    #[must_use]
    pub fn finalization_stats(&self) -> FinalizationStats {
        self.shared.state.lock().finalization.stats()
    }

    /// Registered mutator threads, finalizer threads included.
    #[must_use]
    pub fn mutator_count(&self) -> usize {
        self.shared.coordinator.thread_count()
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }
}

impl std::fmt::Debug for HeapHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapHandle")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Heap
// ============================================================================

/// An owned heap. Dropping it shuts the heap down.
pub struct Heap {
    handle: HeapHandle,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Heap {
    /// Reserves the spaces and starts the finalizer threads.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidConfig`] if `config` fails validation,
    /// [`GcError::Reserve`] if a space cannot be reserved, and
    /// [`GcError::Spawn`] if a finalizer thread cannot be started.
    pub fn new(config: GcConfig) -> Result<Self> {
        config.validate()?;
        let spaces = Spaces::new(&config)?;
        let shared = Arc::new(HeapShared {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(HeapState {
                spaces,
                objects: ObjectTable::new(),
                globals: GlobalRoots::new(),
                finalization: FinalizationQueue::new(),
                allocated_since_gc: 0,
            }),
            coordinator: PauseCoordinator::new(config.safepoint_timeout),
            references: ReferenceRegistry::new(),
            pause_log: PauseLog::new(config.pause_threshold, config.pause_log_capacity),
            metrics: CumulativeMetrics::new(),
            history: GcHistory::new(),
            last_metrics: Mutex::new(GcMetrics::new()),
            finalizer_cond: Condvar::new(),
            progress_cond: Condvar::new(),
            collect_condition: Mutex::new(default_collect_condition),
            collection_requested: AtomicBool::new(false),
            run_finalizers_on_exit: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            next_mutator_id: AtomicU64::new(1),
            cycles: AtomicU64::new(0),
            config,
        });
        let handle = HeapHandle { shared };
        let workers = finalizer::spawn_workers(&handle, handle.shared.config.finalizer_threads)?;
        Ok(Self {
            handle,
            workers: Mutex::new(workers),
        })
    }

    /// A heap with default configuration.
    ///
    /// # Errors
    ///
    /// See [`Heap::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(GcConfig::default())
    }

    /// A cloneable handle to this heap.
    #[must_use]
    pub fn handle(&self) -> HeapHandle {
        self.handle.clone()
    }

    /// Stops the heap: optionally runs finalizers on exit, then stops the
    /// finalizer threads. Later allocations fail with
    /// [`GcError::ShutDown`]. Calling it again does nothing.
    pub fn shutdown(&self) {
        let shared = &self.handle.shared;
        if shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        finalizer::shutdown(shared, workers);
        shared.shut_down.store(true, Ordering::Release);
    }
}

impl Deref for Heap {
    type Target = HeapHandle;

    fn deref(&self) -> &HeapHandle {
        &self.handle
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("id", &self.handle.shared.id)
            .field("usage", &self.usage())
            .finish_non_exhaustive()
    }
}
