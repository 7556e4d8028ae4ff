//! Mutator threads.
//!
//! Every thread that touches the heap binds a [`Mutator`]. The mutator owns
//! the thread's root stack and is how the thread takes part in pauses: it
//! polls at [`safepoint`](Mutator::safepoint) (every allocation does so too)
//! and wraps anything that may block in [`blocking`](Mutator::blocking).
//!
//! Handles returned by allocation and by [`Mutator::reference_get`] are
//! rooted in the innermost open [`Frame`]. A handle that is neither rooted
//! nor stored in a reachable object may be reclaimed by the next collection.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::descriptor::TypeRef;
use crate::error::{GcError, Result, SpaceKind};
use crate::finalizer;
use crate::gc::safepoint::{MutatorState, PauseCoordinator, THREAD_STATE_EXECUTING};
use crate::gc::{self, pause::PauseLog, CollectionCause};
use crate::heap::Spaces;
use crate::metrics::GcMetrics;
use crate::object::ObjectRef;
use crate::reference::{Reference, ReferenceKind, ReferenceQueue};
use crate::runtime::HeapHandle;

/// Collection attempts before an allocation reports out-of-memory. Joining
/// another thread's collection uses one up.
const ALLOCATION_COLLECTIONS: usize = 2;

/// Identifier of a mutator thread, unique within its heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutatorId(u64);

impl MutatorId {
    pub(crate) const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MutatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mutator-{}", self.0)
    }
}

thread_local! {
    /// Mutators bound on this thread, keyed by heap id.
    static ATTACHED: RefCell<Vec<(usize, Arc<MutatorState>)>> = const { RefCell::new(Vec::new()) };
}

/// State of the calling thread's mutator for `heap_id`, if bound.
pub(crate) fn current_state(heap_id: usize) -> Option<Arc<MutatorState>> {
    ATTACHED
        .try_with(|attached| {
            attached
                .borrow()
                .iter()
                .find(|(id, _)| *id == heap_id)
                .map(|(_, state)| Arc::clone(state))
        })
        .ok()
        .flatten()
}

/// A thread's binding to one heap.
///
/// `!Send`: a mutator stays on the thread that bound it.
pub struct Mutator {
    heap: HeapHandle,
    state: Arc<MutatorState>,
    _not_send: PhantomData<*const ()>,
}

impl Mutator {
    pub(crate) fn bind(heap: HeapHandle) -> Self {
        let shared = heap.shared();
        assert!(
            current_state(shared.id).is_none(),
            "thread is already bound to heap {}",
            shared.id
        );
        let state = Arc::new(MutatorState::new(MutatorId::from_raw(
            shared.next_mutator_id(),
        )));
        shared.coordinator.register(Arc::clone(&state));
        ATTACHED.with(|attached| {
            attached
                .borrow_mut()
                .push((shared.id, Arc::clone(&state)));
        });
        Self {
            heap,
            state,
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub fn id(&self) -> MutatorId {
        self.state.id
    }

    #[must_use]
    pub fn heap(&self) -> &HeapHandle {
        &self.heap
    }

    fn coordinator(&self) -> &PauseCoordinator {
        &self.heap.shared().coordinator
    }

    fn pause_log(&self) -> &PauseLog {
        &self.heap.shared().pause_log
    }

    fn assert_executing(&self) {
        assert_eq!(
            self.state.state(),
            THREAD_STATE_EXECUTING,
            "heap accessed from inside a blocking region"
        );
    }

    // ========================================================================
    // Roots
    // ========================================================================

    /// Opens a root frame. Handles rooted while the frame is open are
    /// unrooted when it drops.
    #[must_use]
    pub fn frame(&self) -> Frame<'_> {
        let depth = self.state.roots.lock().push_frame();
        Frame {
            mutator: self,
            depth,
        }
    }

    /// Roots `object` in the innermost open frame (or the base frame, which
    /// lives as long as the mutator).
    pub fn root(&self, object: ObjectRef) {
        self.state.roots.lock().push(object);
    }

    /// Number of handles rooted by this mutator.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.state.roots.lock().len()
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocates an instance of a non-array type, zero-initialized.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if the object does not fit after collecting,
    /// [`GcError::NotAnInstance`] for array types, and [`GcError::ShutDown`]
    /// once the heap has shut down.
    pub fn alloc(&self, ty: &TypeRef) -> Result<ObjectRef> {
        self.allocate(ty, None)
    }

    /// Allocates an array of `len` elements, zero-initialized.
    ///
    /// # Errors
    ///
    /// As [`alloc`](Self::alloc), with [`GcError::NotAnArray`] for instance
    /// types and [`GcError::SizeOverflow`] if the size overflows.
    pub fn alloc_array(&self, ty: &TypeRef, len: usize) -> Result<ObjectRef> {
        self.allocate(ty, Some(len))
    }

    fn allocate(&self, ty: &TypeRef, len: Option<usize>) -> Result<ObjectRef> {
        self.assert_executing();
        self.safepoint();
        let shared = self.heap.shared();
        if shared.is_shut_down() {
            return Err(GcError::ShutDown);
        }
        let layout = ty.layout(len)?;
        if !shared.can_ever_fit(layout.size) {
            return Err(self.out_of_memory(layout.size, Spaces::space_for(layout.size)));
        }

        let mut collections = 0;
        let handle = loop {
            match shared.try_allocate(ty, &layout) {
                Ok(handle) => break handle,
                Err(space) if collections >= ALLOCATION_COLLECTIONS => {
                    return Err(self.out_of_memory(layout.size, space));
                }
                Err(_) => {
                    // Running our own collection leaves a single retry.
                    collections += 1;
                    if gc::collect(shared, CollectionCause::AllocationFailure).is_some() {
                        collections = ALLOCATION_COLLECTIONS;
                    }
                }
            }
        };
        self.root(handle);

        if shared.should_collect() {
            gc::collect(shared, CollectionCause::Threshold);
        }
        Ok(handle)
    }

    fn out_of_memory(&self, requested: usize, space: SpaceKind) -> GcError {
        self.heap.shared().metrics.record_allocation_failure();
        crate::tracing::internal::log_out_of_memory(requested, space);
        GcError::OutOfMemory { requested, space }
    }

    // ========================================================================
    // Object access
    // ========================================================================

    /// Reads reference field (or reference-array element) `index`.
    ///
    /// # Errors
    ///
    /// [`GcError::StaleHandle`] or [`GcError::FieldOutOfBounds`].
    pub fn get_field(&self, object: ObjectRef, index: usize) -> Result<Option<ObjectRef>> {
        self.assert_executing();
        let state = self.heap.shared().state.lock();
        let obj = state
            .objects
            .get(object)
            .ok_or(GcError::StaleHandle(object))?;
        obj.fields
            .get(index)
            .copied()
            .ok_or(GcError::FieldOutOfBounds {
                index,
                len: obj.fields.len(),
            })
    }

    /// Writes reference field (or reference-array element) `index`.
    ///
    /// # Errors
    ///
    /// [`GcError::StaleHandle`] if `object` or `value` has been reclaimed,
    /// [`GcError::FieldOutOfBounds`] for a bad index.
    pub fn set_field(
        &self,
        object: ObjectRef,
        index: usize,
        value: Option<ObjectRef>,
    ) -> Result<()> {
        self.assert_executing();
        let mut state = self.heap.shared().state.lock();
        if let Some(value) = value {
            if !state.objects.contains(value) {
                return Err(GcError::StaleHandle(value));
            }
        }
        let obj = state
            .objects
            .get_mut(object)
            .ok_or(GcError::StaleHandle(object))?;
        let len = obj.fields.len();
        let slot = obj
            .fields
            .get_mut(index)
            .ok_or(GcError::FieldOutOfBounds { index, len })?;
        *slot = value;
        Ok(())
    }

    /// Element count of an array object.
    ///
    /// # Errors
    ///
    /// [`GcError::StaleHandle`] or [`GcError::NotAnArray`].
    pub fn array_length(&self, object: ObjectRef) -> Result<usize> {
        let state = self.heap.shared().state.lock();
        let obj = state
            .objects
            .get(object)
            .ok_or(GcError::StaleHandle(object))?;
        obj.array_len
            .ok_or_else(|| GcError::NotAnArray(obj.ty.name().to_owned()))
    }

    /// Copies data bytes starting at `offset` into `buf`.
    ///
    /// # Errors
    ///
    /// [`GcError::StaleHandle`] or [`GcError::DataOutOfBounds`].
    pub fn read_bytes(&self, object: ObjectRef, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.assert_executing();
        let state = self.heap.shared().state.lock();
        let obj = state
            .objects
            .get(object)
            .ok_or(GcError::StaleHandle(object))?;
        check_range(offset, buf.len(), obj.data_len)?;
        buf.copy_from_slice(
            state
                .spaces
                .bytes(&obj.placement, obj.data_offset + offset, buf.len()),
        );
        Ok(())
    }

    /// Copies `data` into the object's data bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// [`GcError::StaleHandle`] or [`GcError::DataOutOfBounds`].
    pub fn write_bytes(&self, object: ObjectRef, offset: usize, data: &[u8]) -> Result<()> {
        self.assert_executing();
        let mut guard = self.heap.shared().state.lock();
        let state = &mut *guard;
        let obj = state
            .objects
            .get(object)
            .ok_or(GcError::StaleHandle(object))?;
        check_range(offset, data.len(), obj.data_len)?;
        let (placement, start) = (obj.placement, obj.data_offset + offset);
        state
            .spaces
            .bytes_mut(&placement, start, data.len())
            .copy_from_slice(data);
        Ok(())
    }

    /// Reads a little-endian `u64` from the data bytes.
    ///
    /// # Errors
    ///
    /// See [`read_bytes`](Self::read_bytes).
    pub fn read_u64(&self, object: ObjectRef, offset: usize) -> Result<u64> {
        let mut buf = [0; 8];
        self.read_bytes(object, offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Writes a little-endian `u64` into the data bytes.
    ///
    /// # Errors
    ///
    /// See [`write_bytes`](Self::write_bytes).
    pub fn write_u64(&self, object: ObjectRef, offset: usize, value: u64) -> Result<()> {
        self.write_bytes(object, offset, &value.to_le_bytes())
    }

    /// Exact size of the object in bytes, header included.
    ///
    /// # Errors
    ///
    /// [`GcError::StaleHandle`] if `object` has been reclaimed.
    pub fn size_of(&self, object: ObjectRef) -> Result<usize> {
        let state = self.heap.shared().state.lock();
        state
            .objects
            .get(object)
            .map(|o| o.size)
            .ok_or(GcError::StaleHandle(object))
    }

    /// # Errors
    ///
    /// [`GcError::StaleHandle`] if `object` has been reclaimed.
    pub fn type_of(&self, object: ObjectRef) -> Result<TypeRef> {
        let state = self.heap.shared().state.lock();
        state
            .objects
            .get(object)
            .map(|o| Arc::clone(&o.ty))
            .ok_or(GcError::StaleHandle(object))
    }

    /// Whether `object` has not been reclaimed.
    #[must_use]
    pub fn is_alive(&self, object: ObjectRef) -> bool {
        self.heap.shared().state.lock().objects.contains(object)
    }

    // ========================================================================
    // References
    // ========================================================================

    /// Creates a reference record watching `referent`. If `queue` is given,
    /// the record is enqueued there once the referent dies.
    ///
    /// # Errors
    ///
    /// [`GcError::StaleHandle`] if `referent` has been reclaimed.
    pub fn create_reference(
        &self,
        kind: ReferenceKind,
        referent: ObjectRef,
        queue: Option<&ReferenceQueue>,
    ) -> Result<Reference> {
        self.assert_executing();
        let shared = self.heap.shared();
        if !shared.state.lock().objects.contains(referent) {
            return Err(GcError::StaleHandle(referent));
        }
        let reference = Reference::new(
            shared.id,
            shared.references.next_id(),
            kind,
            referent,
            queue.cloned(),
            shared.cycle(),
        );
        shared.references.register(&reference);
        Ok(reference)
    }

    /// Returns the referent of a soft or weak reference, rooted in the
    /// current frame, or `None` once cleared. Phantom references and
    /// references of another heap always yield `None`.
    #[must_use]
    pub fn reference_get(&self, reference: &Reference) -> Option<ObjectRef> {
        self.assert_executing();
        let shared = self.heap.shared();
        if reference.heap_id() != shared.id {
            return None;
        }
        let referent = reference.read(shared.cycle())?;
        self.root(referent);
        Some(referent)
    }

    // ========================================================================
    // Pause participation
    // ========================================================================

    /// Stops here if a collection is pending, and picks up asynchronous
    /// collection requests.
    pub fn safepoint(&self) {
        self.assert_executing();
        let shared = self.heap.shared();
        if shared.collection_requested.load(Ordering::Acquire)
            && shared.collection_requested.swap(false, Ordering::AcqRel)
        {
            gc::collect(shared, CollectionCause::Requested);
            return;
        }
        self.coordinator().safepoint(&self.state, self.pause_log());
    }

    /// Runs `f` in a safe region: collections may proceed while it runs.
    ///
    /// `f` must not touch the heap through this mutator. Use it around
    /// anything that can block, such as waiting on a lock, a channel or
    /// [`ReferenceQueue::remove`].
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.assert_executing();
        self.coordinator().enter_safe_region(&self.state);
        let _region = SafeRegion { mutator: self };
        f()
    }

    /// Acquires `mutex`, parking in a safe region while it is contended.
    pub fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        if let Some(guard) = mutex.try_lock() {
            return guard;
        }
        self.blocking(|| mutex.lock())
    }

    /// Runs a full collection. See [`HeapHandle::collect`].
    #[allow(clippy::must_use_candidate)]
    pub fn collect(&self) -> Option<GcMetrics> {
        self.assert_executing();
        gc::collect(self.heap.shared(), CollectionCause::Explicit)
    }

    /// Blocks until every queued finalizer has run.
    pub fn run_finalization(&self) {
        self.assert_executing();
        finalizer::run_finalization(self.heap.shared());
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let shared = self.heap.shared();
        shared.coordinator.unregister(self.state.id);
        let heap_id = shared.id;
        let _ = ATTACHED.try_with(|attached| {
            attached.borrow_mut().retain(|(id, _)| *id != heap_id);
        });
    }
}

impl fmt::Debug for Mutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.state.id)
            .field("heap", &self.heap.id())
            .finish_non_exhaustive()
    }
}

fn check_range(offset: usize, len: usize, data_len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= data_len => Ok(()),
        end => Err(GcError::DataOutOfBounds {
            offset,
            end: end.unwrap_or(usize::MAX),
            len: data_len,
        }),
    }
}

struct SafeRegion<'m> {
    mutator: &'m Mutator,
}

impl Drop for SafeRegion<'_> {
    fn drop(&mut self) {
        self.mutator
            .coordinator()
            .leave_safe_region(&self.mutator.state, self.mutator.pause_log());
    }
}

/// A root frame; see [`Mutator::frame`].
pub struct Frame<'m> {
    mutator: &'m Mutator,
    depth: usize,
}

impl Frame<'_> {
    /// Nesting depth, starting at 1.
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        self.mutator.state.roots.lock().pop_frame(self.depth);
    }
}
