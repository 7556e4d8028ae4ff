//! Weak, soft and phantom references.
//!
//! A [`Reference`] is a collector-visible record whose referent slot does
//! not keep its referent alive. When a trace finds the referent unreachable
//! the record is processed according to its [`ReferenceKind`] and, if it was
//! created with a [`ReferenceQueue`], enqueued exactly once.
//!
//! Records created by the same heap are tracked in a registry of weak
//! pointers; a record dropped by every owner simply disappears from it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::object::ObjectRef;

/// Strength of a reference record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// Cleared only when memory is tight or the referent has gone unread
    /// for several collections.
    Soft,
    /// Cleared at the first trace that finds the referent not strongly
    /// reachable.
    Weak,
    /// Never yields its referent; enqueued once the referent is unreachable
    /// and any finalizer on it has completed.
    Phantom,
}

/// Lifecycle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReferenceState {
    /// Watching its referent.
    Active,
    /// Sitting on its queue.
    Enqueued,
    /// Removed from its queue by a poll.
    Dequeued,
    /// Cleared without being enqueued; never enqueued afterwards.
    Inactive,
}

#[derive(Debug)]
pub(crate) struct ReferenceSlot {
    pub referent: Option<ObjectRef>,
    pub state: ReferenceState,
    /// Collection count at the last read through `get`.
    pub last_access: u64,
}

pub(crate) struct ReferenceInner {
    id: u64,
    heap_id: usize,
    kind: ReferenceKind,
    slot: Mutex<ReferenceSlot>,
    queue: Option<ReferenceQueue>,
}

/// A weak, soft or phantom reference to a managed object.
///
/// Cloning a `Reference` clones the handle; all clones name the same record.
#[derive(Clone)]
pub struct Reference {
    inner: Arc<ReferenceInner>,
}

impl Reference {
    pub(crate) fn new(
        heap_id: usize,
        id: u64,
        kind: ReferenceKind,
        referent: ObjectRef,
        queue: Option<ReferenceQueue>,
        cycle: u64,
    ) -> Self {
        Self {
            inner: Arc::new(ReferenceInner {
                id,
                heap_id,
                kind,
                slot: Mutex::new(ReferenceSlot {
                    referent: Some(referent),
                    state: ReferenceState::Active,
                    last_access: cycle,
                }),
                queue,
            }),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ReferenceKind {
        self.inner.kind
    }

    /// Heap-unique record id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn heap_id(&self) -> usize {
        self.inner.heap_id
    }

    /// Whether both handles name the same record.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Clears the referent slot. A record cleared this way is never
    /// enqueued. Clearing twice is a no-op.
    pub fn clear(&self) {
        let mut slot = self.inner.slot.lock();
        slot.referent = None;
        if slot.state == ReferenceState::Active {
            slot.state = ReferenceState::Inactive;
        }
    }

    /// Whether the record currently sits on its queue.
    #[must_use]
    pub fn is_enqueued(&self) -> bool {
        self.inner.slot.lock().state == ReferenceState::Enqueued
    }

    /// Whether the record still watches its referent.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.slot.lock().state == ReferenceState::Active
    }

    /// Clears the referent and enqueues the record now.
    ///
    /// Returns `false` if the record has no queue or has already been
    /// enqueued or cleared; the collector will not enqueue it a second time.
    pub fn enqueue(&self) -> bool {
        let Some(queue) = &self.inner.queue else {
            return false;
        };
        {
            let mut slot = self.inner.slot.lock();
            if slot.state != ReferenceState::Active {
                return false;
            }
            slot.referent = None;
            slot.state = ReferenceState::Enqueued;
        }
        queue.push(self.clone());
        true
    }

    /// Whether the referent slot names `object`.
    ///
    /// Works for every kind, phantom included, and never makes the referent
    /// reachable.
    #[must_use]
    pub fn refers_to(&self, object: ObjectRef) -> bool {
        self.inner.slot.lock().referent == Some(object)
    }

    /// Reads the referent for `get`, stamping the access cycle.
    pub(crate) fn read(&self, cycle: u64) -> Option<ObjectRef> {
        if self.inner.kind == ReferenceKind::Phantom {
            return None;
        }
        let mut slot = self.inner.slot.lock();
        if slot.state != ReferenceState::Active {
            return None;
        }
        slot.last_access = cycle;
        slot.referent
    }

    /// Collector side: the referent died.
    ///
    /// Weak and soft records drop their referent; phantom records keep the
    /// dead handle in their slot. Records with a queue are enqueued, the
    /// rest become inactive. Returns whether the record was enqueued.
    pub(crate) fn retire(&self) -> bool {
        {
            let mut slot = self.inner.slot.lock();
            if slot.state != ReferenceState::Active {
                return false;
            }
            if self.inner.kind != ReferenceKind::Phantom {
                slot.referent = None;
            }
            slot.state = if self.inner.queue.is_some() {
                ReferenceState::Enqueued
            } else {
                ReferenceState::Inactive
            };
        }
        match &self.inner.queue {
            Some(queue) => {
                queue.push(self.clone());
                true
            }
            None => false,
        }
    }

    pub(crate) fn inner_slot(&self) -> MutexGuard<'_, ReferenceSlot> {
        self.inner.slot.lock()
    }

    fn downgrade(&self) -> Weak<ReferenceInner> {
        Arc::downgrade(&self.inner)
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl Eq for Reference {}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("Reference")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("referent", &slot.referent)
            .field("state", &slot.state)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ReferenceQueue
// ============================================================================

#[derive(Default)]
struct QueueInner {
    items: SegQueue<Reference>,
    lock: Mutex<()>,
    cond: Condvar,
}

/// FIFO of references whose referents have died.
///
/// Polling never blocks. [`remove`](Self::remove) does: call it through
/// [`Mutator::blocking`](crate::Mutator::blocking) on a mutator thread so a
/// collection can proceed while the thread waits.
#[derive(Clone, Default)]
pub struct ReferenceQueue {
    inner: Arc<QueueInner>,
}

impl ReferenceQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes the oldest enqueued reference, if any.
    #[must_use]
    pub fn poll(&self) -> Option<Reference> {
        let reference = self.inner.items.pop()?;
        {
            let mut slot = reference.inner.slot.lock();
            if slot.state == ReferenceState::Enqueued {
                slot.state = ReferenceState::Dequeued;
            }
        }
        Some(reference)
    }

    /// Waits up to `timeout` for a reference to be enqueued.
    #[must_use]
    pub fn remove(&self, timeout: Duration) -> Option<Reference> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        loop {
            if let Some(reference) = self.poll() {
                return Some(reference);
            }
            if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                return self.poll();
            }
        }
    }

    /// Number of references waiting to be polled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.items.is_empty()
    }

    fn push(&self, reference: Reference) {
        self.inner.items.push(reference);
        let _guard = self.inner.lock.lock();
        self.inner.cond.notify_all();
    }
}

impl fmt::Debug for ReferenceQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceQueue")
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// ReferenceRegistry
// ============================================================================

/// Every record created by one heap, held weakly.
#[derive(Default)]
pub(crate) struct ReferenceRegistry {
    records: Mutex<Vec<Weak<ReferenceInner>>>,
    next_id: AtomicU64,
}

impl ReferenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, reference: &Reference) {
        self.records.lock().push(reference.downgrade());
    }

    /// Active records, pruning dropped and retired ones.
    pub fn active(&self) -> Vec<Reference> {
        let mut records = self.records.lock();
        let mut active = Vec::with_capacity(records.len());
        records.retain(|weak| {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            let reference = Reference { inner };
            if reference.is_active() {
                active.push(reference);
                true
            } else {
                false
            }
        });
        active
    }

    /// Number of tracked records, dead ones included until the next prune.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}
