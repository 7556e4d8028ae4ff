//! Tri-color marking.
//!
//! White objects have not been reached, grey ones are on the worklist with
//! unscanned fields, black ones are done. Only reference fields and
//! reference-array elements are followed; referent slots of
//! [`Reference`](crate::Reference) records live outside the object graph and
//! never contribute to reachability.

use crate::object::{Color, ObjectRef, ObjectTable};

/// Where a root came from, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RootKind {
    Global,
    Frame,
    Finalization,
}

/// Sizes of the four classes a trace partitions the heap into.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Classification {
    /// Reached from roots (including policy-retained soft referents).
    pub strongly_reachable: usize,
    /// Kept alive only because a finalizer is pending on them or on an
    /// object that reaches them.
    pub finalizer_pending: usize,
    /// Unmarked; reclaimed by this collection.
    pub reclaimable: usize,
    /// Reference records whose referent died in this collection.
    pub reference_dead: usize,
}

/// Explicit grey worklist.
#[derive(Debug, Default)]
pub(crate) struct Tracer {
    worklist: Vec<ObjectRef>,
    marked: usize,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Objects greyed so far.
    pub const fn marked(&self) -> usize {
        self.marked
    }

    /// Greys a root.
    ///
    /// # Panics
    ///
    /// A root naming a reclaimed object means the root set is corrupt.
    pub fn mark_root(&mut self, objects: &mut ObjectTable, handle: ObjectRef, kind: RootKind) {
        assert!(
            objects.contains(handle),
            "{kind:?} root {handle} names a reclaimed object"
        );
        self.mark(objects, handle);
    }

    /// Greys `handle` if it is white. Returns whether it was newly greyed.
    pub fn mark(&mut self, objects: &mut ObjectTable, handle: ObjectRef) -> bool {
        let Some(object) = objects.get_mut(handle) else {
            return false;
        };
        if object.color != Color::White {
            return false;
        }
        object.color = Color::Grey;
        self.worklist.push(handle);
        self.marked += 1;
        true
    }

    /// Scans grey objects until the worklist is empty.
    ///
    /// # Panics
    ///
    /// Panics if a reachable object holds a handle to a reclaimed object.
    pub fn drain(&mut self, objects: &mut ObjectTable) {
        while let Some(handle) = self.worklist.pop() {
            let field_count = objects.get(handle).map_or(0, |o| o.fields.len());
            for i in 0..field_count {
                let child = objects.get(handle).and_then(|o| o.fields[i]);
                if let Some(child) = child {
                    assert!(
                        objects.contains(child),
                        "object {handle} field {i} names reclaimed object {child}"
                    );
                    self.mark(objects, child);
                }
            }
            if let Some(object) = objects.get_mut(handle) {
                object.color = Color::Black;
            }
        }
    }
}

/// Resets every object to white.
pub(crate) fn clear_marks(objects: &mut ObjectTable) {
    for (_, object) in objects.iter_mut() {
        object.color = Color::White;
    }
}

/// Whether `handle` names a live, marked object.
pub(crate) fn is_marked(objects: &ObjectTable, handle: ObjectRef) -> bool {
    objects.get(handle).is_some_and(|o| o.is_marked())
}
