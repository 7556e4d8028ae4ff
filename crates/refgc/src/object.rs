//! Object handles and the object table.
//!
//! Every managed object owns one slot in the [`ObjectTable`]. The slot holds
//! the collector-side metadata (descriptor, placement, reference fields,
//! mark color, finalization state); the payload bytes live in the heap
//! spaces. Handles carry the slot's generation so a handle to a reclaimed
//! object is detected instead of aliasing a newer one.

use std::fmt;

use crate::descriptor::TypeRef;
use crate::error::SpaceKind;

/// Handle to a managed object.
///
/// `ObjectRef` is a plain value: holding one does not keep the object alive.
/// Only roots (frame slots, globals, pending finalization entries) and
/// reference fields of reachable objects do.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    index: u32,
    generation: u32,
}

impl ObjectRef {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) const fn index(self) -> u32 {
        self.index
    }

    /// Reuse counter of the table slot this handle was issued for.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef(#{}.{})", self.index, self.generation)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Tri-color mark state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Color {
    /// Not yet reached in the current trace.
    White,
    /// Reached, fields not yet scanned.
    Grey,
    /// Reached and scanned.
    Black,
}

/// Finalization state of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinalizeState {
    /// The type has no finalizer.
    None,
    /// Live and registered; the finalizer runs at its next death.
    Armed,
    /// Found unreachable; queued for or running its finalizer.
    Pending,
    /// Finalizer completed; reclaimed at the next trace that finds it
    /// unreachable, re-armed if it was resurrected.
    Finalized,
}

/// Where an object's payload block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    pub space: SpaceKind,
    /// Byte offset of the block from the start of its space.
    pub offset: usize,
    /// Rounded block size charged to the space.
    pub block: usize,
}

/// Collector-side metadata of one object.
#[derive(Debug)]
pub(crate) struct HeapObject {
    pub ty: TypeRef,
    /// Exact object size before rounding to the block size.
    pub size: usize,
    pub placement: Placement,
    pub fields: Box<[Option<ObjectRef>]>,
    pub array_len: Option<usize>,
    pub data_offset: usize,
    pub data_len: usize,
    pub color: Color,
    pub finalize: FinalizeState,
}

impl HeapObject {
    #[inline]
    pub const fn is_marked(&self) -> bool {
        !matches!(self.color, Color::White)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    object: Option<HeapObject>,
}

/// Generational slot map from [`ObjectRef`] to [`HeapObject`].
#[derive(Debug, Default)]
pub(crate) struct ObjectTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live objects.
    pub const fn len(&self) -> usize {
        self.live
    }

    /// Stores `object` and returns its handle.
    ///
    /// # Panics
    ///
    /// Panics if the table grows past `u32::MAX` slots.
    pub fn insert(&mut self, object: HeapObject) -> ObjectRef {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.object.is_none());
            slot.object = Some(object);
            return ObjectRef::new(index, slot.generation);
        }
        let Ok(index) = u32::try_from(self.slots.len()) else {
            panic!("object table index overflow");
        };
        self.slots.push(Slot {
            generation: 0,
            object: Some(object),
        });
        ObjectRef::new(index, 0)
    }

    /// Looks up a live object.
    pub fn get(&self, handle: ObjectRef) -> Option<&HeapObject> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.object.as_ref())
    }

    pub fn get_mut(&mut self, handle: ObjectRef) -> Option<&mut HeapObject> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.object.as_mut())
    }

    pub fn contains(&self, handle: ObjectRef) -> bool {
        self.get(handle).is_some()
    }

    /// Removes an object; its handle and all copies become stale.
    pub fn remove(&mut self, handle: ObjectRef) -> Option<HeapObject> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let object = slot.object.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(object)
    }

    /// Iterates live objects in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectRef, &HeapObject)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.object.as_ref().map(|obj| {
                #[allow(clippy::cast_possible_truncation)]
                let handle = ObjectRef::new(i as u32, slot.generation);
                (handle, obj)
            })
        })
    }

    /// Iterates live objects mutably in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ObjectRef, &mut HeapObject)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| {
            let generation = slot.generation;
            slot.object.as_mut().map(|obj| {
                #[allow(clippy::cast_possible_truncation)]
                let handle = ObjectRef::new(i as u32, generation);
                (handle, obj)
            })
        })
    }
}
