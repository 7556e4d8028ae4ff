//! The root set.
//!
//! Roots come from two places: each mutator's [`RootStack`], whose frames
//! mirror the mutator's scopes, and the heap-wide [`GlobalRoots`] table that
//! plays the role of static fields.

use crate::object::ObjectRef;

// ============================================================================
// RootStack - per-mutator frame slots
// ============================================================================

/// A shadow stack of rooted handles with frame markers.
#[derive(Debug, Default)]
pub(crate) struct RootStack {
    roots: Vec<ObjectRef>,
    frame_markers: Vec<usize>,
}

impl RootStack {
    pub const fn new() -> Self {
        Self {
            roots: Vec::new(),
            frame_markers: Vec::new(),
        }
    }

    pub fn push(&mut self, handle: ObjectRef) {
        self.roots.push(handle);
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.roots.iter().copied()
    }

    /// Opens a frame and returns its depth.
    pub fn push_frame(&mut self) -> usize {
        self.frame_markers.push(self.roots.len());
        self.frame_markers.len()
    }

    /// Closes the frame at `depth` and every frame opened after it,
    /// unrooting everything they hold.
    pub fn pop_frame(&mut self, depth: usize) {
        debug_assert!(depth >= 1, "frame depths start at 1");
        if depth > self.frame_markers.len() {
            return;
        }
        let marker = self.frame_markers[depth - 1];
        self.frame_markers.truncate(depth - 1);
        self.roots.truncate(marker);
    }
}

// ============================================================================
// GlobalRoots - the static table
// ============================================================================

/// Handle to one slot of the global root table.
///
/// Carries the slot's generation, so an id kept after
/// [`remove_global`](crate::HeapHandle::remove_global) never names a later
/// global that reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalId {
    index: usize,
    generation: u32,
}

#[derive(Debug, Default)]
struct GlobalSlot {
    generation: u32,
    handle: Option<ObjectRef>,
}

/// Heap-wide root slots, reused after removal.
#[derive(Debug, Default)]
pub(crate) struct GlobalRoots {
    slots: Vec<GlobalSlot>,
    free: Vec<usize>,
}

impl GlobalRoots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: ObjectRef) -> GlobalId {
        let index = self.free.pop().unwrap_or_else(|| {
            self.slots.push(GlobalSlot::default());
            self.slots.len() - 1
        });
        let slot = &mut self.slots[index];
        slot.handle = Some(handle);
        GlobalId {
            index,
            generation: slot.generation,
        }
    }

    fn slot_mut(&mut self, id: GlobalId) -> Option<&mut GlobalSlot> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation && slot.handle.is_some())
    }

    pub fn get(&self, id: GlobalId) -> Option<ObjectRef> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.handle)
    }

    /// Replaces the handle stored in a live slot.
    pub fn set(&mut self, id: GlobalId, handle: ObjectRef) -> bool {
        let Some(slot) = self.slot_mut(id) else {
            return false;
        };
        slot.handle = Some(handle);
        true
    }

    pub fn remove(&mut self, id: GlobalId) -> Option<ObjectRef> {
        let slot = self.slot_mut(id)?;
        let old = slot.handle.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        old
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.slots.iter().filter_map(|slot| slot.handle)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(i: u32) -> ObjectRef {
        ObjectRef::new(i, 0)
    }

    #[test]
    fn test_frames_truncate_roots() {
        let mut stack = RootStack::new();
        stack.push(handle(1));
        let outer = stack.push_frame();
        stack.push(handle(2));
        let inner = stack.push_frame();
        stack.push(handle(3));
        assert_eq!(stack.len(), 3);

        stack.pop_frame(inner);
        assert_eq!(stack.iter().collect::<Vec<_>>(), vec![handle(1), handle(2)]);

        stack.pop_frame(outer);
        assert_eq!(stack.iter().collect::<Vec<_>>(), vec![handle(1)]);
    }

    #[test]
    fn test_popping_outer_frame_closes_inner() {
        let mut stack = RootStack::new();
        let outer = stack.push_frame();
        stack.push(handle(1));
        let inner = stack.push_frame();
        stack.push(handle(2));

        stack.pop_frame(outer);
        assert_eq!(stack.len(), 0);
        // Already closed by the outer pop.
        stack.pop_frame(inner);
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn test_global_slots_are_reused() {
        let mut globals = GlobalRoots::new();
        let a = globals.insert(handle(1));
        let b = globals.insert(handle(2));
        assert_eq!(globals.len(), 2);

        assert_eq!(globals.remove(a), Some(handle(1)));
        assert_eq!(globals.remove(a), None);
        assert_eq!(globals.get(a), None);

        let c = globals.insert(handle(3));
        assert_ne!(c, a);
        assert!(globals.set(b, handle(4)));
        assert_eq!(globals.iter().collect::<Vec<_>>(), vec![handle(3), handle(4)]);
        assert_eq!(globals.len(), 2);
    }

    #[test]
    fn test_stale_global_id_does_not_alias_reused_slot() {
        let mut globals = GlobalRoots::new();
        let stale = globals.insert(handle(1));
        globals.remove(stale);
        let fresh = globals.insert(handle(2));

        assert_eq!(globals.get(stale), None);
        assert!(!globals.set(stale, handle(3)));
        assert_eq!(globals.remove(stale), None);
        assert_eq!(globals.get(fresh), Some(handle(2)));
        assert_eq!(globals.iter().collect::<Vec<_>>(), vec![handle(2)]);
    }
}
