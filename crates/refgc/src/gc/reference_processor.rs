//! Reference processing.
//!
//! Runs inside the pause, after strong marking:
//!
//! 1. Soft referents selected by [`SoftRefPolicy`] are marked, together with
//!    everything they reach.
//! 2. Soft and weak records whose referent is still unmarked are cleared and
//!    enqueued.
//! 3. After finalization discovery has marked the objects it keeps alive,
//!    phantom records whose referent is still unmarked are enqueued. A
//!    referent with a pending finalizer is marked at that point, so its
//!    phantoms wait until a later collection finds it dead after finalizing.

use crate::config::GcConfig;
use crate::gc::mark::{is_marked, Tracer};
use crate::gc::CollectionCause;
use crate::heap::HeapUsage;
use crate::object::{ObjectRef, ObjectTable};
use crate::reference::{Reference, ReferenceKind, ReferenceRegistry, ReferenceState};

/// Retention policy for soft referents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SoftRefPolicy {
    /// A referent read within this many collections is retained.
    pub lru_cycles: u64,
    /// Retention only applies while at least this fraction of the heap is
    /// free.
    pub min_free_ratio: f64,
}

impl SoftRefPolicy {
    pub const fn from_config(config: &GcConfig) -> Self {
        Self {
            lru_cycles: config.soft_ref_lru_cycles,
            min_free_ratio: config.soft_ref_min_free_ratio,
        }
    }

    /// Whether any soft referent may be retained in this collection.
    /// Allocation-failure collections clear every soft reference.
    #[allow(clippy::cast_precision_loss)]
    pub fn retention_enabled(&self, cause: CollectionCause, usage: &HeapUsage) -> bool {
        if cause == CollectionCause::AllocationFailure {
            return false;
        }
        let capacity = usage.capacity();
        if capacity == 0 {
            return false;
        }
        usage.free() as f64 / capacity as f64 >= self.min_free_ratio
    }

    pub const fn retains(&self, last_access: u64, cycle: u64) -> bool {
        cycle.saturating_sub(last_access) <= self.lru_cycles
    }
}

/// Counts from one processing step.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcessStats {
    /// Records whose referent died.
    pub retired: usize,
    /// Of those, records pushed onto a queue.
    pub enqueued: usize,
}

/// Active records of one collection, split by kind.
#[derive(Debug, Default)]
pub(crate) struct ReferenceProcessor {
    soft: Vec<Reference>,
    weak: Vec<Reference>,
    phantom: Vec<Reference>,
}

impl ReferenceProcessor {
    /// Snapshots the registry's active records.
    pub fn scan(registry: &ReferenceRegistry) -> Self {
        let mut processor = Self::default();
        for reference in registry.active() {
            match reference.kind() {
                ReferenceKind::Soft => processor.soft.push(reference),
                ReferenceKind::Weak => processor.weak.push(reference),
                ReferenceKind::Phantom => processor.phantom.push(reference),
            }
        }
        processor
    }

    /// Greys the unmarked referents of recently read soft records. The
    /// caller drains the tracer afterwards.
    pub fn retain_soft(
        &self,
        tracer: &mut Tracer,
        objects: &mut ObjectTable,
        policy: &SoftRefPolicy,
        cycle: u64,
    ) -> usize {
        let mut retained = 0;
        for reference in &self.soft {
            let referent = {
                let slot = reference.inner_slot();
                if slot.state != ReferenceState::Active || !policy.retains(slot.last_access, cycle) {
                    continue;
                }
                slot.referent
            };
            if let Some(referent) = referent {
                if tracer.mark(objects, referent) {
                    retained += 1;
                }
            }
        }
        retained
    }

    /// Clears and enqueues soft and weak records with unmarked referents.
    pub fn process_soft_and_weak(&self, objects: &ObjectTable) -> ProcessStats {
        retire_dead(self.soft.iter().chain(&self.weak), objects)
    }

    /// Enqueues phantom records with unmarked referents.
    pub fn process_phantom(&self, objects: &ObjectTable) -> ProcessStats {
        retire_dead(self.phantom.iter(), objects)
    }
}

fn referent_of(reference: &Reference) -> Option<ObjectRef> {
    let slot = reference.inner_slot();
    if slot.state == ReferenceState::Active {
        slot.referent
    } else {
        None
    }
}

fn retire_dead<'a>(
    references: impl Iterator<Item = &'a Reference>,
    objects: &ObjectTable,
) -> ProcessStats {
    let mut stats = ProcessStats::default();
    for reference in references {
        let Some(referent) = referent_of(reference) else {
            continue;
        };
        if is_marked(objects, referent) {
            continue;
        }
        stats.retired += 1;
        if reference.retire() {
            stats.enqueued += 1;
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::SpaceUsage;
    use crate::object::tests::dummy_object;
    use crate::reference::ReferenceQueue;

    fn usage(capacity: usize, used: usize) -> HeapUsage {
        HeapUsage {
            small: SpaceUsage { capacity, used },
            large: SpaceUsage::default(),
        }
    }

    fn make(
        registry: &ReferenceRegistry,
        kind: ReferenceKind,
        referent: ObjectRef,
        queue: Option<&ReferenceQueue>,
        cycle: u64,
    ) -> Reference {
        let r = Reference::new(1, registry.next_id(), kind, referent, queue.cloned(), cycle);
        registry.register(&r);
        r
    }

    #[test]
    fn test_soft_policy() {
        let policy = SoftRefPolicy {
            lru_cycles: 2,
            min_free_ratio: 0.5,
        };
        assert!(policy.retention_enabled(CollectionCause::Explicit, &usage(100, 40)));
        assert!(!policy.retention_enabled(CollectionCause::Explicit, &usage(100, 60)));
        assert!(!policy.retention_enabled(CollectionCause::AllocationFailure, &usage(100, 0)));

        assert!(policy.retains(5, 7));
        assert!(!policy.retains(5, 8));
    }

    #[test]
    fn test_weak_cleared_when_referent_unmarked() {
        let mut objects = ObjectTable::new();
        let live = objects.insert(dummy_object(0));
        let dead = objects.insert(dummy_object(0));
        let registry = ReferenceRegistry::new();
        let queue = ReferenceQueue::new();
        let w_live = make(&registry, ReferenceKind::Weak, live, Some(&queue), 0);
        let w_dead = make(&registry, ReferenceKind::Weak, dead, Some(&queue), 0);

        let mut tracer = Tracer::new();
        tracer.mark(&mut objects, live);
        tracer.drain(&mut objects);

        let processor = ReferenceProcessor::scan(&registry);
        let stats = processor.process_soft_and_weak(&objects);
        assert_eq!(stats, ProcessStats {
            retired: 1,
            enqueued: 1
        });
        assert!(w_live.is_active());
        assert!(w_dead.is_enqueued());
        assert_eq!(queue.poll(), Some(w_dead));

        // A second pass finds nothing new.
        let again = ReferenceProcessor::scan(&registry);
        assert_eq!(again.weak, vec![w_live.clone()]);
        assert_eq!(again.process_soft_and_weak(&objects), ProcessStats::default());
    }

    #[test]
    fn test_recent_soft_referent_retained_with_closure() {
        let mut objects = ObjectTable::new();
        let head = objects.insert(dummy_object(1));
        let tail = objects.insert(dummy_object(0));
        objects.get_mut(head).unwrap().fields[0] = Some(tail);
        let stale = objects.insert(dummy_object(0));

        let registry = ReferenceRegistry::new();
        let recent = make(&registry, ReferenceKind::Soft, head, None, 10);
        let old = make(&registry, ReferenceKind::Soft, stale, None, 1);

        let policy = SoftRefPolicy {
            lru_cycles: 3,
            min_free_ratio: 0.0,
        };
        let processor = ReferenceProcessor::scan(&registry);
        let mut tracer = Tracer::new();
        assert_eq!(processor.retain_soft(&mut tracer, &mut objects, &policy, 11), 1);
        tracer.drain(&mut objects);
        assert!(is_marked(&objects, tail));

        let stats = processor.process_soft_and_weak(&objects);
        assert_eq!(stats.retired, 1);
        assert!(recent.is_active());
        assert!(!old.is_active());
        assert!(!old.refers_to(stale));
    }

    #[test]
    fn test_phantom_waits_for_marking() {
        let mut objects = ObjectTable::new();
        let target = objects.insert(dummy_object(0));
        let registry = ReferenceRegistry::new();
        let queue = ReferenceQueue::new();
        let phantom = make(&registry, ReferenceKind::Phantom, target, Some(&queue), 0);
        let processor = ReferenceProcessor::scan(&registry);

        // Kept alive (e.g. by a pending finalizer): not enqueued.
        let mut tracer = Tracer::new();
        tracer.mark(&mut objects, target);
        tracer.drain(&mut objects);
        assert_eq!(processor.process_phantom(&objects), ProcessStats::default());

        crate::gc::mark::clear_marks(&mut objects);
        let stats = processor.process_phantom(&objects);
        assert_eq!(stats.enqueued, 1);
        assert!(phantom.is_enqueued());
        assert!(phantom.refers_to(target));
    }
}
