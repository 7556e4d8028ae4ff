//! Weak, soft and phantom reference processing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use refgc::{GcConfig, Heap, ReferenceKind, ReferenceQueue, TypeDescriptor};

fn heap() -> Heap {
    Heap::new(GcConfig::with_capacity(1 << 20)).unwrap()
}

#[test]
fn test_weak_reference_clears_and_enqueues_once() {
    let heap = heap();
    let m = heap.bind_mutator();
    let ty = TypeDescriptor::instance("Target", 0, 16).into_ref();
    let queue = ReferenceQueue::new();

    let weak = {
        let _frame = m.frame();
        let obj = m.alloc(&ty).unwrap();
        m.create_reference(ReferenceKind::Weak, obj, Some(&queue))
            .unwrap()
    };

    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.references_cleared, 1);
    assert_eq!(metrics.references_enqueued, 1);
    assert!(m.reference_get(&weak).is_none());
    assert_eq!(queue.poll(), Some(weak.clone()));

    heap.collect().unwrap();
    heap.collect().unwrap();
    assert!(queue.poll().is_none());
    assert!(!weak.is_enqueued());
}

#[test]
fn test_weak_reference_to_reachable_object_survives() {
    let heap = heap();
    let m = heap.bind_mutator();
    let ty = TypeDescriptor::instance("Target", 0, 16).into_ref();
    let queue = ReferenceQueue::new();

    let obj = m.alloc(&ty).unwrap();
    let weak = m
        .create_reference(ReferenceKind::Weak, obj, Some(&queue))
        .unwrap();
    heap.collect().unwrap();

    assert_eq!(m.reference_get(&weak), Some(obj));
    assert!(weak.is_active());
    assert!(queue.is_empty());
}

#[test]
fn test_reference_get_roots_the_referent() {
    let heap = heap();
    let m = heap.bind_mutator();
    let ty = TypeDescriptor::instance("Target", 0, 16).into_ref();

    let weak = {
        let _frame = m.frame();
        let obj = m.alloc(&ty).unwrap();
        m.create_reference(ReferenceKind::Weak, obj, None).unwrap()
    };
    // Strengthened through `get` before the collection runs.
    let obj = m.reference_get(&weak).unwrap();
    heap.collect().unwrap();
    assert!(m.is_alive(obj));
    assert_eq!(m.reference_get(&weak), Some(obj));
}

#[test]
fn test_clear_is_idempotent_and_suppresses_enqueue() {
    let heap = heap();
    let m = heap.bind_mutator();
    let ty = TypeDescriptor::instance("Target", 0, 16).into_ref();
    let queue = ReferenceQueue::new();

    let weak = {
        let _frame = m.frame();
        let obj = m.alloc(&ty).unwrap();
        m.create_reference(ReferenceKind::Weak, obj, Some(&queue))
            .unwrap()
    };
    weak.clear();
    weak.clear();
    assert!(m.reference_get(&weak).is_none());

    heap.collect().unwrap();
    assert!(queue.poll().is_none());
    weak.clear();
    assert!(!weak.is_enqueued());
}

#[test]
fn test_explicit_enqueue_is_exactly_once() {
    let heap = heap();
    let m = heap.bind_mutator();
    let ty = TypeDescriptor::instance("Target", 0, 16).into_ref();
    let queue = ReferenceQueue::new();

    let weak = {
        let _frame = m.frame();
        let obj = m.alloc(&ty).unwrap();
        m.create_reference(ReferenceKind::Weak, obj, Some(&queue))
            .unwrap()
    };
    assert!(weak.enqueue());
    assert!(!weak.enqueue());
    heap.collect().unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.poll(), Some(weak));
    assert!(queue.poll().is_none());
}

#[test]
fn test_unrelated_queue_polls_none() {
    let heap = heap();
    let m = heap.bind_mutator();
    let ty = TypeDescriptor::instance("Target", 0, 16).into_ref();
    let used = ReferenceQueue::new();
    let unrelated = ReferenceQueue::new();

    {
        let _frame = m.frame();
        let obj = m.alloc(&ty).unwrap();
        let _weak = m
            .create_reference(ReferenceKind::Weak, obj, Some(&used))
            .unwrap();
    }
    heap.collect().unwrap();
    assert!(unrelated.poll().is_none());
}

#[test]
fn test_dropped_reference_is_not_processed() {
    let heap = heap();
    let m = heap.bind_mutator();
    let ty = TypeDescriptor::instance("Target", 0, 16).into_ref();
    let queue = ReferenceQueue::new();

    {
        let _frame = m.frame();
        let obj = m.alloc(&ty).unwrap();
        drop(
            m.create_reference(ReferenceKind::Weak, obj, Some(&queue))
                .unwrap(),
        );
    }
    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.references_cleared, 0);
    assert!(queue.is_empty());
}

#[test]
fn test_soft_reference_retained_while_recently_used() {
    let heap = Heap::new(GcConfig::with_capacity(1 << 20).with_soft_ref_policy(4, 0.0)).unwrap();
    let m = heap.bind_mutator();
    let ty = TypeDescriptor::instance("Cached", 0, 64).into_ref();

    let soft = {
        let _frame = m.frame();
        let obj = m.alloc(&ty).unwrap();
        m.create_reference(ReferenceKind::Soft, obj, None).unwrap()
    };

    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.soft_retained, 1);
    {
        let _frame = m.frame();
        assert!(m.reference_get(&soft).is_some());
    }

    // Left unread, the referent ages out.
    for _ in 0..10 {
        heap.collect().unwrap();
    }
    assert!(m.reference_get(&soft).is_none());
    assert!(!soft.is_active());
}

#[test]
fn test_soft_references_cleared_before_out_of_memory() {
    let heap = Heap::new(GcConfig::with_capacity(64 * 1024).with_soft_ref_policy(1000, 0.0)).unwrap();
    let m = heap.bind_mutator();
    let block = TypeDescriptor::instance("Block", 0, 1000).into_ref();

    let softs: Vec<_> = (0..48)
        .map(|_| {
            let _frame = m.frame();
            let obj = m.alloc(&block).unwrap();
            m.create_reference(ReferenceKind::Soft, obj, None).unwrap()
        })
        .collect();

    // 48 + 32 blocks do not fit in 64 blocks without clearing.
    for _ in 0..32 {
        m.alloc(&block).unwrap();
    }
    let cleared = softs.iter().filter(|s| !s.is_active()).count();
    assert!(cleared >= 16, "only {cleared} soft references were cleared");
    assert!(heap.metrics().allocation_failures() == 0);
}

#[test]
fn test_phantom_get_is_none_and_enqueued_when_unreachable() {
    let heap = heap();
    let m = heap.bind_mutator();
    let ty = TypeDescriptor::instance("Target", 0, 16).into_ref();
    let queue = ReferenceQueue::new();

    let (phantom, obj) = {
        let _frame = m.frame();
        let obj = m.alloc(&ty).unwrap();
        let phantom = m
            .create_reference(ReferenceKind::Phantom, obj, Some(&queue))
            .unwrap();
        assert!(m.reference_get(&phantom).is_none());
        (phantom, obj)
    };
    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.phantoms_retired, 1);
    assert_eq!(queue.poll(), Some(phantom.clone()));
    assert!(phantom.refers_to(obj));
    assert!(!m.is_alive(obj));
}

#[test]
fn test_phantom_enqueued_only_after_finalization() {
    const OBJECTS: usize = 64;

    let heap = heap();
    let m = heap.bind_mutator();
    let finalized = Arc::new(AtomicUsize::new(0));
    let ty = {
        let finalized = Arc::clone(&finalized);
        TypeDescriptor::instance("Tracked", 0, 16)
            .with_finalizer(move |_, _| {
                finalized.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .into_ref()
    };
    let queue = ReferenceQueue::new();

    let phantoms: Vec<_> = {
        let _frame = m.frame();
        (0..OBJECTS)
            .map(|_| {
                let obj = m.alloc(&ty).unwrap();
                m.create_reference(ReferenceKind::Phantom, obj, Some(&queue))
                    .unwrap()
            })
            .collect()
    };

    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.finalizers_queued, OBJECTS);
    assert_eq!(metrics.phantoms_retired, 0);

    let mut enqueued = Vec::new();
    for _ in 0..4 {
        while let Some(phantom) = queue.poll() {
            assert_eq!(
                finalized.load(Ordering::SeqCst),
                OBJECTS,
                "phantom enqueued before every finalizer ran"
            );
            enqueued.push(phantom);
        }
        heap.run_finalization();
        heap.collect().unwrap();
    }
    while let Some(phantom) = queue.poll() {
        enqueued.push(phantom);
    }

    assert_eq!(finalized.load(Ordering::SeqCst), OBJECTS);
    assert_eq!(enqueued.len(), OBJECTS);
    for phantom in &phantoms {
        assert!(enqueued.contains(phantom));
    }
}

#[test]
fn test_queue_remove_wakes_blocked_mutator() {
    let heap = heap();
    let handle = heap.handle();
    let queue = ReferenceQueue::new();
    let ty = TypeDescriptor::instance("Target", 0, 16).into_ref();

    let waiter = {
        let queue = queue.clone();
        let handle = handle.clone();
        std::thread::spawn(move || {
            let m = handle.bind_mutator();
            m.blocking(|| queue.remove(Duration::from_secs(10)))
        })
    };

    let m = heap.bind_mutator();
    let weak = {
        let _frame = m.frame();
        let obj = m.alloc(&ty).unwrap();
        m.create_reference(ReferenceKind::Weak, obj, Some(&queue))
            .unwrap()
    };
    // The waiter sits in a blocking region, so the pause does not wait on it.
    heap.collect().unwrap();
    assert_eq!(waiter.join().unwrap(), Some(weak));
}

#[test]
fn test_reference_from_other_heap_yields_none() {
    let a = heap();
    let b = heap();
    let ma = a.bind_mutator();
    let mb = b.bind_mutator();
    let ty = TypeDescriptor::instance("Target", 0, 16).into_ref();

    let obj = ma.alloc(&ty).unwrap();
    let weak = ma.create_reference(ReferenceKind::Weak, obj, None).unwrap();
    assert_eq!(ma.reference_get(&weak), Some(obj));
    assert!(mb.reference_get(&weak).is_none());
}
