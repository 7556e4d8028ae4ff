//! Integration tests for per-collection and cumulative metrics.

use std::time::Duration;

use refgc::{CollectionCause, ElementKind, GcConfig, Heap, TypeDescriptor};

fn heap() -> Heap {
    Heap::new(GcConfig::with_capacity(1 << 20)).unwrap()
}

/// Phase timings sum to no more than the total pause.
#[test]
fn test_phase_timing_sums_approximately() {
    let heap = heap();
    let m = heap.bind_mutator();
    let ty = TypeDescriptor::instance("Leaf", 0, 16).into_ref();
    for _ in 0..100 {
        m.alloc(&ty).unwrap();
    }

    let metrics = heap.collect().unwrap();
    let total_phase_time = metrics.clear_duration
        + metrics.mark_duration
        + metrics.reference_duration
        + metrics.finalization_duration
        + metrics.sweep_duration;
    assert!(
        total_phase_time <= metrics.duration + Duration::from_micros(100),
        "phases took {total_phase_time:?}, the collection {:?}",
        metrics.duration
    );
    assert!(metrics.duration > Duration::ZERO);
}

#[test]
fn test_metrics_populated_after_collection() {
    let heap = heap();
    assert_eq!(heap.last_gc_metrics().cause, None);

    let m = heap.bind_mutator();
    let ty = TypeDescriptor::instance("Leaf", 0, 16).into_ref();
    for _ in 0..50 {
        m.alloc(&ty).unwrap();
    }
    heap.collect().unwrap();

    let metrics = heap.last_gc_metrics();
    assert_eq!(metrics.cause, Some(CollectionCause::Explicit));
    assert_eq!(metrics.total_collections, 1);
    assert_eq!(metrics.objects_marked, 50);
    assert_eq!(metrics.objects_surviving, 50);
    assert!(metrics.bytes_surviving >= 50 * 16);
}

#[test]
fn test_bytes_accounting() {
    let heap = heap();
    let m = heap.bind_mutator();
    let bytes = TypeDescriptor::array("byte[]", ElementKind::Byte).into_ref();

    let used_before = heap.usage().used();
    {
        let _frame = m.frame();
        for _ in 0..10 {
            m.alloc_array(&bytes, 100).unwrap();
        }
        m.alloc_array(&bytes, 64 * 1024).unwrap();
    }
    assert!(heap.usage().used() > used_before);

    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.objects_reclaimed, 11);
    assert!(metrics.bytes_reclaimed >= 10 * 100 + 64 * 1024);
    assert_eq!(heap.usage().used(), used_before);
    assert_eq!(heap.free_memory(), heap.total_memory());
}

#[test]
fn test_cumulative_metrics_accumulate() {
    let heap = heap();
    let m = heap.bind_mutator();
    let ty = TypeDescriptor::instance("Leaf", 0, 16).into_ref();

    for round in 1..=4 {
        {
            let _frame = m.frame();
            for _ in 0..10 {
                m.alloc(&ty).unwrap();
            }
        }
        heap.collect().unwrap();
        assert_eq!(heap.metrics().total_collections(), round);
        assert_eq!(heap.metrics().total_objects_reclaimed(), round * 10);
    }
    assert!(heap.metrics().total_pause_ns() >= heap.metrics().max_pause_ns());
    assert!(heap.metrics().max_pause_ns() > 0);
}

#[test]
fn test_history_keeps_recent_collections() {
    let heap = heap();
    for _ in 0..70 {
        heap.collect().unwrap();
    }
    let history = heap.gc_history();
    assert_eq!(history.total_recorded(), 70);

    let recent = history.recent(5);
    assert_eq!(recent.len(), 5);
    let counts: Vec<usize> = recent.iter().map(|m| m.total_collections).collect();
    assert_eq!(counts, vec![66, 67, 68, 69, 70]);

    // The ring holds at most 64 entries.
    assert_eq!(history.recent(1000).len(), 64);
    assert!(history.max_pause_time(10) >= history.average_pause_time(10));
}

#[test]
fn test_usage_reports_both_spaces() {
    let heap = Heap::new(
        GcConfig::default()
            .with_small_space_bytes(256 * 1024)
            .with_large_space_bytes(512 * 1024),
    )
    .unwrap();
    let usage = heap.usage();
    assert_eq!(usage.small.capacity, 256 * 1024);
    assert_eq!(usage.large.capacity, 512 * 1024);
    assert_eq!(usage.capacity(), heap.total_memory());
    assert_eq!(usage.free(), heap.free_memory());
}
