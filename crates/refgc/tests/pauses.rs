//! Stop-the-world coordination and pause reporting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use refgc::{GcConfig, Heap, HeapHandle, MutatorId, TypeDescriptor};

fn spawn_looper(
    handle: HeapHandle,
    stop: Arc<AtomicBool>,
    ready: Arc<Barrier>,
) -> JoinHandle<MutatorId> {
    std::thread::spawn(move || {
        let m = handle.bind_mutator();
        let ty = TypeDescriptor::instance("Scratch", 0, 64).into_ref();
        ready.wait();
        while !stop.load(Ordering::Acquire) {
            let _frame = m.frame();
            m.alloc(&ty).unwrap();
            m.safepoint();
        }
        m.id()
    })
}

#[test]
fn test_pause_report_covers_every_stopped_thread() {
    let heap = Heap::new(
        GcConfig::with_capacity(1 << 20)
            .with_pause_threshold(Duration::ZERO)
            .with_collect_threshold(usize::MAX),
    )
    .unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(Barrier::new(3));

    let threads: Vec<_> = (0..2)
        .map(|_| spawn_looper(heap.handle(), Arc::clone(&stop), Arc::clone(&ready)))
        .collect();
    ready.wait();

    for _ in 0..3 {
        assert!(heap.collect().is_some());
    }
    stop.store(true, Ordering::Release);
    let ids: Vec<MutatorId> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    let report = heap.pause_report();
    for id in &ids {
        assert!(
            report.longest_per_thread.iter().any(|(t, _)| t == id),
            "no pause recorded for {id}"
        );
    }
    assert!(!report.system_pauses.is_empty());
    assert!(report.longest_system_pause() > Duration::ZERO);
    for pause in &report.system_pauses {
        assert!(pause.end > pause.start);
    }
}

#[test]
fn test_blocked_thread_does_not_delay_collection() {
    let heap = Heap::new(GcConfig::with_capacity(1 << 20)).unwrap();
    let handle = heap.handle();
    let entered = Arc::new(Barrier::new(2));

    let sleeper = {
        let entered = Arc::clone(&entered);
        std::thread::spawn(move || {
            let m = handle.bind_mutator();
            m.blocking(|| {
                entered.wait();
                std::thread::sleep(Duration::from_secs(2));
            });
            // Leaving the region after the collection is harmless.
            m.safepoint();
        })
    };
    entered.wait();

    let start = Instant::now();
    assert!(heap.collect().is_some());
    assert!(start.elapsed() < Duration::from_secs(1));
    sleeper.join().unwrap();
}

#[test]
fn test_synchronous_request_from_another_thread() {
    let heap = Heap::new(GcConfig::with_capacity(1 << 20)).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(Barrier::new(2));
    let looper = spawn_looper(heap.handle(), Arc::clone(&stop), Arc::clone(&ready));
    ready.wait();

    let requester = {
        let handle = heap.handle();
        std::thread::spawn(move || {
            let m = handle.bind_mutator();
            m.heap().request_collection(true);
        })
    };
    requester.join().unwrap();
    assert!(heap.metrics().total_collections() >= 1);

    stop.store(true, Ordering::Release);
    looper.join().unwrap();
}
