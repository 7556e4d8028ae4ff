//! Benchmark: allocation throughput and full-collection pause time.
//!
//! Measures small and large allocation paths, linked-list marking, and
//! reference processing cost per collection.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use refgc::{ElementKind, GcConfig, Heap, ReferenceKind, ReferenceQueue, TypeDescriptor};
use std::hint::black_box;

fn bench_small_allocation(c: &mut Criterion) {
    let heap = Heap::new(GcConfig::with_capacity(64 << 20)).unwrap();
    let m = heap.bind_mutator();
    let ty = TypeDescriptor::instance("Node", 2, 16).into_ref();

    c.bench_function("alloc_small_1000", |b| {
        b.iter(|| {
            let _frame = m.frame();
            for _ in 0..1000 {
                black_box(m.alloc(&ty).unwrap());
            }
        });
    });
}

fn bench_large_allocation(c: &mut Criterion) {
    let heap = Heap::new(GcConfig::with_capacity(64 << 20)).unwrap();
    let m = heap.bind_mutator();
    let bytes = TypeDescriptor::array("byte[]", ElementKind::Byte).into_ref();

    c.bench_function("alloc_large_64k", |b| {
        b.iter(|| {
            let _frame = m.frame();
            for _ in 0..16 {
                black_box(m.alloc_array(&bytes, 64 * 1024).unwrap());
            }
        });
    });
}

fn bench_collect_live_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect_live_list");
    for len in [100usize, 1_000, 10_000] {
        let heap = Heap::new(GcConfig::with_capacity(64 << 20)).unwrap();
        let m = heap.bind_mutator();
        let node = TypeDescriptor::instance("Node", 1, 8).into_ref();

        let head = m.alloc(&node).unwrap();
        {
            let _frame = m.frame();
            let mut prev = head;
            for _ in 1..len {
                let next = m.alloc(&node).unwrap();
                m.set_field(prev, 0, Some(next)).unwrap();
                prev = next;
            }
        }

        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| black_box(heap.collect()));
        });
    }
    group.finish();
}

fn bench_collect_weak_references(c: &mut Criterion) {
    let heap = Heap::new(GcConfig::with_capacity(64 << 20)).unwrap();
    let m = heap.bind_mutator();
    let ty = TypeDescriptor::instance("Target", 0, 8).into_ref();
    let queue = ReferenceQueue::new();

    c.bench_function("collect_1000_dead_weak_refs", |b| {
        b.iter(|| {
            let refs: Vec<_> = {
                let _frame = m.frame();
                (0..1000)
                    .map(|_| {
                        let obj = m.alloc(&ty).unwrap();
                        m.create_reference(ReferenceKind::Weak, obj, Some(&queue))
                            .unwrap()
                    })
                    .collect()
            };
            black_box(heap.collect());
            while queue.poll().is_some() {}
            drop(refs);
        });
    });
}

criterion_group!(
    benches,
    bench_small_allocation,
    bench_large_allocation,
    bench_collect_live_list,
    bench_collect_weak_references
);
criterion_main!(benches);
