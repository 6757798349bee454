use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rsgc_mark::{
    env::read_uint_from_env, Heap, HeapArguments, Mutator, ObjectKind, ObjectRef, STWMark,
};

fn create_tree(mutator: &Mutator<'_>, depth: usize) -> ObjectRef {
    let node = mutator.allocate(ObjectKind::Regular, 2).unwrap();
    if depth > 0 {
        let left = create_tree(mutator, depth - 1);
        let right = create_tree(mutator, depth - 1);
        mutator.store(node, 0, Some(left)).unwrap();
        mutator.store(node, 1, Some(right)).unwrap();
    }
    node
}

fn heap(depth: usize, workers: usize) -> Heap {
    Heap::new(HeapArguments {
        parallel_gc_threads: workers,
        conc_gc_threads: workers,
        max_objects: 1 << (depth + 1),
        ..Default::default()
    })
    .unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    let _ = env_logger::try_init();
    let depth = read_uint_from_env("DEPTH").unwrap_or(16);
    let mut group = c.benchmark_group("binarytrees");

    for workers in [1, 2, 4] {
        let heap = heap(depth, workers);
        let mutator = heap.attach_thread();
        let tree = create_tree(&mutator, depth);
        mutator.add_root(tree).unwrap();

        group.bench_with_input(BenchmarkId::new("stw", workers), &workers, |b, _| {
            b.iter(|| {
                let _sp = heap.safepoint().begin();
                heap.prepare_gc();
                STWMark::new(&heap).mark();
            })
        });

        group.bench_with_input(BenchmarkId::new("concurrent", workers), &workers, |b, _| {
            b.iter(|| heap.request_gc())
        });
    }

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
