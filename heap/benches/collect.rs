use criterion::{black_box, criterion_group, criterion_main, Criterion};

use heap::{
    collect_garbage, AllocationSpace, GcFlags, GcTracer, Heap, HeapConfig,
};
use object::{FixedArray, Value};

/// Build a heap whose old space holds a linked web of arrays: half of
/// them reachable from a root, half garbage.
fn build_graph_heap(node_count: usize) -> Heap {
    let flags = GcFlags { always_compact: true, ..GcFlags::default() };
    let mut heap =
        Heap::with_flags(HeapConfig::default(), flags).expect("heap");

    let mut chain: Option<Value> = None;
    for index in 0..node_count {
        let node = heap
            .allocate_fixed_array(3, AllocationSpace::Old)
            .expect("node");
        // SAFETY: freshly allocated array of length 3
        unsafe {
            let array = &mut *(node.address() as *mut FixedArray);
            array.set(0, Value::from_i64(index as i64));
            // Even nodes chain together and stay reachable; odd nodes
            // are garbage.
            if index % 2 == 0 {
                if let Some(chain) = chain {
                    array.set(1, chain);
                }
                chain = Some(node);
            }
        }
    }
    if let Some(root) = chain {
        heap.handles.push(root);
    }
    heap
}

fn bench_full_collection(c: &mut Criterion) {
    c.bench_function("mark_compact_1k_nodes", |b| {
        let mut heap = build_graph_heap(1000);
        b.iter(|| {
            let mut tracer = GcTracer::new();
            collect_garbage(black_box(&mut heap), &mut tracer);
        });
    });

    c.bench_function("mark_sweep_1k_nodes", |b| {
        let flags = GcFlags { never_compact: true, ..GcFlags::default() };
        let mut heap =
            Heap::with_flags(HeapConfig::default(), flags).expect("heap");
        let root = heap
            .allocate_fixed_array(64, AllocationSpace::Old)
            .expect("root");
        heap.handles.push(root);
        for _ in 0..1000 {
            heap.allocate_fixed_array(3, AllocationSpace::Old);
        }
        b.iter(|| {
            let mut tracer = GcTracer::new();
            collect_garbage(black_box(&mut heap), &mut tracer);
        });
    });
}

criterion_group!(benches, bench_full_collection);
criterion_main!(benches);
