// benches/queue_bench.rs
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::thread;
use taskflow_engine::runtime::TaskQueue;
use ulid::Ulid;

/// Push then drain a full queue on one thread
fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_push_pop");

    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(format!("push_pop_{}", size), &size, |b, &size| {
            let ids: Vec<Ulid> = (0..size).map(|_| Ulid::new()).collect();
            b.iter(|| {
                let queue = TaskQueue::new();
                for (i, id) in ids.iter().enumerate() {
                    queue.push(*id, "general", (i % 10 + 1) as u8);
                }
                while let Some(entry) = queue.try_pop() {
                    black_box(entry);
                }
            })
        });
    }

    group.finish();
}

/// Several producers feeding one consumer
fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_contended");
    let per_producer = 1_000;

    for producers in [2usize, 4, 8] {
        group.throughput(Throughput::Elements((producers * per_producer) as u64));
        group.bench_with_input(format!("producers_{}", producers), &producers, |b, &producers| {
            b.iter(|| {
                let queue = Arc::new(TaskQueue::new());
                let handles: Vec<_> = (0..producers)
                    .map(|p| {
                        let queue = Arc::clone(&queue);
                        thread::spawn(move || {
                            for i in 0..per_producer {
                                queue.push(Ulid::new(), "general", ((p + i) % 10 + 1) as u8);
                            }
                        })
                    })
                    .collect();

                let mut drained = 0;
                while drained < producers * per_producer {
                    if queue.try_pop().is_some() {
                        drained += 1;
                    }
                }
                for handle in handles {
                    handle.join().unwrap();
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_push_pop, bench_contended);
criterion_main!(benches);
