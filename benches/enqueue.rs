use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use spool::{PublishedMessage, Qos, QueueRepository, Record, RepositoryConfig};

const ENQUEUES_PER_ITER: usize = 10_000;

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");
    for &size in &[64_usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    let repo = QueueRepository::open(RepositoryConfig::segmented(dir.path()))
                        .expect("repo");
                    let queue = repo.get_or_create_queue("bench").expect("queue");
                    let record = Record::Published(PublishedMessage::new(
                        "bench/topic",
                        Qos::AtLeastOnce,
                        vec![0u8; size],
                    ));
                    (dir, repo, queue, record)
                },
                |(_dir, _repo, queue, record)| {
                    for _ in 0..ENQUEUES_PER_ITER {
                        queue.enqueue(black_box(record.clone())).expect("enqueue");
                    }
                    queue.force().expect("force");
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_enqueue);
criterion_main!(benches);
