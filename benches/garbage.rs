//! Garbage distribution benchmarks

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use blockfall::game::garbage::{GarbageConfig, GarbageLedger};
use blockfall::ParticipantId;

fn targets(n: u8) -> Vec<ParticipantId> {
    (1..=n).map(|i| ParticipantId::from_bytes([i; 16])).collect()
}

fn bench_distribute(c: &mut Criterion) {
    let mut group = c.benchmark_group("garbage-distribute");

    for count in [1u8, 3, 7, 15] {
        let ids = targets(count);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(format!("{}-targets", count), |b| {
            b.iter_batched_ref(
                || GarbageLedger::new(GarbageConfig::default()),
                |ledger| {
                    for amount in 1..=10 {
                        black_box(ledger.distribute(amount, &ids, true));
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("garbage-flush");
    let ids = targets(15);

    group.bench_function("15-carries", |b| {
        b.iter_batched_ref(
            || {
                let mut ledger = GarbageLedger::new(GarbageConfig::default());
                // leave fractional carries and capped remainders behind
                for _ in 0..4 {
                    ledger.distribute(3, &ids, false);
                    ledger.distribute(200, &ids[..1], false);
                }
                ledger
            },
            |ledger| {
                black_box(ledger.flush());
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_distribute, bench_flush);
criterion_main!(benches);
