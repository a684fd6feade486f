use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use dhtchat_sync::reconcile::align;

fn prefixes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn bench_align(c: &mut Criterion) {
    let mut group = c.benchmark_group("align");

    for len in [16usize, 64, 256] {
        let target = prefixes(len, 7);
        // Every third message missing on the remote side.
        let source: Vec<u8> = target
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 3 != 0)
            .map(|(_, b)| *b)
            .collect();

        group.bench_with_input(BenchmarkId::new("window", len), &len, |b, _| {
            b.iter(|| align(black_box(&source), black_box(&target)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_align);
criterion_main!(benches);
