use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::{Duration, Instant};
use stratum_pool_core::jobs::merkle::merkle_branch;
use stratum_pool_core::vardiff::{VarDiffConfig, VarDiffState};

fn sample_txids(n: usize) -> Vec<[u8; 32]> {
    (0..n)
        .map(|i| {
            let mut h = [0u8; 32];
            h[0] = (i & 0xff) as u8;
            h[1] = ((i >> 8) & 0xff) as u8;
            h
        })
        .collect()
}

fn benchmark_merkle_branch(c: &mut Criterion) {
    let mut group = c.benchmark_group("merkle_branch");
    for size in [1usize, 16, 256, 2048] {
        let txids = sample_txids(size);
        group.bench_function(format!("{size}_transactions"), |b| {
            b.iter(|| black_box(merkle_branch(black_box(&txids))))
        });
    }
    group.finish();
}

fn benchmark_vardiff_on_share(c: &mut Criterion) {
    let cfg = VarDiffConfig {
        target_share_time: Duration::from_secs(15),
        retarget_time: Duration::from_secs(30),
        variance: 0.25,
        min_difficulty: 64,
        max_difficulty: 10_000_000_000,
        initial_difficulty: 8192,
        retarget_share_count: 20,
    };

    c.bench_function("vardiff_on_share_steady_state", |b| {
        b.iter_batched(
            || VarDiffState::new(cfg),
            |mut state| {
                let start = Instant::now();
                let mut difficulty = state.initial_difficulty();
                for i in 0..40u64 {
                    let now = start + Duration::from_millis(i * 750);
                    if let Some(next) = state.on_share(black_box(now), true, difficulty) {
                        difficulty = next;
                    }
                }
                black_box(difficulty)
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, benchmark_merkle_branch, benchmark_vardiff_on_share);
criterion_main!(benches);
